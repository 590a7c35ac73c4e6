use serde::{Deserialize, Serialize};

use crate::key::{SpatialKey, SpeciesKey};
use crate::layout::AttributeLayout;

/// One simulated body.
///
/// Physical state is kept in double precision regardless of how the
/// particle is encoded. The self and external potentials are kept apart so
/// the external contribution can be recomputed on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub mass: f64,
    pub pos: [f64; 3],
    pub vel: [f64; 3],
    pub acc: [f64; 3],
    pub pot: f64,
    pub potext: f64,
    /// Integer auxiliary attributes, length fixed per run
    pub iattr: Vec<i32>,
    /// Floating auxiliary attributes, length fixed per run
    pub dattr: Vec<f64>,
    /// Multistep rung
    pub level: u32,
    /// Requested timestep, negative when unset
    pub dtreq: f32,
    /// Length scale hint, negative when unset
    pub scale: f32,
    effort: f32,
    /// Global sequence index
    pub indx: u64,
    /// Partition cell id, zero when unassigned
    pub tree: u32,
    pub key: SpatialKey,
    pub skey: SpeciesKey,
}

impl Particle {
    /// Effort assigned to fresh particles and substituted for any
    /// non-positive estimate.
    pub const EFFORT_DEFAULT: f32 = 1.0e-12;

    /// Creates a zeroed particle with attribute vectors sized to `layout`.
    pub fn new(layout: &AttributeLayout) -> Self {
        Self {
            mass: 0.0,
            pos: [0.0; 3],
            vel: [0.0; 3],
            acc: [0.0; 3],
            pot: 0.0,
            potext: 0.0,
            iattr: vec![0; layout.integer],
            dattr: vec![0.0; layout.float],
            level: 0,
            dtreq: -1.0,
            scale: -1.0,
            effort: Self::EFFORT_DEFAULT,
            indx: 0,
            tree: 0,
            key: SpatialKey::UNASSIGNED,
            skey: SpeciesKey::DEFAULT,
        }
    }

    /// Builder-style setter for the phase-space state.
    pub fn with_state(mut self, mass: f64, pos: [f64; 3], vel: [f64; 3]) -> Self {
        self.mass = mass;
        self.pos = pos;
        self.vel = vel;
        self
    }

    pub fn with_index(mut self, indx: u64) -> Self {
        self.indx = indx;
        self
    }

    pub fn effort(&self) -> f32 {
        self.effort
    }

    /// Sets the cost estimate. Values that are not strictly positive (or
    /// NaN) become [`Particle::EFFORT_DEFAULT`].
    pub fn set_effort(&mut self, effort: f32) {
        self.effort = if effort > 0.0 { effort } else { Self::EFFORT_DEFAULT };
    }

    pub fn add_effort(&mut self, delta: f32) {
        self.set_effort(self.effort + delta);
    }

    /// Self plus external potential, the value persisted on the wire.
    pub fn total_potential(&self) -> f64 {
        self.pot + self.potext
    }

    /// Whether the attribute vectors match `layout`.
    pub fn fits(&self, layout: &AttributeLayout) -> bool {
        self.iattr.len() == layout.integer && self.dattr.len() == layout.float
    }

    /// Resizes the attribute vectors to `layout`, zero filling new slots.
    pub fn conform(&mut self, layout: &AttributeLayout) {
        self.iattr.resize(layout.integer, 0);
        self.dattr.resize(layout.float, 0.0);
    }

    /// Mass is positive and not NaN.
    pub fn has_positive_mass(&self) -> bool {
        self.mass > 0.0
    }

    /// Mass is positive and the index has been assigned.
    pub fn is_sane(&self) -> bool {
        self.indx != 0 && self.has_positive_mass()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_particle_defaults() {
        let p = Particle::new(&AttributeLayout::new(2, 3));
        assert_eq!(p.iattr, vec![0, 0]);
        assert_eq!(p.dattr, vec![0.0; 3]);
        assert_eq!(p.dtreq, -1.0);
        assert_eq!(p.scale, -1.0);
        assert_eq!(p.effort(), Particle::EFFORT_DEFAULT);
        assert!(p.key.is_unassigned());
        assert!(p.skey.is_default());
    }

    #[test]
    fn effort_never_drops_to_zero() {
        let mut p = Particle::new(&AttributeLayout::default());
        p.set_effort(0.0);
        assert!(p.effort() > 0.0);
        p.set_effort(f32::NAN);
        assert!(p.effort() > 0.0);
        p.set_effort(2.5);
        p.add_effort(-10.0);
        assert_eq!(p.effort(), Particle::EFFORT_DEFAULT);
    }

    #[test]
    fn conform_resizes_attributes() {
        let layout = AttributeLayout::new(1, 1);
        let mut p = Particle::new(&AttributeLayout::new(3, 0));
        assert!(!p.fits(&layout));
        p.conform(&layout);
        assert!(p.fits(&layout));
    }

    #[test]
    fn sanity_requires_index_and_mass() {
        let p = Particle::new(&AttributeLayout::default()).with_state(1.0, [0.0; 3], [0.0; 3]);
        assert!(!p.is_sane());
        assert!(p.with_index(7).is_sane());
    }
}
