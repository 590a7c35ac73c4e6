//! One simulated rank: owns a particle set and a ferry, and migrates
//! particles to their owners each round on command from the coordinator.

use crossbeam_channel::{Receiver, Sender};
use hdrhistogram::Histogram;
use log::{debug, trace};
use pferry_config::Config;
use pferry_core::{AttributeLayout, Particle, Rank, SpatialKey};
use pferry_ferry::{Ferry, FerryError, FerryStats};
use pferry_transport::{ChannelEndpoint, Transport};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::time::Instant;

use crate::decomposition::Slabs;

/// Time advanced by one round, in units of the box side per unit velocity.
const ROUND_DT: f64 = 1.0;

pub enum Command {
    Round(u32),
    Stop,
}

pub struct RoundReport {
    pub rank: Rank,
    pub round: u32,
    /// Particles held once the round's migrations are done.
    pub held: usize,
    pub sent: usize,
    pub received: usize,
    /// Session latencies in microseconds.
    pub latencies: Histogram<u64>,
    pub stats: FerryStats,
}

pub type RankResult<T> = Result<T, (Rank, FerryError)>;

pub struct RankWorker {
    rank: Rank,
    ranks: u32,
    key_bits: u32,
    cell_bits: u32,
    lo: f64,
    extent: f64,
    ferry: Ferry<ChannelEndpoint>,
    particles: Vec<Particle>,
    /// Empty histogram carrying the configured precision.
    latency_template: Histogram<u64>,
}

impl RankWorker {
    pub fn new(
        endpoint: ChannelEndpoint,
        config: &Config,
        latency_template: &Histogram<u64>,
    ) -> Result<Self, FerryError> {
        let rank = endpoint.rank();
        let ferry = Ferry::new(endpoint.with_timeout(config.recv_timeout()), config.ferry_config())?;
        let extent = config.decomposition.extent;
        let particles = initial_particles(rank, config);
        debug!("rank {}: generated {} particles", rank, particles.len());

        Ok(Self {
            rank,
            ranks: config.ranks,
            key_bits: config.decomposition.key_bits,
            cell_bits: config.decomposition.cell_bits,
            lo: -extent / 2.0,
            extent,
            ferry,
            particles,
            latency_template: Histogram::<u64>::new_from(latency_template),
        })
    }

    /// Serves round commands until told to stop, reporting after each round.
    /// Returns the particles held at the end.
    pub fn run(
        mut self,
        commands: Receiver<Command>,
        reports: Sender<RankResult<RoundReport>>,
    ) -> Vec<Particle> {
        while let Ok(Command::Round(round)) = commands.recv() {
            let report = self.round(round).map_err(|e| (self.rank, e));
            let failed = report.is_err();
            if reports.send(report).is_err() || failed {
                break;
            }
        }
        self.particles
    }

    /// Drifts, relabels and migrates this rank's particles for one round.
    /// On error the rank keeps every particle it held before the exchange,
    /// plus any that arrived.
    fn round(&mut self, round: u32) -> Result<RoundReport, FerryError> {
        let slabs = Slabs::for_round(self.ranks, self.key_bits, self.cell_bits, round);
        let (lo, extent) = (self.lo, self.extent);

        self.particles.par_iter_mut().for_each(|p| {
            for (x, v) in p.pos.iter_mut().zip(p.vel.iter()) {
                *x = lo + (*x + v * ROUND_DT - lo).rem_euclid(extent);
            }
        });
        let labels: Vec<(SpatialKey, u32)> = self
            .particles
            .par_iter()
            .map(|p| slabs.label(&p.pos, lo, extent))
            .collect();

        let mut outgoing: Vec<Vec<(Particle, SpatialKey)>> = vec![Vec::new(); self.ranks as usize];
        let mut kept = Vec::with_capacity(self.particles.len());
        for (mut p, (key, cell)) in self.particles.drain(..).zip(labels) {
            p.tree = cell;
            let owner = slabs.owner(key);
            if owner == self.rank {
                p.key = key;
                kept.push(p);
            } else {
                outgoing[owner as usize].push((p, key));
            }
        }

        let mut latencies = Histogram::<u64>::new_from(&self.latency_template);
        let exchanged = self.exchange(&slabs, &outgoing, &mut kept, &mut latencies);
        let (sent, received) = match exchanged {
            Ok(counts) => counts,
            Err(e) => {
                kept.extend(outgoing.into_iter().flatten().map(|(p, _)| p));
                self.particles = kept;
                return Err(e);
            }
        };
        trace!("rank {}: round {} sent {} received {}", self.rank, round, sent, received);

        self.particles = kept;
        Ok(RoundReport {
            rank: self.rank,
            round,
            held: self.particles.len(),
            sent,
            received,
            latencies,
            stats: *self.ferry.stats(),
        })
    }

    /// Joins this rank's sessions in the global pair order. Arrivals are
    /// appended to `kept`. Returns the particles sent and received.
    fn exchange(
        &mut self,
        slabs: &Slabs,
        outgoing: &[Vec<(Particle, SpatialKey)>],
        kept: &mut Vec<Particle>,
        latencies: &mut Histogram<u64>,
    ) -> Result<(usize, usize), FerryError> {
        let (mut sent, mut received) = (0, 0);

        // Every rank walks the same ordered pair sequence, so a destination
        // always finds its source at the same step.
        for from in 0..self.ranks {
            for to in 0..self.ranks {
                if from == to || (self.rank != from && self.rank != to) {
                    continue;
                }
                let started = Instant::now();
                if self.rank == from {
                    let batch = &outgoing[to as usize];
                    self.ferry.open(to, from, batch.len() as u32, slabs.range(to))?;
                    for (p, key) in batch {
                        self.ferry.push_relabeled(p, p.indx, *key)?;
                    }
                    sent += batch.len();
                } else {
                    self.ferry.open(to, from, 0, slabs.range(to))?;
                    let arrived = self.ferry.pull_all()?;
                    received += arrived.len();
                    kept.extend(arrived);
                }
                latencies.saturating_record(started.elapsed().as_micros() as u64);
            }
        }
        Ok((sent, received))
    }
}

fn initial_particles(rank: Rank, config: &Config) -> Vec<Particle> {
    let attributes: &AttributeLayout = &config.attributes;
    let n = config.particles_per_rank;
    let half = config.decomposition.extent / 2.0;
    let speed = config.decomposition.extent / 20.0;
    let mass = 1.0 / (n as f64 * config.ranks as f64);
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(rank as u64));

    (0..n)
        .map(|i| {
            let mut axis = |r: f64| rng.gen_range(-r..r);
            let pos = [axis(half), axis(half), axis(half)];
            let vel = [axis(speed), axis(speed), axis(speed)];
            let mut p = Particle::new(attributes)
                .with_state(mass, pos, vel)
                .with_index(((rank as u64) << 40) | (i as u64 + 1));
            if let Some(origin) = p.iattr.first_mut() {
                *origin = rank as i32;
            }
            p.dattr.iter_mut().for_each(|d| *d = rng.gen());
            p
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pferry_transport::ChannelMesh;

    fn worker_for(endpoint: ChannelEndpoint, config: &Config) -> RankWorker {
        let template = Histogram::<u64>::new(3).unwrap();
        RankWorker::new(endpoint, config, &template).unwrap()
    }

    #[test]
    fn failed_exchange_keeps_the_particles() {
        let config = Config { ranks: 2, particles_per_rank: 50, seed: 7, ..Config::default() };
        let mut mesh = ChannelMesh::connect(2);
        drop(mesh.pop());
        let mut worker = worker_for(mesh.pop().unwrap(), &config);

        assert!(worker.round(0).is_err());
        assert_eq!(worker.particles.len(), 50);
        let mut indices: Vec<u64> = worker.particles.iter().map(|p| p.indx).collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), 50);
    }
}
