use pferry_core::{AttributeLayout, KeyWidth, Particle, Precision, SpatialKey};
use pferry_ferry::{Ferry, FerryConfig, OwnershipRange};
use pferry_transport::{ChannelMesh, StreamPeer, Transport};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

/// Random particles whose values survive single precision unchanged
/// (multiples of 1/256 well inside f32 range).
fn random_particles(n: usize, attributes: &AttributeLayout, seed: u64) -> Vec<Particle> {
    let mut rng = StdRng::seed_from_u64(seed);
    let q = |rng: &mut StdRng| rng.gen_range(-4096..4096) as f64 / 256.0;
    (0..n)
        .map(|i| {
            let mut p = Particle::new(attributes)
                .with_state(
                    rng.gen_range(1..1024) as f64 / 256.0,
                    [q(&mut rng), q(&mut rng), q(&mut rng)],
                    [q(&mut rng), q(&mut rng), q(&mut rng)],
                )
                .with_index(i as u64 + 1);
            p.pot = q(&mut rng);
            p.iattr.iter_mut().for_each(|v| *v = rng.gen());
            p.dattr.iter_mut().for_each(|v| *v = q(&mut rng));
            p.level = rng.gen_range(0..8);
            p.set_effort(rng.gen_range(1..100) as f32);
            p.tree = rng.gen_range(1..1000);
            p.key = SpatialKey(rng.gen::<u64>() as u128);
            p
        })
        .collect()
}

fn config(attributes: AttributeLayout, capacity: usize) -> FerryConfig {
    FerryConfig { attributes, capacity, ..FerryConfig::default() }
}

/// Runs one session from rank 0 to rank 1 on separate threads with
/// rendezvous channels, returning what rank 1 received and how many
/// batches rank 0 shipped.
fn migrate(particles: Vec<Particle>, cfg: FerryConfig) -> (Vec<Particle>, usize) {
    let mut mesh = ChannelMesh::connect_bounded(2, Some(0));
    let b = mesh.pop().unwrap().with_timeout(Some(Duration::from_secs(10)));
    let a = mesh.pop().unwrap();
    let total = particles.len() as u32;

    let source = thread::spawn(move || {
        let mut ferry = Ferry::new(a, cfg).unwrap();
        ferry.open(1, 0, total, OwnershipRange::unbounded()).unwrap();
        ferry.push_all(&particles).unwrap();
        assert!(ferry.is_idle());
        ferry.stats().flushes
    });

    let mut ferry = Ferry::new(b, cfg).unwrap();
    let declared = ferry.open(1, 0, 0, OwnershipRange::unbounded()).unwrap();
    assert_eq!(declared, total);
    let received = ferry.pull_all().unwrap();
    assert!(ferry.pull().unwrap().is_none());

    (received, source.join().unwrap())
}

#[test]
fn particles_arrive_in_push_order() {
    let attributes = AttributeLayout::new(3, 2);
    let sent = random_particles(1000, &attributes, 7);
    let (received, flushes) = migrate(sent.clone(), config(attributes, 64));
    assert_eq!(received, sent);
    assert_eq!(flushes, (1000 + 63) / 64);
}

#[test]
fn capacity_boundary_controls_flush_count() {
    let attributes = AttributeLayout::new(1, 1);
    let capacity = 16;

    let exact = random_particles(capacity, &attributes, 1);
    let (received, flushes) = migrate(exact, config(attributes, capacity));
    assert_eq!(received.len(), capacity);
    assert_eq!(flushes, 1);

    let over = random_particles(capacity + 1, &attributes, 2);
    let (received, flushes) = migrate(over, config(attributes, capacity));
    assert_eq!(received.len(), capacity + 1);
    assert_eq!(flushes, 2);
}

#[test]
fn single_precision_wide_keys_without_index() {
    let attributes = AttributeLayout::new(0, 4);
    let cfg = FerryConfig {
        precision: Precision::Single,
        key_width: KeyWidth::Wide,
        with_index: false,
        ..config(attributes, 10)
    };
    let mut sent = random_particles(25, &attributes, 3);
    sent[4].key = SpatialKey(1u128 << 120);
    let (received, _) = migrate(sent.clone(), cfg);

    for (got, want) in received.iter().zip(&sent) {
        assert_eq!(got.indx, 0);
        assert_eq!(got.pos, want.pos);
        assert_eq!(got.dattr, want.dattr);
        assert_eq!(got.key, want.key);
        assert_eq!(got.tree, want.tree);
    }
}

#[test]
fn session_over_tcp() {
    let attributes = AttributeLayout::new(2, 2);
    let cfg = config(attributes, 8);
    let sent = random_particles(30, &attributes, 11);
    let to_send = sent.clone();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let source = thread::spawn(move || {
        let peer = StreamPeer::connect(0, 1, addr).unwrap();
        let mut ferry = Ferry::new(peer, cfg).unwrap();
        ferry.open(1, 0, to_send.len() as u32, OwnershipRange::unbounded()).unwrap();
        ferry.push_all(&to_send).unwrap();
        ferry.stats().bytes_sent
    });

    let mut peer = StreamPeer::accept(1, 0, &listener).unwrap();
    peer.set_timeout(Some(Duration::from_secs(10))).unwrap();
    let mut ferry = Ferry::new(peer, cfg).unwrap();
    ferry.open(1, 0, 0, OwnershipRange::unbounded()).unwrap();
    let received = ferry.pull_all().unwrap();

    assert_eq!(received, sent);
    assert_eq!(source.join().unwrap(), ferry.stats().bytes_received);
    assert_eq!(ferry.transport().rank(), 1);
}

#[test]
fn round_robin_exchange_between_four_ranks() {
    let attributes = AttributeLayout::new(1, 0);
    let ranks = 4u32;
    let per_pair = 5usize;
    let mesh = ChannelMesh::connect(ranks);

    let handles: Vec<_> = mesh
        .into_iter()
        .map(|endpoint| {
            thread::spawn(move || {
                let me = endpoint.rank();
                let mut ferry = Ferry::new(endpoint, config(attributes, 3)).unwrap();
                let mut received = Vec::new();
                for from in 0..ranks {
                    for to in 0..ranks {
                        if from == to || (me != from && me != to) {
                            continue;
                        }
                        if me == from {
                            let mut outgoing = random_particles(per_pair, &attributes, 0);
                            for p in outgoing.iter_mut() {
                                p.iattr[0] = from as i32;
                            }
                            ferry.open(to, from, per_pair as u32, OwnershipRange::unbounded()).unwrap();
                            ferry.push_all(&outgoing).unwrap();
                        } else {
                            ferry.open(to, from, 0, OwnershipRange::unbounded()).unwrap();
                            received.extend(ferry.pull_all().unwrap());
                        }
                    }
                }
                (me, received)
            })
        })
        .collect();

    for handle in handles {
        let (me, received) = handle.join().unwrap();
        assert_eq!(received.len(), per_pair * (ranks as usize - 1));
        assert!(received.iter().all(|p| p.iattr[0] != me as i32));
    }
}
