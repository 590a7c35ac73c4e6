use clap::Parser;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use env_logger::Env;
use hdrhistogram::Histogram;
use log::{debug, error, info, warn};
use pferry_config::{CliArgs, Config, ConfigError};
use pferry_core::{Codec, CodecError, Particle, Rank};
use pferry_ferry::{FerryError, FerryStats};
use pferry_transport::{ChannelMesh, Transport};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use thiserror::Error;

mod decomposition;
mod rank;

use rank::{Command, RankResult, RankWorker, RoundReport};

#[derive(Error, Debug)]
enum RunnerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("rank {0} failed: {1}")]
    Rank(Rank, FerryError),

    #[error("rank {0} panicked")]
    Panicked(Rank),

    #[error("ranks stopped reporting before round {0} finished")]
    Silent(u32),

    #[error("round {round}: ranks hold {found} particles, expected {expected}")]
    Conservation { round: u32, expected: usize, found: usize },

    #[error("failed to create latency histogram: {0}")]
    Histogram(#[from] hdrhistogram::errors::CreationError),

    #[error("failed to merge latency histograms: {0}")]
    Merge(#[from] hdrhistogram::errors::AdditionError),

    #[error("failed to install Ctrl+C handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("failed to encode output record: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Totals over a finished run.
#[derive(Debug, Default)]
struct RunSummary {
    rounds: u32,
    /// Particles held across all ranks at the end.
    held: usize,
    /// Particles that changed owner, summed over rounds.
    migrated: usize,
    stats: FerryStats,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    info!("Particle Ferry Runner");

    // Parse command line arguments and load configuration
    let args = CliArgs::parse();
    let config = match args.resolve() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", RunnerError::from(e));
            process::exit(1);
        }
    };
    if let Some(path) = &args.config {
        info!("Using configuration from {}", path.display());
    }

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_stop.store(true, Ordering::SeqCst)) {
        warn!("{}", RunnerError::from(e));
    }

    match run(&config, &stop) {
        Ok(summary) => info!(
            "Finished {} rounds: {} particles held, {} migrated, {} batches, {} bytes shipped",
            summary.rounds,
            summary.held,
            summary.migrated,
            summary.stats.flushes,
            summary.stats.bytes_sent
        ),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}

fn run(config: &Config, stop: &AtomicBool) -> Result<RunSummary, RunnerError> {
    let template = Histogram::<u64>::new(3)?;
    let endpoints = ChannelMesh::connect_bounded(config.ranks, config.transport.channel_capacity);
    let (report_tx, report_rx) = unbounded();

    info!(
        "Starting {} ranks with {} particles each, batch capacity {}",
        config.ranks, config.particles_per_rank, config.ferry.capacity
    );

    let mut commands = Vec::with_capacity(endpoints.len());
    let mut handles = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        let rank = endpoint.rank();
        let worker = RankWorker::new(endpoint, config, &template)
            .map_err(|e| RunnerError::Rank(rank, e))?;
        let (command_tx, command_rx) = bounded(1);
        let reports = report_tx.clone();
        let handle = thread::Builder::new()
            .name(format!("rank-{}", rank))
            .spawn(move || worker.run(command_rx, reports))?;
        commands.push(command_tx);
        handles.push((rank, handle));
    }
    drop(report_tx);

    let started = Instant::now();
    let mut latencies = Histogram::<u64>::new_from(&template);
    let mut summary = RunSummary::default();
    let outcome = drive_rounds(config, stop, &commands, &report_rx, &mut latencies, &mut summary);

    for command in &commands {
        let _ = command.try_send(Command::Stop);
    }
    let mut finals = Vec::with_capacity(handles.len());
    for (rank, handle) in handles {
        finals.push(handle.join().map_err(|_| RunnerError::Panicked(rank))?);
    }
    outcome?;

    summary.held = finals.iter().map(Vec::len).sum();
    info!("Ran {} rounds in {:.2?}", summary.rounds, started.elapsed());
    if latencies.len() > 0 {
        info!(
            "Session latency (us): mean {:.1}, p50 {}, p99 {}, max {}",
            latencies.mean(),
            latencies.value_at_quantile(0.5),
            latencies.value_at_quantile(0.99),
            latencies.max()
        );
    }
    if summary.stats.key_errors + summary.stats.cell_errors > 0 {
        warn!(
            "Batch verification found {} stray keys and {} stray cells",
            summary.stats.key_errors, summary.stats.cell_errors
        );
    }

    if let Some(path) = &config.output.path {
        write_particles(path, config, &finals)?;
        info!("Wrote {} particles to {}", summary.held, path.display());
    }

    Ok(summary)
}

/// Commands every rank through each round and checks that no particle was
/// lost or duplicated. Stops early when `stop` is raised.
fn drive_rounds(
    config: &Config,
    stop: &AtomicBool,
    commands: &[Sender<Command>],
    reports: &Receiver<RankResult<RoundReport>>,
    latencies: &mut Histogram<u64>,
    summary: &mut RunSummary,
) -> Result<(), RunnerError> {
    let expected = config.ranks as usize * config.particles_per_rank;
    let mut stats = vec![FerryStats::default(); commands.len()];

    for round in 0..config.rounds {
        if stop.load(Ordering::SeqCst) {
            info!("Interrupted, stopping after {} rounds", round);
            break;
        }
        for command in commands {
            command.send(Command::Round(round)).map_err(|_| RunnerError::Silent(round))?;
        }

        let (mut held, mut moved) = (0, 0);
        for _ in 0..commands.len() {
            let report = reports
                .recv()
                .map_err(|_| RunnerError::Silent(round))?
                .map_err(|(rank, e)| RunnerError::Rank(rank, e))?;
            debug!(
                "rank {}: round {} sent {} received {} now holds {}",
                report.rank, report.round, report.sent, report.received, report.held
            );
            held += report.held;
            moved += report.sent;
            latencies.add(&report.latencies)?;
            stats[report.rank as usize] = report.stats;
        }

        if held != expected {
            return Err(RunnerError::Conservation { round, expected, found: held });
        }
        info!("Round {}: {} particles changed owner", round, moved);
        summary.rounds += 1;
        summary.migrated += moved;
    }

    summary.stats = stats.iter().fold(FerryStats::default(), |mut acc, s| {
        acc.sessions += s.sessions;
        acc.flushes += s.flushes;
        acc.refills += s.refills;
        acc.particles_sent += s.particles_sent;
        acc.particles_received += s.particles_received;
        acc.bytes_sent += s.bytes_sent;
        acc.bytes_received += s.bytes_received;
        acc.key_errors += s.key_errors;
        acc.cell_errors += s.cell_errors;
        acc.bad_records += s.bad_records;
        acc
    });
    Ok(())
}

/// Writes every rank's particles as text records, one per line, in index order.
fn write_particles(path: &Path, config: &Config, finals: &[Vec<Particle>]) -> Result<(), RunnerError> {
    let codec = Codec::new(config.attributes, config.ferry.precision);
    let mut particles: Vec<&Particle> = finals.iter().flatten().collect();
    particles.sort_by_key(|p| p.indx);

    let mut out = BufWriter::new(File::create(path)?);
    for p in particles {
        writeln!(out, "{}", codec.encode_ascii(p, true)?)?;
    }
    out.flush()?;
    Ok(())
}
