use clap::Parser;
use pferry_core::{AttributeLayout, KeyWidth, Precision, SpatialKey};
use pferry_ferry::{FerryConfig, DEFAULT_CAPACITY};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// --- Error Type ---
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileReadError(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParseError(#[from] serde_json::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// --- Configuration Sections ---

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FerrySettings {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub key_width: KeyWidth,
    #[serde(default = "default_true")]
    pub with_index: bool,
    #[serde(default)]
    pub verify: bool,
}

fn default_capacity() -> usize { DEFAULT_CAPACITY }
fn default_true() -> bool { true }

impl Default for FerrySettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            precision: Precision::default(),
            key_width: KeyWidth::default(),
            with_index: true,
            verify: false,
        }
    }
}

/// Resolution of the stub decomposition used to label particles.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct DecompositionSettings {
    /// Bits per axis of the spatial key
    #[serde(default = "default_key_bits")]
    pub key_bits: u32,
    /// Bits per axis of the partition cell id
    #[serde(default = "default_cell_bits")]
    pub cell_bits: u32,
    /// Side length of the cubic volume, centered on the origin
    #[serde(default = "default_extent")]
    pub extent: f64,
}

fn default_key_bits() -> u32 { 21 }
fn default_cell_bits() -> u32 { 6 }
fn default_extent() -> f64 { 2.0 }

impl Default for DecompositionSettings {
    fn default() -> Self {
        Self {
            key_bits: default_key_bits(),
            cell_bits: default_cell_bits(),
            extent: default_extent(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportSettings {
    /// Messages buffered per rank pair; unbounded when absent, rendezvous at 0
    #[serde(default)]
    pub channel_capacity: Option<usize>,
    /// Receive timeout; receives block indefinitely when absent
    #[serde(default)]
    pub recv_timeout_ms: Option<u64>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputSettings {
    /// Where to write the final particle records as text, if anywhere
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// --- Top-Level Config Struct ---

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Config {
    #[serde(default = "default_ranks")]
    pub ranks: u32,
    #[serde(default = "default_rounds")]
    pub rounds: u32,
    #[serde(default = "default_particles")]
    pub particles_per_rank: usize,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub attributes: AttributeLayout,
    #[serde(default)]
    pub ferry: FerrySettings,
    #[serde(default)]
    pub decomposition: DecompositionSettings,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

fn default_ranks() -> u32 { 4 }
fn default_rounds() -> u32 { 3 }
fn default_particles() -> usize { 10_000 }

impl Default for Config {
    fn default() -> Self {
        Self {
            ranks: default_ranks(),
            rounds: default_rounds(),
            particles_per_rank: default_particles(),
            seed: 0,
            attributes: AttributeLayout::default(),
            ferry: FerrySettings::default(),
            decomposition: DecompositionSettings::default(),
            transport: TransportSettings::default(),
            output: OutputSettings::default(),
        }
    }
}

// --- Helper Methods ---

impl Config {
    /// Ferry settings shared by every rank of the run.
    pub fn ferry_config(&self) -> FerryConfig {
        FerryConfig {
            attributes: self.attributes,
            capacity: self.ferry.capacity,
            precision: self.ferry.precision,
            key_width: self.ferry.key_width,
            with_index: self.ferry.with_index,
            verify: self.ferry.verify,
        }
    }

    pub fn recv_timeout(&self) -> Option<Duration> {
        self.transport.recv_timeout_ms.map(Duration::from_millis)
    }
}

// --- Loading Functions ---

/// Parses a configuration file without validating it. Files ending in
/// `.toml` are parsed as TOML, everything else as JSON.
pub fn parse_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content)?,
        _ => serde_json::from_str(&content)?,
    };
    Ok(config)
}

/// Reads and validates a configuration file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let config = parse_config(path)?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<(), ConfigError> {
    let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

    if config.ranks < 2 {
        return invalid(format!("At least 2 ranks are required, got {}.", config.ranks));
    }
    if config.rounds == 0 {
        return invalid("Round count must be greater than 0.".to_string());
    }
    if config.particles_per_rank > u32::MAX as usize {
        return invalid("Particles per rank must fit in 32 bits.".to_string());
    }
    if config.ferry.capacity == 0 {
        return invalid("Ferry capacity must be greater than 0.".to_string());
    }

    let d = &config.decomposition;
    if d.key_bits == 0 || d.key_bits > SpatialKey::MAX_BITS {
        return invalid(format!("key_bits must be in 1..={}, got {}.", SpatialKey::MAX_BITS, d.key_bits));
    }
    // Cell ids are 32-bit with a placeholder bit.
    if d.cell_bits == 0 || d.cell_bits > SpatialKey::MAX_CELL_BITS || d.cell_bits >= d.key_bits {
        return invalid(format!(
            "cell_bits must be at least 1, at most {} and below key_bits ({}), got {}.",
            SpatialKey::MAX_CELL_BITS, d.key_bits, d.cell_bits
        ));
    }
    if 3 * d.key_bits + 1 > config.ferry.key_width.bits() {
        return invalid(format!(
            "{} bits per axis need wide keys; narrow keys allow at most 21.",
            d.key_bits
        ));
    }
    if !(d.extent > 0.0) {
        return invalid("Decomposition extent must be positive.".to_string());
    }

    Ok(())
}

// --- Command Line ---

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Particle migration runner", long_about = None)]
pub struct CliArgs {
    /// Path to the run configuration file (JSON, or TOML by extension)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of ranks
    #[arg(short, long)]
    pub ranks: Option<u32>,

    /// Number of rebalancing rounds
    #[arg(long)]
    pub rounds: Option<u32>,

    /// Initial particles per rank
    #[arg(short, long)]
    pub particles: Option<usize>,

    /// Records per ferry batch
    #[arg(long)]
    pub capacity: Option<usize>,

    /// Check every batch against the ownership range
    #[arg(long)]
    pub verify: bool,

    /// Write final particle records to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl CliArgs {
    /// Overrides file values with the flags that were given.
    pub fn apply(&self, config: &mut Config) {
        if let Some(ranks) = self.ranks {
            config.ranks = ranks;
        }
        if let Some(rounds) = self.rounds {
            config.rounds = rounds;
        }
        if let Some(particles) = self.particles {
            config.particles_per_rank = particles;
        }
        if let Some(capacity) = self.capacity {
            config.ferry.capacity = capacity;
        }
        if self.verify {
            config.ferry.verify = true;
        }
        if let Some(path) = &self.output {
            config.output.path = Some(path.clone());
        }
    }

    /// Loads the configured file (or defaults), applies overrides and
    /// validates the result.
    pub fn resolve(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => parse_config(path)?,
            None => Config::default(),
        };
        self.apply(&mut config);
        validate(&config)?;
        Ok(config)
    }
}
