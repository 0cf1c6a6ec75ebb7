// src/config.rs

//! Run configuration.
//!
//! Everything a run needs is resolved once at startup into an immutable
//! [`RunConfig`] and passed explicitly to whoever needs it. Command-line
//! tokens supply the paths and limits; an optional JSON file (`--config`)
//! supplies [`RuntimeConfig`] tuning, with defaults for anything missing.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use clap::Parser;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::boundary::WaitPolicy;
use crate::os::Priority;
use crate::transport::LoopCount;

/// Command-line tokens.
#[derive(Debug, Clone, Parser)]
#[command(name = "flowrt", version, about = "Run a dataflow pipeline between two files")]
pub struct CliArgs {
    /// Input file read by the source unit.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output file written by the sink unit.
    #[arg(short, long)]
    pub output: PathBuf,

    /// Auxiliary JSON file with runtime tuning.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Additional passes over the input; -1 loops forever.
    #[arg(short = 'l', long = "loop", allow_hyphen_values = true)]
    pub loop_count: Option<LoopCount>,

    /// Stop after this many bursts have been relayed.
    #[arg(short = 'f', long = "frames")]
    pub frame_limit: Option<u64>,
}

/// Geometry of every channel in the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChannelConfig {
    /// Slots per channel. Must be a power of two.
    pub size: usize,
    /// Shadow slots; longest window guaranteed contiguous.
    pub threshold: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            size: 1 << 16,
            threshold: 4096,
        }
    }
}

/// Tuning read from the auxiliary config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub channel: ChannelConfig,
    /// Bytes per boundary-unit transfer.
    pub burst: usize,
    pub wait_policy: WaitPolicy,
    pub scheduler_priority: Priority,
    pub boundary_priority: Priority,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            channel: ChannelConfig::default(),
            burst: 4096,
            wait_policy: WaitPolicy::Spin,
            scheduler_priority: Priority::Normal,
            boundary_priority: Priority::Normal,
        }
    }
}

impl RuntimeConfig {
    /// Reads and validates a JSON file.
    ///
    /// # Errors
    ///
    /// Unreadable file, malformed JSON, or invalid values.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: RuntimeConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        debug!("Loaded runtime config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    /// # Errors
    ///
    /// Channel geometry that no ring could be built with, a zero burst, or a
    /// burst that cannot fit in a channel.
    pub fn validate(&self) -> Result<()> {
        let channel = &self.channel;
        ensure!(
            channel.size >= 2 && channel.size.is_power_of_two(),
            "channel size {} is not a power of two of at least 2",
            channel.size
        );
        ensure!(
            channel.threshold <= channel.size,
            "channel threshold {} exceeds size {}",
            channel.threshold,
            channel.size
        );
        ensure!(self.burst > 0, "burst must be at least 1");
        ensure!(
            self.burst < self.channel.size,
            "burst {} does not fit in a channel of {} slots",
            self.burst,
            self.channel.size
        );
        Ok(())
    }
}

/// Immutable configuration for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub config_path: Option<PathBuf>,
    pub loop_count: Option<LoopCount>,
    pub frame_limit: Option<u64>,
    pub runtime: RuntimeConfig,
}

impl RunConfig {
    /// Resolves parsed arguments, loading the auxiliary file if given.
    ///
    /// # Errors
    ///
    /// See [`RuntimeConfig::load`].
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let runtime = match &args.config {
            Some(path) => RuntimeConfig::load(path)?,
            None => RuntimeConfig::default(),
        };
        let config = RunConfig {
            input: args.input,
            output: args.output,
            config_path: args.config,
            loop_count: args.loop_count,
            frame_limit: args.frame_limit,
            runtime,
        };
        info!(
            "Run config: {} -> {} (loop {:?}, frames {:?})",
            config.input.display(),
            config.output.display(),
            config.loop_count,
            config.frame_limit
        );
        Ok(config)
    }

    /// Parses command-line tokens (program name first).
    ///
    /// # Errors
    ///
    /// Bad tokens or a bad auxiliary file.
    pub fn from_tokens<I, T>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let args = CliArgs::try_parse_from(tokens).context("Invalid command line")?;
        Self::from_args(args)
    }
}
