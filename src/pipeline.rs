// src/pipeline.rs

//! The `flowrt` pipeline: source unit → [`Relay`] actor → sink unit.
//!
//! ```text
//!  FileSource ──SourceUnit──▶ [input ch] ──Relay──▶ [output ch] ──SinkUnit──▶ FileSink
//!                 thread                 scheduler                 thread
//! ```
//!
//! The run ends when the source has delivered its last byte and the input
//! channel has drained, when the relay has forwarded `frame_limit` bursts, or
//! when either boundary unit fails. Each of them calls `terminate()`;
//! [`Pipeline::wait`] then reports the failure, or waits a bounded time for
//! the sink to empty the output channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::boundary::{FailureSlot, SinkUnit, SourceUnit};
use crate::channel::{ring, ReadPort, RingChannel, WritePort};
use crate::config::RunConfig;
use crate::error::TransferResult;
use crate::os::thread::OsThread;
use crate::scheduler::{Actor, ScanStatus, SchedulerLoop, Termination};
use crate::transport::{FileSink, FileSource};

/// Longest time [`Pipeline::wait`] gives the sink to empty the output channel.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Copies bytes from one channel to another, one burst per firing.
///
/// A firing moves `min(count, rooms, burst)` elements through the channels'
/// windows, so a burst that straddles the end of either ring is still a
/// single copy. After `frame_limit` firings the relay terminates the run.
pub struct Relay {
    input: ReadPort<u8>,
    output: WritePort<u8>,
    burst: usize,
    frames: u64,
    frame_limit: Option<u64>,
    forwarded: Arc<AtomicU64>,
    termination: Arc<Termination>,
}

impl Relay {
    pub fn new(
        input: ReadPort<u8>,
        output: WritePort<u8>,
        burst: usize,
        frame_limit: Option<u64>,
        termination: Arc<Termination>,
    ) -> Self {
        // Windows up to the threshold never need wraparound handling.
        let burst = burst
            .min(input.threshold())
            .min(output.threshold())
            .max(1);
        Self {
            input,
            output,
            burst,
            frames: 0,
            frame_limit,
            forwarded: Arc::new(AtomicU64::new(0)),
            termination,
        }
    }

    #[must_use]
    pub fn burst(&self) -> usize {
        self.burst
    }

    /// Bytes forwarded so far, readable from other threads.
    #[must_use]
    pub fn forwarded_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.forwarded)
    }
}

impl Actor for Relay {
    fn initialize(&mut self) {
        debug!(
            "Relay ready: burst {}, frame limit {:?}",
            self.burst, self.frame_limit
        );
    }

    fn fire(&mut self, status: &mut ScanStatus) {
        if self.frame_limit.is_some_and(|limit| self.frames >= limit) {
            info!(
                "Relay reached frame limit after {} bytes",
                self.forwarded.load(Ordering::Relaxed)
            );
            self.termination.terminate();
        }

        let n = self
            .input
            .count()
            .min(self.output.rooms())
            .min(self.burst);
        if n == 0 {
            return;
        }

        self.output
            .write_window(n)
            .copy_from_slice(self.input.read_window_n(n));
        self.frames += 1;
        self.forwarded.fetch_add(n as u64, Ordering::Relaxed);
        // Output first: once the input looks drained its bytes are downstream.
        self.output.commit_write(n);
        self.input.commit_read(n);
        status.mark_fired();
    }

    fn name(&self) -> &str {
        "relay"
    }
}

/// Totals reported at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub forwarded: u64,
    pub written: u64,
    /// Whether the sink emptied the output channel before the drain timeout.
    pub drained: bool,
}

/// A launched pipeline. Threads keep running until the process exits.
pub struct Pipeline {
    termination: Arc<Termination>,
    output: Arc<RingChannel<u8>>,
    forwarded: Arc<AtomicU64>,
    written: Arc<AtomicU64>,
    failure: FailureSlot,
    threads: Vec<OsThread<()>>,
}

impl Pipeline {
    /// Opens the files named by `config`, builds both channels and starts
    /// the scheduler and boundary threads.
    ///
    /// # Errors
    ///
    /// Unopenable input or output, bad channel geometry, or failure to spawn
    /// a thread.
    pub fn launch(config: &RunConfig) -> Result<Self> {
        let runtime = &config.runtime;
        let source = FileSource::open(&config.input, config.loop_count)
            .with_context(|| format!("Failed to open input {}", config.input.display()))?;
        let sink = FileSink::create(&config.output)
            .with_context(|| format!("Failed to create output {}", config.output.display()))?;

        let geometry = &runtime.channel;
        let (input_tx, input_rx) = ring::<u8>(geometry.size, geometry.threshold, 1)
            .context("Failed to build input channel")?;
        let (output_tx, output_rx) = ring::<u8>(geometry.size, geometry.threshold, 1)
            .context("Failed to build output channel")?;
        let input_rx = single(input_rx)?;
        let output_rx = single(output_rx)?;
        let output = Arc::clone(output_tx.channel());

        let mut scheduler = SchedulerLoop::new();
        let termination = scheduler.termination();
        let relay = Relay::new(
            input_rx,
            output_tx,
            runtime.burst,
            config.frame_limit,
            Arc::clone(&termination),
        );
        let forwarded = relay.forwarded_handle();
        scheduler.register(relay)?;

        let failure = FailureSlot::new();
        let source = SourceUnit::new(
            source,
            input_tx,
            runtime.burst,
            runtime.wait_policy,
            Arc::clone(&termination),
            failure.clone(),
        );
        let sink = SinkUnit::new(
            sink,
            output_rx,
            runtime.burst,
            runtime.wait_policy,
            Arc::clone(&termination),
            failure.clone(),
        );
        let written = sink.total_handle();

        // Consumers first, so nothing waits on a thread that does not exist yet.
        let threads = vec![
            sink.spawn("sink", runtime.boundary_priority)?,
            scheduler.spawn(runtime.scheduler_priority)?,
            source.spawn("source", runtime.boundary_priority)?,
        ];
        info!("Pipeline launched ({} threads)", threads.len());

        Ok(Self {
            termination,
            output,
            forwarded,
            written,
            failure,
            threads,
        })
    }

    #[must_use]
    pub fn termination(&self) -> Arc<Termination> {
        Arc::clone(&self.termination)
    }

    /// Blocks until the run terminates, then gives the sink up to
    /// `drain_timeout` to empty the output channel.
    ///
    /// # Errors
    ///
    /// The first transfer failure of either boundary unit, whether it ended
    /// the run or happened while draining.
    pub fn wait(&self, drain_timeout: Duration) -> TransferResult<RunSummary> {
        self.termination.wait();
        debug!("Run terminated; draining output channel");

        let capacity = self.output.capacity();
        let deadline = Instant::now() + drain_timeout;
        let drained = loop {
            if let Some(err) = self.failure.take() {
                return Err(err);
            }
            if self.output.rooms() == capacity {
                break true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break false;
            }
            self.output
                .wait_for_rooms(capacity, remaining.min(Duration::from_millis(10)));
        };
        if !drained {
            warn!(
                "Output channel still holds {} byte(s) after {:?}",
                self.output.count(0),
                drain_timeout
            );
        }

        Ok(RunSummary {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            drained,
        })
    }

    /// Cancels every pipeline thread at its next cancellation point.
    ///
    /// The binary never needs this since exiting the process ends them.
    pub fn cancel(&self) {
        for thread in &self.threads {
            thread.cancel();
        }
    }
}

fn single<T>(ports: Vec<ReadPort<T>>) -> Result<ReadPort<T>> {
    ports
        .into_iter()
        .next()
        .context("channel was built without a reader")
}
