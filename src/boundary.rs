// src/boundary.rs

//! Boundary units: threads that move bytes between a channel and a
//! [`ByteTransfer`].
//!
//! Each unit runs on its own [`OsThread`] and works in fixed-size bursts.
//! When the channel has no room (source) or not enough data (sink) the unit
//! waits according to its [`WaitPolicy`]:
//!
//! - `Spin` polls with `yield` + `sleep(0)`. Lowest latency, burns a core
//!   under light load.
//! - `Block` sleeps on the channel doorbell until a commit on the other side
//!   wakes it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::channel::{ReadPort, WritePort};
use crate::error::{ThreadError, TransferError, TransferResult};
use crate::os::thread::{self, OsThread, Priority, ThreadBuilder};
use crate::scheduler::Termination;
use crate::throughput::Throughput;
use crate::transport::{send_all, ByteTransfer};

/// How a boundary unit waits on its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitPolicy {
    #[default]
    Spin,
    Block,
}

/// Longest single doorbell wait before re-checking.
const BLOCK_SLICE: Duration = Duration::from_millis(10);

/// A sink sends a short burst once data has sat this long.
const FLUSH_AFTER: Duration = Duration::from_millis(2);

impl WaitPolicy {
    /// Waits until `ready()` holds or `timeout` elapses. `block` is the
    /// doorbell wait used by `Block`. Returns `ready()`.
    fn wait(
        self,
        timeout: Option<Duration>,
        ready: impl Fn() -> bool,
        block: impl Fn(Duration) -> bool,
    ) -> bool {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            if ready() {
                return true;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    remaining.min(BLOCK_SLICE)
                }
                None => BLOCK_SLICE,
            };
            match self {
                WaitPolicy::Spin => {
                    thread::yield_now();
                    thread::sleep(Duration::ZERO);
                }
                WaitPolicy::Block => {
                    block(slice);
                    thread::test_cancel();
                }
            }
        }
    }
}

/// First transfer failure that ended a boundary unit.
///
/// Cloned into every unit of a run; whoever waits for termination takes it.
#[derive(Debug, Clone, Default)]
pub struct FailureSlot(Arc<Mutex<Option<TransferError>>>);

impl FailureSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the first failure; later ones are only logged by their unit.
    fn record(&self, err: TransferError) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Takes the recorded failure, if any.
    pub fn take(&self) -> Option<TransferError> {
        self.0.lock().take()
    }
}

/// Feeds a channel from a byte transfer.
pub struct SourceUnit<B> {
    transfer: B,
    port: WritePort<u8>,
    burst: usize,
    staging: Vec<u8>,
    policy: WaitPolicy,
    termination: Arc<Termination>,
    failure: FailureSlot,
    meter: Throughput,
}

impl<B: ByteTransfer> SourceUnit<B> {
    pub fn new(
        transfer: B,
        port: WritePort<u8>,
        burst: usize,
        policy: WaitPolicy,
        termination: Arc<Termination>,
        failure: FailureSlot,
    ) -> Self {
        // A burst must fit in the ring in one go.
        let burst = burst.clamp(1, port.capacity());
        Self {
            transfer,
            port,
            burst,
            staging: vec![0; burst],
            policy,
            termination,
            failure,
            meter: Throughput::new("source"),
        }
    }

    #[must_use]
    pub fn burst(&self) -> usize {
        self.burst
    }

    /// Bytes pushed into the channel so far.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.meter.total()
    }

    /// Receives one burst and pushes it into the channel, waiting for room.
    ///
    /// # Errors
    ///
    /// Whatever the transfer reports, including `Eof`.
    pub fn pump(&mut self) -> TransferResult<usize> {
        let received = self.transfer.recv(&mut self.staging)?;
        if received == 0 {
            return Ok(0);
        }
        let port = &self.port;
        self.policy.wait(
            None,
            || port.rooms() >= received,
            |slice| port.wait_for_rooms(received, slice),
        );
        let written = self.port.write(&self.staging[..received]);
        debug_assert_eq!(written, received);
        self.meter.record(written);
        Ok(written)
    }

    /// Pumps until the transfer reports end of stream. Returns bytes moved.
    ///
    /// # Errors
    ///
    /// Any transfer failure other than `Eof`.
    pub fn run_until_eof(&mut self) -> TransferResult<u64> {
        loop {
            match self.pump() {
                Ok(_) => {}
                Err(TransferError::Eof) => return Ok(self.total()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Waits until every reader has consumed everything written.
    pub fn drain(&self) {
        let capacity = self.port.capacity();
        let port = &self.port;
        self.policy.wait(
            None,
            || port.rooms() == capacity,
            |slice| port.wait_for_rooms(capacity, slice),
        );
    }

    /// Runs to end of stream, waits for the channel to drain, then
    /// terminates the run. Never returns.
    pub fn run(mut self) -> ! {
        match self.run_until_eof() {
            Ok(total) => info!(
                "Source exhausted after {} bytes ({:.2} MB/s)",
                total,
                self.meter.average()
            ),
            Err(e) => {
                error!("Source failed after {} bytes: {}", self.total(), e);
                self.failure.record(e);
            }
        }
        self.drain();
        debug!("Source channel drained; terminating");
        self.termination.terminate()
    }

    /// Runs the unit on its own thread.
    ///
    /// # Errors
    ///
    /// `ThreadError::Spawn` if the thread cannot be created.
    pub fn spawn(self, name: &str, priority: Priority) -> Result<OsThread<()>, ThreadError>
    where
        B: 'static,
    {
        ThreadBuilder::new()
            .name(name)
            .priority(priority)
            .spawn(move || {
                self.run();
            })
    }
}

/// Drains a channel into a byte transfer.
pub struct SinkUnit<B> {
    transfer: B,
    port: ReadPort<u8>,
    burst: usize,
    policy: WaitPolicy,
    termination: Arc<Termination>,
    failure: FailureSlot,
    meter: Throughput,
}

impl<B: ByteTransfer> SinkUnit<B> {
    pub fn new(
        transfer: B,
        port: ReadPort<u8>,
        burst: usize,
        policy: WaitPolicy,
        termination: Arc<Termination>,
        failure: FailureSlot,
    ) -> Self {
        let burst = burst.clamp(1, port.capacity());
        Self {
            transfer,
            port,
            burst,
            policy,
            termination,
            failure,
            meter: Throughput::new("sink"),
        }
    }

    /// Live count of bytes sent, readable from other threads.
    #[must_use]
    pub fn total_handle(&self) -> Arc<std::sync::atomic::AtomicU64> {
        self.meter.total_handle()
    }

    /// Waits for a full burst (or, after a short pause, whatever arrived),
    /// sends it and commits it. Returns bytes sent, possibly zero.
    ///
    /// # Errors
    ///
    /// Whatever the transfer reports.
    pub fn pump(&mut self) -> TransferResult<usize> {
        let burst = self.burst;
        let port = &self.port;
        let full = self.policy.wait(
            Some(FLUSH_AFTER),
            || port.count() >= burst,
            |slice| port.wait_for_count(burst, slice),
        );
        if !full && port.count() == 0 {
            self.policy.wait(
                Some(BLOCK_SLICE),
                || port.count() > 0,
                |slice| port.wait_for_count(1, slice),
            );
        }

        let window = self.port.read_window();
        let n = window.len().min(burst);
        if n == 0 {
            return Ok(0);
        }
        send_all(&mut self.transfer, &window[..n])?;
        // Count before releasing, so a drained channel implies a final total.
        self.meter.record(n);
        self.port.commit_read(n);
        Ok(n)
    }

    /// Pumps until the transfer fails, records the failure and terminates
    /// the run. Never returns.
    ///
    /// Nothing drains the channel after the sink stops, so a failed sink
    /// always ends the run.
    pub fn run(mut self) -> ! {
        let err = loop {
            if let Err(e) = self.pump() {
                break e;
            }
        };
        error!("Sink failed after {} bytes: {}", self.meter.total(), err);
        self.failure.record(err);
        self.termination.terminate()
    }

    /// Runs the unit on its own thread.
    ///
    /// # Errors
    ///
    /// `ThreadError::Spawn` if the thread cannot be created.
    pub fn spawn(self, name: &str, priority: Priority) -> Result<OsThread<()>, ThreadError>
    where
        B: 'static,
    {
        ThreadBuilder::new()
            .name(name)
            .priority(priority)
            .spawn(move || {
                self.run();
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ring;
    use test_log::test;

    /// In-memory transfer: `recv` replays `input` in `chunk`-sized pieces,
    /// `send` appends to `output`.
    struct Memory {
        input: Vec<u8>,
        pos: usize,
        chunk: usize,
        output: Arc<Mutex<Vec<u8>>>,
    }

    impl Memory {
        fn source(input: &[u8], chunk: usize) -> Self {
            Self {
                input: input.to_vec(),
                pos: 0,
                chunk,
                output: Arc::default(),
            }
        }

        fn sink(output: Arc<Mutex<Vec<u8>>>) -> Self {
            Self {
                input: Vec::new(),
                pos: 0,
                chunk: 3,
                output,
            }
        }
    }

    impl ByteTransfer for Memory {
        fn recv(&mut self, buf: &mut [u8]) -> TransferResult<usize> {
            if self.pos == self.input.len() {
                return Err(TransferError::Eof);
            }
            let n = buf.len().min(self.chunk).min(self.input.len() - self.pos);
            buf[..n].copy_from_slice(&self.input[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        fn send(&mut self, buf: &[u8]) -> TransferResult<usize> {
            // Partial sends exercise send_all.
            let n = buf.len().min(self.chunk);
            self.output.lock().extend_from_slice(&buf[..n]);
            Ok(n)
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn source_to_sink(policy: WaitPolicy) {
        let data = payload(10_000);
        let (tx, rxs) = ring::<u8>(64, 16, 1).unwrap();
        let rx = rxs.into_iter().next().unwrap();
        let termination = Termination::new();
        let failure = FailureSlot::new();

        let mut source = SourceUnit::new(
            Memory::source(&data, 13),
            tx,
            32,
            policy,
            termination.clone(),
            failure.clone(),
        );
        let output = Arc::new(Mutex::new(Vec::new()));
        let mut sink = SinkUnit::new(
            Memory::sink(output.clone()),
            rx,
            16,
            policy,
            termination,
            failure.clone(),
        );
        let sent = sink.total_handle();

        let expected = data.len() as u64;
        let sink_thread = OsThread::start("sink", move || {
            while sent.load(std::sync::atomic::Ordering::SeqCst) < expected {
                sink.pump().unwrap();
            }
        })
        .unwrap();

        assert_eq!(source.run_until_eof().unwrap(), expected);
        source.drain();
        sink_thread.join().unwrap();
        assert_eq!(*output.lock(), data);
    }

    #[test]
    fn spin_policy_moves_everything_in_order() {
        source_to_sink(WaitPolicy::Spin);
    }

    #[test]
    fn block_policy_moves_everything_in_order() {
        source_to_sink(WaitPolicy::Block);
    }

    #[test]
    fn burst_is_clamped_to_channel_capacity() {
        let (tx, rxs) = ring::<u8>(8, 4, 1).unwrap();
        let source = SourceUnit::new(
            Memory::source(b"abc", 3),
            tx,
            1024,
            WaitPolicy::Spin,
            Termination::new(),
            FailureSlot::new(),
        );
        assert_eq!(source.burst(), 7);
        drop(rxs);
    }

    #[test]
    fn pump_receives_at_most_one_burst() {
        let (tx, rxs) = ring::<u8>(8, 4, 1).unwrap();
        let mut rx = rxs.into_iter().next().unwrap();
        let mut source = SourceUnit::new(
            Memory::source(&payload(100), 100),
            tx,
            1024,
            WaitPolicy::Spin,
            Termination::new(),
            FailureSlot::new(),
        );

        assert_eq!(source.pump().unwrap(), 7);
        let mut buf = [0u8; 8];
        assert_eq!(rx.read(&mut buf), 7);
        assert_eq!(&buf[..7], &payload(100)[..7]);
        assert_eq!(source.pump().unwrap(), 7);
        assert_eq!(source.total(), 14);
    }

    #[test]
    fn sink_flushes_partial_burst() {
        let (mut tx, rxs) = ring::<u8>(64, 16, 1).unwrap();
        let rx = rxs.into_iter().next().unwrap();
        let output = Arc::new(Mutex::new(Vec::new()));
        let mut sink = SinkUnit::new(
            Memory::sink(output.clone()),
            rx,
            32,
            WaitPolicy::Block,
            Termination::new(),
            FailureSlot::new(),
        );

        tx.write(b"tail");
        assert_eq!(sink.pump().unwrap(), 4);
        assert_eq!(*output.lock(), b"tail");
        assert_eq!(sink.pump().unwrap(), 0);
    }

    #[test]
    fn source_terminates_after_drain() {
        let (tx, rxs) = ring::<u8>(16, 4, 1).unwrap();
        let mut rx = rxs.into_iter().next().unwrap();
        let termination = Termination::new();
        let source = SourceUnit::new(
            Memory::source(b"0123456789", 4),
            tx,
            4,
            WaitPolicy::Block,
            termination.clone(),
            FailureSlot::new(),
        );
        let thread = source.spawn("source", Priority::Normal).unwrap();

        let mut got = Vec::new();
        let mut buf = [0u8; 8];
        while got.len() < 10 {
            let n = rx.read(&mut buf);
            got.extend_from_slice(&buf[..n]);
            std::thread::yield_now();
        }
        assert_eq!(got, b"0123456789");
        assert!(termination.wait_timeout(Duration::from_secs(5)));

        thread.cancel();
        assert!(matches!(thread.join(), Err(ThreadError::Cancelled(_))));
    }

    /// Accepts nothing: every send fails like a full disk.
    struct Full;

    impl ByteTransfer for Full {
        fn recv(&mut self, _buf: &mut [u8]) -> TransferResult<usize> {
            Err(TransferError::Eof)
        }

        fn send(&mut self, _buf: &[u8]) -> TransferResult<usize> {
            Err(std::io::Error::from_raw_os_error(libc::ENOSPC).into())
        }
    }

    #[test]
    fn sink_failure_is_recorded_and_terminates_run() {
        let (mut tx, rxs) = ring::<u8>(64, 16, 1).unwrap();
        let rx = rxs.into_iter().next().unwrap();
        let termination = Termination::new();
        let failure = FailureSlot::new();
        let sink = SinkUnit::new(
            Full,
            rx,
            8,
            WaitPolicy::Block,
            termination.clone(),
            failure.clone(),
        );
        let thread = sink.spawn("sink", Priority::Normal).unwrap();

        tx.write(&[1; 8]);
        assert!(termination.wait_timeout(Duration::from_secs(5)));
        match failure.take() {
            Some(TransferError::Io(e)) => assert_eq!(e.raw_os_error(), Some(libc::ENOSPC)),
            other => panic!("expected recorded io failure, got {other:?}"),
        }
        // Nothing was sent, so nothing was released.
        assert_eq!(tx.rooms(), 63 - 8);

        thread.cancel();
        assert!(matches!(thread.join(), Err(ThreadError::Cancelled(_))));
    }

    #[test]
    fn failure_slot_keeps_first_error() {
        let slot = FailureSlot::new();
        slot.record(TransferError::Eof);
        slot.record(TransferError::FileNotFound("late".into()));
        assert!(slot.take().is_some_and(|e| e.is_eof()));
        assert!(slot.take().is_none());
    }
}
