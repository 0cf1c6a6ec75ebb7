// src/lib.rs

//! Dataflow runtime substrate.
//!
//! Actors exchange fixed-width elements through bounded single-writer,
//! multi-reader [`channel`]s. A cooperative [`scheduler`] fires the actors
//! from one thread, [`boundary`] units move bytes between channels and the
//! outside world on their own threads, and [`os`] wraps the kernel threads
//! and condition variables underneath.

pub mod boundary;
pub mod channel;
pub mod config;
pub mod error;
pub mod os;
pub mod pipeline;
pub mod scheduler;
pub mod throughput;
pub mod transport;

pub use boundary::{FailureSlot, SinkUnit, SourceUnit, WaitPolicy};
pub use channel::{ring, ReadPort, RingChannel, WritePort};
pub use config::{RunConfig, RuntimeConfig};
pub use error::{ChannelError, SchedulerError, ThreadError, TransferError, TransferResult};
pub use os::{OsThread, Priority, ThreadBuilder, ThreadHandle, WaitCondition};
pub use pipeline::{Pipeline, Relay, RunSummary};
pub use scheduler::{Actor, ScanStatus, SchedulerLoop, Termination, Yielder};
pub use transport::{ByteTransfer, FileSink, FileSource, LoopCount, SocketTransfer};
