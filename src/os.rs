// src/os.rs

//! Thin OS layer: kernel threads and condition variables.

pub mod condition;
pub mod thread;

pub use condition::WaitCondition;
pub use thread::{OsThread, Priority, ThreadBuilder, ThreadHandle};
