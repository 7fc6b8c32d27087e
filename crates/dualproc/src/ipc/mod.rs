//! Inter-process communication with the worker process.
//!
//! This module provides the wire protocol and the utilities for locating,
//! spawning and stopping the worker executable.

pub mod protocol;
mod process;

pub use process::{WORKER_BINARY, WORKER_PATH_ENV, WorkerConfig, WorkerProcess};
pub use protocol::{
    Frame, MAX_FRAME_LEN, WireOutcome, WorkerCommand, WorkerResponse, read_message,
    read_message_async, write_frame, write_frame_async, write_message, write_message_async,
};
