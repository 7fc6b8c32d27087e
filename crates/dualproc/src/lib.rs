//! Run calls against a single stateful processor living in a second process.
//!
//! This crate provides:
//! - [`Broker`]: spawns the worker process, assigns a key to every call and
//!   lets any number of tasks wait for their results concurrently
//! - [`worker`]: the processor interface and the sequential loop executing
//!   calls inside the worker process
//! - [`ipc`]: the framed wire protocol between the two processes
//!
//! ```no_run
//! use dualproc::{Broker, CallEnvelope, WorkerConfig};
//!
//! # async fn demo() -> dualproc::Result<()> {
//! let broker = Broker::start(WorkerConfig::locate().factory("echo", ())).await?;
//! let result = broker
//!     .submit_and_wait(CallEnvelope::new("echo").arg("hi"))
//!     .await?
//!     .expect("result claimed once");
//! assert_eq!(result.value(), Some(&serde_json::json!("hi")));
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod envelope;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod worker;

pub use broker::Broker;
pub use envelope::{
    ArgumentError, CallArgs, CallEnvelope, CallKey, Failure, FailureKind, ResultEnvelope,
};
pub use error::{Error, Result};
pub use ipc::WorkerConfig;
