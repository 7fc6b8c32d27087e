//! Worker-process side: processors, their dispatch tables, and the loop
//! that serves calls from the broker.
//!
//! A worker executable registers its processor factories and hands control
//! to [`run_worker`]:
//!
//! ```no_run
//! use dualproc::worker::{Operations, Processor, WorkerRegistry, run_worker};
//! use dualproc::CallArgs;
//!
//! struct Upper;
//!
//! impl Processor for Upper {
//!     fn operations() -> Operations<Self> {
//!         Operations::new().register("uppercase", |_: &mut Self, args: &CallArgs| {
//!             let text: String = args.get(0, "text")?;
//!             Ok(text.to_uppercase())
//!         })
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let registry = WorkerRegistry::new().register("upper", |_: ()| Ok(Upper));
//!     run_worker(&registry)?;
//!     Ok(())
//! }
//! ```

mod dispatch;
mod registry;
mod run;

pub use dispatch::{Dispatch, Operations, Processor};
pub use registry::WorkerRegistry;
pub use run::{WorkerLoop, run_worker};
