//! Ndustria Core - Memoizing pipeline engine
//!
//! Tasks are registered with a [`Pipeline`], fingerprinted from their
//! callable identity and inputs, and executed at most once: results are
//! persisted in a content-addressable [`CacheStore`] and reused by later
//! runs. Views present task results after every task is done. A run can be
//! shared by several workers that split each batch round-robin and meet at
//! barriers.
//!
//! ```no_run
//! use ndustria_core::{callable, Invocation, Output, Pipeline, RunOptions};
//!
//! # fn main() -> ndustria_core::Result<()> {
//! let mut pipeline = Pipeline::new("/tmp/ndustria-cache")?;
//! let a = pipeline.add_task(callable!("five", |_| Ok(Output::Value(5.into()))));
//! let b = pipeline.add_task(callable!("seven", |_| Ok(Output::Value(7.into()))));
//! let sum = pipeline.add_task(
//!     Invocation::new(callable!("sum", |inputs| {
//!         let (x, y): (i64, i64) = (inputs.arg(0)?, inputs.arg(1)?);
//!         Output::value(&(x + y))
//!     }))
//!     .arg(a)
//!     .arg(b),
//! );
//! pipeline.run(RunOptions::default())?;
//! assert_eq!(pipeline.result(sum)?, 12);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod comm;
pub mod config;
pub mod confirm;
pub mod error;
pub mod global;
pub mod logging;
pub mod memory;
pub mod pipeline;
pub mod reporter;
pub mod task;
pub mod view;

pub use cache::{CacheStore, LogTag, Manifest, ManifestEntry, PackSummary, RunLog, UnpackSummary};
pub use comm::{Communicator, FileGroup, LocalGroup, Solo};
pub use config::Config;
pub use confirm::{AssumeNo, AssumeYes, Confirm, Interactive};
pub use error::{CacheError, ConfigError, Error, PipelineError, Result, SyncError};
pub use pipeline::{ClearOutcome, Pipeline, PipelineBuilder, RunOptions, RunSummary};
pub use reporter::{CollectingReporter, TaskEvent, TaskReporter, TaskReporterRegistry, TracingReporter};
pub use task::{Arg, Callable, Fingerprint, Inputs, Invocation, Output, Status, Task, TaskRef};
pub use view::{View, ViewInvocation, ViewRef};
