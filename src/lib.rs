//! fanjoin - run a command across N worker processes without losing record order.
//!
//! Input records are dealt to the workers' stdin in strict rotation and
//! their output is collected in that same rotation, so for commands that
//! answer every record with one record, output order matches input order.
//!
//! ```no_run
//! use fanjoin::JoinConfig;
//! use std::num::NonZeroUsize;
//!
//! let config = JoinConfig::new("tr")
//!     .with_args(["a-z", "A-Z"])
//!     .with_workers(NonZeroUsize::new(4).unwrap());
//! let report = fanjoin::run(&config)?;
//! std::process::exit(report.exit_code());
//! # Ok::<(), fanjoin::JoinError>(())
//! ```

pub mod cli;
pub mod config;
pub mod distributor;
pub mod error;
pub mod escape;
pub mod logging;
pub mod merger;
pub mod orchestrator;
pub mod pipe;
pub mod pool;
pub mod record;
pub mod relay;
pub mod status;
pub mod version;
pub mod worker;

pub use config::{Framing, InputSource, JoinConfig};
pub use error::{JoinError, Result};
pub use orchestrator::{RunReport, run};
