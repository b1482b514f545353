//! # fod-core
//!
//! Core library for the file operations daemon (FOD).
//!
//! The daemon drains two persistent queues (transfer tasks and deletion
//! tasks) produced by an external file operations manager (FOM), executes
//! each task against remote storage endpoints through a grid data-movement
//! gateway, and drives a per-task state machine whose authoritative state
//! lives in the relational task store.
//!
//! ## Building blocks
//!
//! - **Storage gateway**: capability layer over the grid I/O tooling
//!   (`filecopy`, `stat`, `unlink`, `bring_online`, `bring_online_poll`)
//! - **Error classifier**: maps gateway exit codes and message substrings to
//!   success-equivalent, irrecoverable, or retryable dispositions
//! - **Task store**: the `standalone_*` task and batch tables shared with FOM
//! - **Pools**: bounded-concurrency executors per endpoint grouping, each
//!   with a background result collector
//! - **Scheduler**: the 30-second control loop promoting tasks through the
//!   `new → (staging → staged)? → queued → active → {done, failed}` machine
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use fod_core::config::FodConfig;
//! use fod_core::context::DaemonContext;
//! use fod_core::gateway::gfal::GfalGateway;
//! use fod_core::scheduler::Scheduler;
//! use fod_core::store::TaskStore;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = FodConfig::from_env()?;
//! let store = TaskStore::open(config.db_path())?;
//! let gateway = Arc::new(GfalGateway::new(&config));
//! let ctx = Arc::new(DaemonContext::new(store, gateway, &config));
//! Scheduler::new(ctx).run().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cancel;
pub mod classify;
pub mod config;
pub mod context;
pub mod gateway;
pub mod logging;
pub mod pool;
pub mod scheduler;
pub mod store;
pub mod worker;

/// Re-export commonly used types at the crate root.
pub use config::FodConfig;
pub use context::{DaemonContext, SharedContext};
pub use gateway::{OpResult, StorageGateway};
pub use scheduler::Scheduler;
pub use store::TaskStore;
