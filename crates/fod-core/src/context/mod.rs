//! Shared daemon context.
//!
//! Everything the scheduler, pools, and workers share: the task store, the
//! storage gateway, the classifier, the queued-id sets, the runtime
//! settings snapshot, and the stop flags. Injected explicitly instead of
//! living in module-level globals.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::QueuedIdSet;
use crate::classify::Classifier;
use crate::config::FodConfig;
use crate::gateway::StorageGateway;
use crate::store::{OpType, TaskStore};

/// Shared, reference-counted daemon context.
pub type SharedContext = Arc<DaemonContext>;

/// Runtime settings snapshot taken from the configuration at startup.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    /// Concurrent operations per pool.
    pub max_parallel_links: usize,
    /// Timeout pushed into transfer parameters.
    pub transfer_timeout: Duration,
    /// Overwrite existing destination files.
    pub overwrite: bool,
    /// Proxy swapped in around staging requests.
    pub staging_proxy: Option<PathBuf>,
    /// Scheduler pass period.
    pub schedule_interval: Duration,
    /// Collector scan period.
    pub collect_interval: Duration,
}

impl DaemonSettings {
    /// Snapshot the relevant configuration values.
    #[must_use]
    pub fn from_config(config: &FodConfig) -> Self {
        Self {
            max_parallel_links: config.daemon().max_parallel_links,
            transfer_timeout: config.daemon().transfer_timeout,
            overwrite: config.daemon().overwrite,
            staging_proxy: config.staging_proxy().map(PathBuf::from),
            schedule_interval: config.daemon().schedule_interval,
            collect_interval: config.daemon().collect_interval,
        }
    }
}

/// State shared by the scheduler, the pools, and the workers.
pub struct DaemonContext {
    store: TaskStore,
    gateway: Arc<dyn StorageGateway>,
    classifier: Classifier,
    settings: DaemonSettings,
    transfer_queue: QueuedIdSet,
    deletion_queue: QueuedIdSet,
    stop: AtomicBool,
    hard_stop: AtomicBool,
}

impl DaemonContext {
    /// Build the context from its collaborators and the configuration.
    #[must_use]
    pub fn new(store: TaskStore, gateway: Arc<dyn StorageGateway>, config: &FodConfig) -> Self {
        Self {
            store,
            gateway,
            classifier: Classifier::from_config(&config.classifier),
            settings: DaemonSettings::from_config(config),
            transfer_queue: QueuedIdSet::new(),
            deletion_queue: QueuedIdSet::new(),
            stop: AtomicBool::new(false),
            hard_stop: AtomicBool::new(false),
        }
    }

    /// The task store.
    #[must_use]
    pub const fn store(&self) -> &TaskStore {
        &self.store
    }

    /// The storage gateway.
    #[must_use]
    pub fn gateway(&self) -> Arc<dyn StorageGateway> {
        Arc::clone(&self.gateway)
    }

    /// The error classifier.
    #[must_use]
    pub const fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// The runtime settings snapshot.
    #[must_use]
    pub const fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    /// The queued-id set for one operation type.
    #[must_use]
    pub const fn queued_set(&self, op: OpType) -> &QueuedIdSet {
        match op {
            OpType::Transfer => &self.transfer_queue,
            OpType::Deletion => &self.deletion_queue,
        }
    }

    /// Request a graceful stop: the scheduler exits its loop and pools
    /// drain.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Request a hard stop (signal-triggered): pools terminate their
    /// in-flight work instead of draining.
    pub fn request_hard_stop(&self) {
        self.hard_stop.store(true, Ordering::SeqCst);
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Whether the stop is a hard (terminate) stop.
    #[must_use]
    pub fn hard_stop_requested(&self) -> bool {
        self.hard_stop.load(Ordering::SeqCst)
    }
}
