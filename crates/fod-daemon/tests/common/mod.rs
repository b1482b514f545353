//! Test harness for end-to-end daemon flow tests.
//!
//! `TestHarness` wires a scripted storage gateway, an in-memory task
//! database, and a scheduler together, and exposes FOM-style seeding
//! helpers (tasks and batches are inserted the way the manager inserts
//! them, through the shared connection). Tests drive scheduler passes
//! explicitly and wait on row states.

#![allow(dead_code)] // each test binary uses a subset of the harness

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fod_core::classify::Classifier;
use fod_core::config::FodConfig;
use fod_core::context::DaemonContext;
use fod_core::gateway::{
    run_attempts, OpResult, PollStatus, StageRequest, StorageGateway, TransferParams,
};
use fod_core::scheduler::Scheduler;
use fod_core::store::{OpType, TaskRow, TaskStatus, TaskStore};
use fod_core::SharedContext;
use rusqlite::{params, Connection};

/// Scripted gateway: behavior is keyed by PFN so each test declares exactly
/// the failures it needs. Unscripted calls succeed.
#[derive(Default)]
pub struct MockGateway {
    classifier: Classifier,
    /// Destinations that already exist (`stat` exit 0).
    pub existing: Mutex<HashSet<String>>,
    /// Per-destination queue of copy attempt outcomes; empty queue means
    /// success.
    pub copy_script: Mutex<HashMap<String, VecDeque<(i32, String)>>>,
    /// Per-PFN unlink outcome.
    pub unlink_script: Mutex<HashMap<String, (i32, String)>>,
    /// PFNs whose tape recall has completed.
    pub online: Mutex<HashSet<String>>,
    /// Per-PFN bring_online rejection.
    pub stage_errors: Mutex<HashMap<String, String>>,
    /// Artificial latency per copy attempt (holds a worker slot busy).
    pub copy_delay: Mutex<Duration>,
    /// Number of bulk recall requests issued.
    pub bring_online_calls: AtomicUsize,
    /// Chronological call log (`"copy srm://..."`, `"stat srm://..."`).
    pub calls: Mutex<Vec<String>>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    /// Queue `attempts` consecutive failing copy attempts for `destination`.
    pub fn script_copy_failures(&self, destination: &str, attempts: usize, exit: i32, msg: &str) {
        let mut script = self.copy_script.lock().unwrap();
        let queue = script.entry(destination.to_string()).or_default();
        for _ in 0..attempts {
            queue.push_back((exit, msg.to_string()));
        }
    }

    fn copy_once(&self, destination: &str, attempt: usize) -> OpResult {
        let delay = *self.copy_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.record(format!("copy {destination}"));
        let (exit_code, message) = self
            .copy_script
            .lock()
            .unwrap()
            .get_mut(destination)
            .and_then(VecDeque::pop_front)
            .unwrap_or((0, String::new()));
        OpResult {
            exit_code,
            start: Some(1_700_000_000 + attempt as i64),
            finish: Some(1_700_000_001 + attempt as i64),
            message,
            log: format!("copy attempt {attempt} -> {destination}\n"),
        }
    }
}

impl StorageGateway for MockGateway {
    fn filecopy(&self, params: &TransferParams, _source: &str, destination: &str) -> OpResult {
        self.record(format!(
            "copy_params {destination} overwrite={} checksum={}",
            params.overwrite,
            params.checksum.is_some()
        ));
        let mut attempt = 0;
        run_attempts(&self.classifier, OpType::Transfer, || {
            attempt += 1;
            self.copy_once(destination, attempt)
        })
    }

    fn stat(&self, pfn: &str) -> OpResult {
        self.record(format!("stat {pfn}"));
        if self.existing.lock().unwrap().contains(pfn) {
            OpResult {
                exit_code: 0,
                start: Some(1_700_000_000),
                finish: Some(1_700_000_000),
                message: String::new(),
                log: String::new(),
            }
        } else {
            OpResult::failure(2, "No such file or directory")
        }
    }

    fn unlink(&self, pfn: &str) -> OpResult {
        self.record(format!("unlink {pfn}"));
        let (exit_code, message) = self
            .unlink_script
            .lock()
            .unwrap()
            .get(pfn)
            .cloned()
            .unwrap_or((0, String::new()));
        OpResult {
            exit_code,
            start: Some(1_700_000_000),
            finish: Some(1_700_000_002),
            message,
            log: format!("unlink {pfn}\n"),
        }
    }

    fn bring_online(&self, pfns: &[String], _pin: Duration, _timeout: Duration) -> StageRequest {
        let call = self.bring_online_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(format!("bring_online x{}", pfns.len()));
        let stage_errors = self.stage_errors.lock().unwrap();
        StageRequest {
            errors: pfns.iter().map(|pfn| stage_errors.get(pfn).cloned()).collect(),
            token: Some(format!("stage-token-{call}")),
        }
    }

    fn bring_online_poll(&self, pfn: &str, _token: &str) -> PollStatus {
        self.record(format!("poll {pfn}"));
        if self.online.lock().unwrap().contains(pfn) {
            PollStatus::Ready
        } else {
            PollStatus::Pending
        }
    }
}

/// One in-memory daemon: store, context, scheduler, scripted gateway.
pub struct TestHarness {
    pub gateway: Arc<MockGateway>,
    pub ctx: SharedContext,
    pub scheduler: Scheduler,
    conn: Arc<Mutex<Connection>>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: FodConfig) -> Self {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let store = TaskStore::new(Arc::clone(&conn));
        store.init_schema().unwrap();

        let gateway = MockGateway::new();
        let ctx: SharedContext = Arc::new(DaemonContext::new(
            store,
            Arc::clone(&gateway) as Arc<dyn StorageGateway>,
            &config,
        ));
        let scheduler = Scheduler::new(Arc::clone(&ctx));
        Self {
            gateway,
            ctx,
            scheduler,
            conn,
        }
    }

    pub fn store(&self) -> &TaskStore {
        self.ctx.store()
    }

    /// Run SQL the way FOM would, through the shared connection.
    pub fn exec(&self, sql: &str) {
        self.conn.lock().unwrap().execute_batch(sql).unwrap();
    }

    pub fn seed_deletion_batch(&self, batch_id: i64, site: &str) {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO standalone_deletion_batches (batch_id, site) VALUES (?1, ?2)",
                params![batch_id, site],
            )
            .unwrap();
    }

    pub fn seed_deletion_task(&self, id: i64, batch_id: i64, file: &str) {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO deletion_tasks (id, batch_id) VALUES (?1, ?2)",
            params![id, batch_id],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO standalone_deletion_tasks (id, file) VALUES (?1, ?2)",
            params![id, file],
        )
        .unwrap();
    }

    pub fn seed_transfer_batch(&self, batch_id: i64, source_site: &str, dest_site: &str, mss: bool) {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO standalone_transfer_batches
                     (batch_id, source_site, destination_site, mss_source)
                 VALUES (?1, ?2, ?3, ?4)",
                params![batch_id, source_site, dest_site, i64::from(mss)],
            )
            .unwrap();
    }

    pub fn seed_transfer_task(&self, id: i64, batch_id: i64, source: &str, destination: &str) {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO transfer_tasks (id, batch_id) VALUES (?1, ?2)",
            params![id, batch_id],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO standalone_transfer_tasks (id, source, destination) VALUES (?1, ?2, ?3)",
            params![id, source, destination],
        )
        .unwrap();
    }

    pub fn row(&self, op: OpType, id: i64) -> TaskRow {
        self.store().task_row(op, id).unwrap().unwrap()
    }

    /// Wait until the task reaches `status`, panicking after `timeout`.
    pub async fn wait_for_status(&self, op: OpType, id: i64, status: TaskStatus, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.row(op, id).status == status {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {id} did not reach {status} in time (currently {})",
                self.row(op, id).status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until every pool has drained and been recycled.
    pub async fn wait_for_idle(&mut self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let stats = self.scheduler.pass().await.unwrap();
            let quiet = stats.deletions == 0
                && stats.transfers == 0
                && stats.staging_polls == 0
                && stats.stage_requests == 0;
            if quiet && self.scheduler.pool_count() == 0 {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "scheduler did not go idle in time"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Config with test-friendly periods.
pub fn fast_config() -> FodConfig {
    toml::from_str(
        r#"
        [file_operations.daemon]
        max_parallel_links = 2
        collect_interval = "20ms"
        schedule_interval = "50ms"
        "#,
    )
    .unwrap()
}
