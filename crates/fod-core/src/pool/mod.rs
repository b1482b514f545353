//! Bounded-concurrency pools.
//!
//! One pool per active endpoint grouping: a source-destination link for
//! transfers, a site for staging polls and deletions. The pool owns a
//! semaphore bounding concurrent workers, the in-flight result list, and a
//! background collector that drains completions into terminal database
//! rows. Pools are created lazily by the scheduler and dropped once the
//! recycler sees them idle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::context::SharedContext;
use crate::gateway::OpResult;
use crate::store::{OpType, StoreError, TaskStatus};
use crate::worker::{Assignment, Outcome};

/// What a pool executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// File copies over one link.
    Transfer,
    /// Staging polls at one source site.
    Staging,
    /// Deletions at one site.
    Deletion,
}

impl PoolKind {
    /// The operation type whose rows this pool finalizes; staging pools
    /// only flip the staging column.
    #[must_use]
    pub const fn op_type(self) -> Option<OpType> {
        match self {
            Self::Transfer => Some(OpType::Transfer),
            Self::Deletion => Some(OpType::Deletion),
            Self::Staging => None,
        }
    }
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transfer => write!(f, "transfer"),
            Self::Staging => write!(f, "staging"),
            Self::Deletion => write!(f, "deletion"),
        }
    }
}

/// Endpoint grouping a pool is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PoolScope {
    /// A source-destination site pair.
    Link {
        /// Source site.
        source: String,
        /// Destination site.
        destination: String,
    },
    /// A single site.
    Site(String),
}

impl std::fmt::Display for PoolScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Link {
                source,
                destination,
            } => write!(f, "{source}->{destination}"),
            Self::Site(site) => f.write_str(site),
        }
    }
}

/// A bounded-concurrency executor plus its collector.
pub struct Pool {
    kind: PoolKind,
    scope: PoolScope,
    ctx: SharedContext,
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
    in_flight: Mutex<Vec<(i64, JoinHandle<Outcome>)>>,
    collector: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Pool {
    /// Create a pool for one endpoint grouping.
    #[must_use]
    pub fn new(
        ctx: SharedContext,
        kind: PoolKind,
        scope: PoolScope,
        max_concurrent: usize,
    ) -> Arc<Self> {
        debug!(kind = %kind, scope = %scope, max_concurrent, "pool created");
        Arc::new(Self {
            kind,
            scope,
            ctx,
            max_concurrent,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Mutex::new(Vec::new()),
            collector: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// The pool's kind.
    #[must_use]
    pub const fn kind(&self) -> PoolKind {
        self.kind
    }

    /// The pool's endpoint grouping.
    #[must_use]
    pub const fn scope(&self) -> &PoolScope {
        &self.scope
    }

    /// The concurrency bound this pool was created with.
    #[must_use]
    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Vec<(i64, JoinHandle<Outcome>)>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_collector(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.collector.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit a task.
    ///
    /// Transfer and deletion submissions write `queued` and register the id
    /// in the shared queued set before the worker can start; staging polls
    /// skip that bookkeeping. Restarts the collector if it has exited.
    ///
    /// # Errors
    ///
    /// Returns an error if the `queued` transition fails.
    pub fn add_task(self: &Arc<Self>, id: i64, assignment: Assignment) -> Result<(), StoreError> {
        if let Some(op) = assignment.op_type() {
            self.ctx.store().mark_queued(op, id)?;
            self.ctx.queued_set(op).insert(id);
        }

        let ctx = Arc::clone(&self.ctx);
        let semaphore = Arc::clone(&self.semaphore);
        let handle = tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return Outcome::Cancelled;
            };
            assignment.execute(&ctx, id).await
        });

        self.lock_in_flight().push((id, handle));
        self.ensure_collector();
        Ok(())
    }

    fn ensure_collector(self: &Arc<Self>) {
        let mut guard = self.lock_collector();
        let running = guard.as_ref().is_some_and(|handle| !handle.is_finished());
        if !running {
            let pool = Arc::clone(self);
            *guard = Some(tokio::spawn(async move {
                pool.collect_loop().await;
            }));
        }
    }

    async fn collect_loop(&self) {
        loop {
            if self.ctx.stop_requested() {
                debug!(kind = %self.kind, scope = %self.scope, "collector parked by stop flag");
                return;
            }
            tokio::time::sleep(self.ctx.settings().collect_interval).await;
            self.drain_finished().await;
            if self.lock_in_flight().is_empty() {
                return;
            }
        }
    }

    /// Remove finished handles from the in-flight list and write their
    /// terminal rows.
    async fn drain_finished(&self) {
        let finished: Vec<(i64, JoinHandle<Outcome>)> = {
            let mut guard = self.lock_in_flight();
            let (done, rest) = guard.drain(..).partition(|(_, handle)| handle.is_finished());
            *guard = rest;
            done
        };

        for (id, handle) in finished {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                // A worker panic surfaces here; coerce it into a failure row.
                Err(err) => Outcome::Failed(OpResult::failure(-1, err.to_string())),
            };
            self.process_result(id, &outcome);
        }
    }

    /// Write one task's terminal state.
    fn process_result(&self, id: i64, outcome: &Outcome) {
        let written = match (outcome, self.kind.op_type()) {
            (Outcome::Done(result), Some(op)) => {
                info!(kind = %self.kind, task_id = id, "task done");
                self.ctx.store().write_result(op, id, TaskStatus::Done, result)
            }
            (Outcome::Failed(result), Some(op)) => {
                info!(
                    kind = %self.kind,
                    task_id = id,
                    exit_code = result.exit_code,
                    message = %result.message,
                    "task failed"
                );
                self.ctx
                    .store()
                    .write_result(op, id, TaskStatus::Failed, result)
            }
            (Outcome::Cancelled, Some(op)) => {
                info!(kind = %self.kind, task_id = id, "task cancelled before execution");
                self.ctx
                    .store()
                    .write_result(op, id, TaskStatus::Cancelled, &OpResult::cancelled())
            }
            (Outcome::Staged, _) => {
                info!(task_id = id, "file staged");
                self.ctx.store().mark_staged(id)
            }
            (Outcome::StagePending, _) => Ok(()),
            // Staging pools produce only Staged/StagePending.
            (_, None) => Ok(()),
        };

        if let Err(err) = written {
            error!(task_id = id, error = %err, "terminal status write failed, stopping");
            self.ctx.request_stop();
        }
    }

    /// Whether the scheduler may drop this pool: closed, or idle with its
    /// collector gone.
    #[must_use]
    pub fn ready_for_recycle(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        let idle = self.lock_in_flight().is_empty();
        let collector_done = self
            .lock_collector()
            .as_ref()
            .is_none_or(JoinHandle::is_finished);
        idle && collector_done
    }

    /// Tear the pool down.
    ///
    /// On a hard (signal-triggered) stop, in-flight workers are aborted and
    /// their rows are left for the recovery sweep. Otherwise the pool
    /// drains: every in-flight worker is awaited and its result written.
    pub async fn shutdown(&self) {
        if self.ctx.hard_stop_requested() {
            let handles: Vec<(i64, JoinHandle<Outcome>)> =
                self.lock_in_flight().drain(..).collect();
            for (_, handle) in &handles {
                handle.abort();
            }
            debug!(
                kind = %self.kind,
                scope = %self.scope,
                aborted = handles.len(),
                "pool terminated"
            );
        } else {
            loop {
                let handles: Vec<(i64, JoinHandle<Outcome>)> =
                    self.lock_in_flight().drain(..).collect();
                if handles.is_empty() {
                    break;
                }
                for (id, handle) in handles {
                    let outcome = match handle.await {
                        Ok(outcome) => outcome,
                        Err(err) => Outcome::Failed(OpResult::failure(-1, err.to_string())),
                    };
                    self.process_result(id, &outcome);
                }
            }
        }

        if let Some(handle) = self.lock_collector().take() {
            handle.abort();
        }
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::FodConfig;
    use crate::context::DaemonContext;
    use crate::gateway::{PollStatus, StageRequest, StorageGateway, TransferParams};
    use crate::store::TaskStore;

    struct SlowDeleteGateway {
        delay: Duration,
        exit: i32,
    }

    impl StorageGateway for SlowDeleteGateway {
        fn filecopy(&self, _: &TransferParams, _: &str, _: &str) -> OpResult {
            OpResult::default()
        }

        fn stat(&self, _: &str) -> OpResult {
            OpResult::failure(2, "No such file")
        }

        fn unlink(&self, _: &str) -> OpResult {
            std::thread::sleep(self.delay);
            OpResult {
                exit_code: self.exit,
                start: Some(100),
                finish: Some(101),
                message: String::new(),
                log: String::new(),
            }
        }

        fn bring_online(&self, pfns: &[String], _: Duration, _: Duration) -> StageRequest {
            StageRequest {
                errors: vec![None; pfns.len()],
                token: None,
            }
        }

        fn bring_online_poll(&self, _: &str, _: &str) -> PollStatus {
            PollStatus::Pending
        }
    }

    fn fast_config() -> FodConfig {
        toml::from_str(
            r#"
            [file_operations.daemon]
            collect_interval = "20ms"
            schedule_interval = "50ms"
            "#,
        )
        .unwrap()
    }

    fn seeded_context(gateway: Arc<dyn StorageGateway>) -> SharedContext {
        let conn = Arc::new(std::sync::Mutex::new(
            rusqlite::Connection::open_in_memory().unwrap(),
        ));
        let store = TaskStore::new(Arc::clone(&conn));
        store.init_schema().unwrap();
        conn.lock()
            .unwrap()
            .execute_batch(
                "INSERT INTO standalone_deletion_batches (batch_id, site) VALUES (1, 'T1_A');
                 INSERT INTO deletion_tasks (id, batch_id) VALUES (1, 1), (2, 1);
                 INSERT INTO standalone_deletion_tasks (id, file)
                 VALUES (1, 'srm://a'), (2, 'srm://b');",
            )
            .unwrap();
        Arc::new(DaemonContext::new(store, gateway, &fast_config()))
    }

    async fn wait_until(pool: &Arc<Pool>, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !pool.ready_for_recycle() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "pool did not drain in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_submission_runs_to_done() {
        let gateway = Arc::new(SlowDeleteGateway {
            delay: Duration::from_millis(1),
            exit: 0,
        });
        let ctx = seeded_context(gateway);
        let pool = Pool::new(
            Arc::clone(&ctx),
            PoolKind::Deletion,
            PoolScope::Site("T1_A".to_string()),
            2,
        );

        pool.add_task(
            1,
            Assignment::Delete {
                pfn: "srm://a".to_string(),
            },
        )
        .unwrap();

        wait_until(&pool, Duration::from_secs(5)).await;
        let row = ctx.store().task_row(OpType::Deletion, 1).unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Done);
        assert_eq!(row.exitcode, Some(0));
        // The worker consumed its queued-set entry.
        assert!(!ctx.queued_set(OpType::Deletion).contains(1));
    }

    #[tokio::test]
    async fn test_external_cancellation_before_start() {
        let gateway = Arc::new(SlowDeleteGateway {
            delay: Duration::from_millis(200),
            exit: 0,
        });
        let ctx = seeded_context(gateway);
        let pool = Pool::new(
            Arc::clone(&ctx),
            PoolKind::Deletion,
            PoolScope::Site("T1_A".to_string()),
            1,
        );

        pool.add_task(
            1,
            Assignment::Delete {
                pfn: "srm://a".to_string(),
            },
        )
        .unwrap();
        pool.add_task(
            2,
            Assignment::Delete {
                pfn: "srm://b".to_string(),
            },
        )
        .unwrap();

        // Task 2 is parked behind the single slot; cancel it the way the
        // manager would (its id vanishes from the queued set).
        assert!(ctx.queued_set(OpType::Deletion).try_remove(2));

        wait_until(&pool, Duration::from_secs(5)).await;
        let row1 = ctx.store().task_row(OpType::Deletion, 1).unwrap().unwrap();
        let row2 = ctx.store().task_row(OpType::Deletion, 2).unwrap().unwrap();
        assert_eq!(row1.status, TaskStatus::Done);
        assert_eq!(row2.status, TaskStatus::Cancelled);
        assert_eq!(row2.exitcode, Some(-1));
        assert_eq!(row2.message.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_failed_exit_writes_failed_row() {
        let gateway = Arc::new(SlowDeleteGateway {
            delay: Duration::from_millis(1),
            exit: 70,
        });
        let ctx = seeded_context(gateway);
        let pool = Pool::new(
            Arc::clone(&ctx),
            PoolKind::Deletion,
            PoolScope::Site("T1_A".to_string()),
            1,
        );

        pool.add_task(
            1,
            Assignment::Delete {
                pfn: "srm://a".to_string(),
            },
        )
        .unwrap();

        wait_until(&pool, Duration::from_secs(5)).await;
        let row = ctx.store().task_row(OpType::Deletion, 1).unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Failed);
        assert_eq!(row.exitcode, Some(70));
    }

    #[tokio::test]
    async fn test_hard_shutdown_aborts_in_flight() {
        let gateway = Arc::new(SlowDeleteGateway {
            delay: Duration::from_millis(500),
            exit: 0,
        });
        let ctx = seeded_context(gateway);
        let pool = Pool::new(
            Arc::clone(&ctx),
            PoolKind::Deletion,
            PoolScope::Site("T1_A".to_string()),
            1,
        );

        pool.add_task(
            1,
            Assignment::Delete {
                pfn: "srm://a".to_string(),
            },
        )
        .unwrap();

        ctx.request_hard_stop();
        pool.shutdown().await;
        assert!(pool.ready_for_recycle());
        // The row is left mid-flight for the recovery sweep.
        let row = ctx.store().task_row(OpType::Deletion, 1).unwrap().unwrap();
        assert_ne!(row.status, TaskStatus::Done);
    }
}
