//! Queue scheduler.
//!
//! A single control loop drives everything: every pass it promotes new
//! deletion tasks into per-site pools, issues bulk tape recalls for batches
//! that lack a stage token, polls staging tasks, submits runnable transfers
//! to per-link pools, refreshes the shared queued-id sets from the
//! database, and recycles idle pools.
//!
//! Deletions are submitted before transfers so deletion slots are claimed
//! first under load; the queued sets are refreshed after submission so ids
//! that just became `queued` are visible for cancellation in the next pass.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::context::SharedContext;
use crate::gateway::{Checksum, StageRequest, TransferParams};
use crate::pool::{Pool, PoolKind, PoolScope};
use crate::store::{OpType, StoreError};
use crate::worker::Assignment;

/// Environment variable naming the proxy certificate the grid tooling uses.
pub const PROXY_ENV: &str = "X509_USER_PROXY";

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-pass submission counters, logged and returned for inspection.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassStats {
    /// Deletion tasks submitted.
    pub deletions: usize,
    /// Tape recall requests issued.
    pub stage_requests: usize,
    /// Staging polls submitted.
    pub staging_polls: usize,
    /// Transfer tasks submitted.
    pub transfers: usize,
    /// Pools recycled.
    pub recycled: usize,
}

/// The daemon's control loop.
pub struct Scheduler {
    ctx: SharedContext,
    pools: HashMap<(PoolKind, PoolScope), Arc<Pool>>,
}

impl Scheduler {
    /// Create a scheduler over the shared context.
    #[must_use]
    pub fn new(ctx: SharedContext) -> Self {
        Self {
            ctx,
            pools: HashMap::new(),
        }
    }

    /// Number of live pools.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Run passes until a stop is requested.
    ///
    /// # Errors
    ///
    /// Returns the first pass error after setting the stop flag; the caller
    /// still runs the cleanup sweep.
    pub async fn run(&mut self) -> Result<(), SchedulerError> {
        let interval = self.ctx.settings().schedule_interval;
        info!(interval = ?interval, "scheduler started");
        while !self.ctx.stop_requested() {
            if let Err(err) = self.pass().await {
                error!(error = %err, "scheduler pass failed, stopping");
                self.ctx.request_stop();
                return Err(err);
            }
            self.sleep_between_passes().await;
        }
        info!("scheduler stopped");
        Ok(())
    }

    /// Execute one scheduling pass.
    ///
    /// # Errors
    ///
    /// Returns an error if any store operation fails.
    pub async fn pass(&mut self) -> Result<PassStats, SchedulerError> {
        let mut stats = PassStats::default();

        self.submit_new_deletions(&mut stats)?;
        self.refresh_queued(OpType::Deletion)?;
        self.issue_staging(&mut stats).await?;
        self.submit_staging_polls(&mut stats)?;
        self.submit_transfers(&mut stats)?;
        self.refresh_queued(OpType::Transfer)?;
        self.recycle_pools(&mut stats).await;

        info!(
            deletions = stats.deletions,
            stage_requests = stats.stage_requests,
            staging_polls = stats.staging_polls,
            transfers = stats.transfers,
            recycled = stats.recycled,
            pools = self.pools.len(),
            "scheduler pass complete"
        );
        Ok(stats)
    }

    /// Tear down every pool: drain on a graceful stop, terminate on a hard
    /// one.
    pub async fn shutdown(&mut self) {
        for (_, pool) in self.pools.drain() {
            pool.shutdown().await;
        }
    }

    async fn sleep_between_passes(&self) {
        let deadline = tokio::time::Instant::now() + self.ctx.settings().schedule_interval;
        while tokio::time::Instant::now() < deadline {
            if self.ctx.stop_requested() {
                return;
            }
            let remaining = deadline - tokio::time::Instant::now();
            tokio::time::sleep(remaining.min(Duration::from_millis(250))).await;
        }
    }

    fn get_or_create(&mut self, kind: PoolKind, scope: PoolScope) -> Arc<Pool> {
        let max_concurrent = self.ctx.settings().max_parallel_links;
        let ctx = Arc::clone(&self.ctx);
        // An existing pool keeps the concurrency it was created with;
        // re-tuning happens only through recycle and re-creation.
        Arc::clone(
            self.pools
                .entry((kind, scope.clone()))
                .or_insert_with(|| Pool::new(ctx, kind, scope, max_concurrent)),
        )
    }

    fn submit_new_deletions(&mut self, stats: &mut PassStats) -> Result<(), SchedulerError> {
        let work = self.ctx.store().fetch_new_deletions()?;
        for item in work {
            let pool = self.get_or_create(PoolKind::Deletion, PoolScope::Site(item.site));
            pool.add_task(item.id, Assignment::Delete { pfn: item.file })?;
            stats.deletions += 1;
        }
        Ok(())
    }

    fn refresh_queued(&self, op: OpType) -> Result<(), SchedulerError> {
        let ids = self.ctx.store().queued_ids(op)?;
        self.ctx.queued_set(op).replace(ids);
        Ok(())
    }

    /// Issue one bulk recall per tape-sourced batch without a stage token.
    ///
    /// The token is written back even when the request fails (a null token
    /// plus individually failed tasks) so the batch is never re-issued.
    async fn issue_staging(&mut self, stats: &mut PassStats) -> Result<(), SchedulerError> {
        let batches = self.ctx.store().batches_awaiting_stage()?;
        for batch in batches {
            if batch.tasks.is_empty() {
                continue;
            }
            let pfns: Vec<String> = batch.tasks.iter().map(|(_, pfn)| pfn.clone()).collect();

            let gateway = self.ctx.gateway();
            let request_pfns = pfns.clone();
            let _proxy = self
                .ctx
                .settings()
                .staging_proxy
                .as_deref()
                .map(ProxyGuard::swap);
            let request = tokio::task::spawn_blocking(move || {
                // Pin time and timeout are left at zero; the endpoints
                // apply their own defaults.
                gateway.bring_online(&request_pfns, Duration::ZERO, Duration::ZERO)
            })
            .await
            .unwrap_or_else(|err| StageRequest {
                errors: vec![Some(err.to_string()); pfns.len()],
                token: None,
            });

            self.ctx
                .store()
                .set_stage_token(batch.batch_id, request.token.as_deref())?;

            for ((id, _), error) in batch.tasks.iter().zip(&request.errors) {
                match (error, request.token.as_deref()) {
                    (None, Some(_)) => self.ctx.store().mark_staging(*id)?,
                    (None, None) => self
                        .ctx
                        .store()
                        .mark_stage_failed(*id, "staging request returned no token")?,
                    (Some(message), _) => self.ctx.store().mark_stage_failed(*id, message)?,
                }
            }

            info!(
                batch_id = batch.batch_id,
                site = %batch.source_site,
                files = pfns.len(),
                token = request.token.as_deref().unwrap_or("<none>"),
                "tape recall issued"
            );
            stats.stage_requests += 1;
        }
        Ok(())
    }

    fn submit_staging_polls(&mut self, stats: &mut PassStats) -> Result<(), SchedulerError> {
        let work = self.ctx.store().fetch_staging_transfers()?;
        for item in work {
            let pool = self.get_or_create(PoolKind::Staging, PoolScope::Site(item.source_site));
            pool.add_task(
                item.id,
                Assignment::Stage {
                    pfn: item.source,
                    token: item.token,
                },
            )?;
            stats.staging_polls += 1;
        }
        Ok(())
    }

    fn submit_transfers(&mut self, stats: &mut PassStats) -> Result<(), SchedulerError> {
        let work = self.ctx.store().fetch_runnable_transfers()?;
        for item in work {
            let pool = self.get_or_create(
                PoolKind::Transfer,
                PoolScope::Link {
                    source: item.source_site,
                    destination: item.destination_site,
                },
            );
            let checksum = (!item.checksum_algo.is_empty()).then(|| Checksum {
                algo: item.checksum_algo,
                value: item.checksum,
            });
            let params = TransferParams {
                overwrite: self.ctx.settings().overwrite,
                checksum,
                timeout: self.ctx.settings().transfer_timeout,
                create_parents: true,
            };
            pool.add_task(
                item.id,
                Assignment::Transfer {
                    source: item.source,
                    destination: item.destination,
                    params,
                },
            )?;
            stats.transfers += 1;
        }
        Ok(())
    }

    async fn recycle_pools(&mut self, stats: &mut PassStats) {
        let ready: Vec<(PoolKind, PoolScope)> = self
            .pools
            .iter()
            .filter(|(_, pool)| pool.ready_for_recycle())
            .map(|(key, _)| key.clone())
            .collect();

        for key in ready {
            if let Some(pool) = self.pools.remove(&key) {
                pool.shutdown().await;
                debug!(kind = %pool.kind(), scope = %pool.scope(), "pool recycled");
                stats.recycled += 1;
            }
        }
    }
}

/// Swaps `X509_USER_PROXY` for the duration of a staging request and
/// restores the previous value on drop.
struct ProxyGuard {
    previous: Option<OsString>,
}

impl ProxyGuard {
    fn swap(path: &Path) -> Self {
        let previous = std::env::var_os(PROXY_ENV);
        std::env::set_var(PROXY_ENV, path);
        Self { previous }
    }
}

impl Drop for ProxyGuard {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(value) => std::env::set_var(PROXY_ENV, value),
            None => std::env::remove_var(PROXY_ENV),
        }
    }
}
