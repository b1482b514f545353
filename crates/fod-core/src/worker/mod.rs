//! Task workers.
//!
//! A worker executes exactly one task: it claims the task through the
//! queued-id set (the cancel gate), transitions the row to `active`, runs
//! the gateway call on a blocking thread, and reports a structured
//! [`Outcome`]. Workers never raise into the pool; every failure path is a
//! value.

use tracing::warn;

use crate::classify::Disposition;
use crate::context::SharedContext;
use crate::gateway::{OpResult, PollStatus, TransferParams};
use crate::store::OpType;

/// One unit of work handed to a pool.
#[derive(Debug, Clone)]
pub enum Assignment {
    /// Copy a file between two endpoints.
    Transfer {
        /// Source PFN.
        source: String,
        /// Destination PFN.
        destination: String,
        /// Copy parameters.
        params: TransferParams,
    },

    /// Poll one file of an issued tape recall.
    Stage {
        /// Source PFN being recalled.
        pfn: String,
        /// Batch token from the recall request.
        token: String,
    },

    /// Remove a file at one endpoint.
    Delete {
        /// PFN to remove.
        pfn: String,
    },
}

impl Assignment {
    /// The operation type for queued-set and store bookkeeping; staging
    /// polls have none (they never pass through `queued`).
    #[must_use]
    pub const fn op_type(&self) -> Option<OpType> {
        match self {
            Self::Transfer { .. } => Some(OpType::Transfer),
            Self::Delete { .. } => Some(OpType::Deletion),
            Self::Stage { .. } => None,
        }
    }

    /// Execute the assignment for task `id`.
    pub async fn execute(self, ctx: &SharedContext, id: i64) -> Outcome {
        match self {
            Self::Transfer {
                source,
                destination,
                params,
            } => run_transfer(ctx, id, source, destination, params).await,
            Self::Delete { pfn } => run_delete(ctx, id, pfn).await,
            Self::Stage { pfn, token } => run_stage_poll(ctx, id, pfn, token).await,
        }
    }
}

/// Terminal outcome of one worker execution.
#[derive(Debug)]
pub enum Outcome {
    /// The operation succeeded (including success-equivalent errors).
    Done(OpResult),

    /// The operation failed.
    Failed(OpResult),

    /// The task id was gone from the queued set; no I/O was performed and
    /// the row was not touched beyond its externally written state.
    Cancelled,

    /// Staging poll: the file is online.
    Staged,

    /// Staging poll: still waiting; leave the row in `staging`.
    StagePending,
}

/// Claim the task or report cancellation, then move the row to `active`.
///
/// Returns `None` when the worker may proceed; `Some(outcome)` aborts.
fn claim(ctx: &SharedContext, op: OpType, id: i64) -> Option<Outcome> {
    if !ctx.queued_set(op).try_remove(id) {
        return Some(Outcome::Cancelled);
    }
    match ctx.store().mark_active(op, id) {
        Ok(()) => None,
        Err(err) => Some(Outcome::Failed(OpResult::failure(-1, err.to_string()))),
    }
}

async fn run_transfer(
    ctx: &SharedContext,
    id: i64,
    source: String,
    destination: String,
    params: TransferParams,
) -> Outcome {
    if let Some(outcome) = claim(ctx, OpType::Transfer, id) {
        return outcome;
    }

    let gateway = ctx.gateway();
    let handle = tokio::task::spawn_blocking(move || {
        if !params.overwrite {
            // An existing destination is accepted as already transferred.
            let probe = gateway.stat(&destination);
            if probe.is_success() {
                return probe;
            }
        }
        gateway.filecopy(&params, &source, &destination)
    });

    match handle.await {
        Ok(result) => finalize(ctx, OpType::Transfer, result),
        Err(err) => Outcome::Failed(OpResult::failure(-1, err.to_string())),
    }
}

async fn run_delete(ctx: &SharedContext, id: i64, pfn: String) -> Outcome {
    if let Some(outcome) = claim(ctx, OpType::Deletion, id) {
        return outcome;
    }

    let gateway = ctx.gateway();
    let handle = tokio::task::spawn_blocking(move || gateway.unlink(&pfn));

    match handle.await {
        Ok(result) => finalize(ctx, OpType::Deletion, result),
        Err(err) => Outcome::Failed(OpResult::failure(-1, err.to_string())),
    }
}

async fn run_stage_poll(ctx: &SharedContext, id: i64, pfn: String, token: String) -> Outcome {
    let gateway = ctx.gateway();
    let poll_pfn = pfn.clone();
    let handle = tokio::task::spawn_blocking(move || gateway.bring_online_poll(&poll_pfn, &token));

    match handle.await {
        Ok(PollStatus::Ready) => Outcome::Staged,
        Ok(PollStatus::Pending) => Outcome::StagePending,
        Ok(PollStatus::Error(result)) => {
            // The row stays in staging and is polled again next pass.
            warn!(
                task_id = id,
                pfn = %pfn,
                exit_code = result.exit_code,
                message = %result.message,
                "staging poll failed"
            );
            Outcome::StagePending
        }
        Err(err) => {
            warn!(task_id = id, pfn = %pfn, error = %err, "staging poll panicked");
            Outcome::StagePending
        }
    }
}

/// Map a gateway result to its terminal outcome, absorbing
/// success-equivalent errors.
fn finalize(ctx: &SharedContext, op: OpType, result: OpResult) -> Outcome {
    if result.is_success() {
        return Outcome::Done(result);
    }
    match ctx
        .classifier()
        .classify(op, result.exit_code, &result.message)
    {
        Disposition::Success(note) => Outcome::Done(OpResult {
            exit_code: 0,
            start: result.start,
            finish: result.finish,
            message: note.to_string(),
            log: String::new(),
        }),
        Disposition::Irrecoverable | Disposition::Retryable => Outcome::Failed(result),
    }
}
