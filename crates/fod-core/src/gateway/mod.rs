//! Storage I/O gateway.
//!
//! Thin capability layer over the grid data-movement tooling. Every call is
//! synchronous and returns a structured [`OpResult`] carrying the exit
//! code, the operation's time window, a short message, and the captured
//! per-call log buffer. The gateway never touches the database.
//!
//! A single gateway invocation retries internal transient failures up to
//! [`MAX_ATTEMPTS`] times, breaking early on irrecoverable (and
//! success-equivalent) codes. Each attempt captures its own timing and log
//! lines; the merged result keeps the first start, the last finish, the
//! last exit code and message, and the concatenated log.

pub mod gfal;

use std::time::Duration;

use crate::classify::{Classifier, Disposition};
use crate::store::OpType;

/// Bound on attempts within one gateway invocation.
pub const MAX_ATTEMPTS: usize = 5;

/// Structured result of a gateway call.
#[derive(Debug, Clone, Default)]
pub struct OpResult {
    /// Process exit code; 0 on success, −1 when no code is available.
    pub exit_code: i32,
    /// Unix seconds when the operation started.
    pub start: Option<i64>,
    /// Unix seconds when the operation finished.
    pub finish: Option<i64>,
    /// Short human-readable message (last error line on failure).
    pub message: String,
    /// Captured log buffer for the whole invocation.
    pub log: String,
}

impl OpResult {
    /// Whether the call succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// A failure result with no timing information.
    #[must_use]
    pub fn failure(exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            start: None,
            finish: None,
            message: message.into(),
            log: String::new(),
        }
    }

    /// The cancelled sentinel: exit −1, no times, empty message and log.
    #[must_use]
    pub fn cancelled() -> Self {
        Self {
            exit_code: -1,
            ..Self::default()
        }
    }
}

/// Checksum verification request for a transfer.
#[derive(Debug, Clone)]
pub struct Checksum {
    /// Algorithm name (e.g. `adler32`).
    pub algo: String,
    /// Expected value.
    pub value: String,
}

/// Parameters for a single file copy.
#[derive(Debug, Clone)]
pub struct TransferParams {
    /// Replace an existing destination file.
    pub overwrite: bool,
    /// Optional checksum verification.
    pub checksum: Option<Checksum>,
    /// Overall transfer timeout.
    pub timeout: Duration,
    /// Create missing destination directories.
    pub create_parents: bool,
}

impl Default for TransferParams {
    fn default() -> Self {
        Self {
            overwrite: false,
            checksum: None,
            timeout: Duration::from_secs(3600),
            create_parents: true,
        }
    }
}

/// Outcome of one staging poll.
#[derive(Debug, Clone)]
pub enum PollStatus {
    /// The file is online; the transfer can proceed.
    Ready,
    /// The recall is still in progress.
    Pending,
    /// The poll itself failed.
    Error(OpResult),
}

/// Result of issuing a bulk tape recall.
#[derive(Debug, Clone)]
pub struct StageRequest {
    /// Per-file error message, index-aligned with the requested PFNs;
    /// `None` where the file was accepted.
    pub errors: Vec<Option<String>>,
    /// Opaque batch token to poll with; `None` when the request failed.
    pub token: Option<String>,
}

/// Capability layer over the grid I/O tooling.
///
/// Implementations are blocking; callers run them on a blocking-capable
/// thread.
pub trait StorageGateway: Send + Sync {
    /// Copy `source` to `destination`.
    fn filecopy(&self, params: &TransferParams, source: &str, destination: &str) -> OpResult;

    /// Stat a PFN; exit 0 means the file is present.
    fn stat(&self, pfn: &str) -> OpResult;

    /// Remove a PFN.
    fn unlink(&self, pfn: &str) -> OpResult;

    /// Issue an asynchronous bulk recall from tape.
    fn bring_online(
        &self,
        pfns: &[String],
        pin_time: Duration,
        timeout: Duration,
    ) -> StageRequest;

    /// Poll one PFN of a previously issued recall.
    fn bring_online_poll(&self, pfn: &str, token: &str) -> PollStatus;
}

/// Run `attempt` up to [`MAX_ATTEMPTS`] times, breaking early on success
/// and on any non-retryable disposition.
///
/// The merged result keeps the first attempt's start, the last attempt's
/// finish, exit code, and message, and concatenates every attempt's log.
pub fn run_attempts<F>(classifier: &Classifier, op: OpType, mut attempt: F) -> OpResult
where
    F: FnMut() -> OpResult,
{
    let mut first_start = None;
    let mut log = String::new();
    let mut last = OpResult::default();

    for _ in 0..MAX_ATTEMPTS {
        let result = attempt();
        if first_start.is_none() {
            first_start = result.start;
        }
        if !result.log.is_empty() {
            log.push_str(&result.log);
            if !result.log.ends_with('\n') {
                log.push('\n');
            }
        }

        let retry = !result.is_success()
            && matches!(
                classifier.classify(op, result.exit_code, &result.message),
                Disposition::Retryable
            );
        last = result;
        if !retry {
            break;
        }
    }

    OpResult {
        exit_code: last.exit_code,
        start: first_start,
        finish: last.finish,
        message: last.message,
        log,
    }
}
