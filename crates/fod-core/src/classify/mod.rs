//! Error classifier.
//!
//! Maps gateway exit codes and message substrings into one of three
//! dispositions: success-equivalent (an "error" the task outcome absorbs),
//! irrecoverable (never retried), or retryable (subject to the gateway's
//! bounded attempt count). A code derived from the message wins over the
//! numeric exit code; server-side failures often surface only as text.

use std::collections::BTreeSet;

use nix::errno::Errno;

use crate::config::ClassifierConfig;
use crate::store::OpType;

/// Message recorded when a transfer finds its destination already present.
pub const DESTINATION_EXISTS: &str = "Destination file exists.";

/// Message recorded when a deletion finds its target already absent.
pub const TARGET_MISSING: &str = "Target file does not exist.";

/// Disposition of a failed gateway call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Counts as success for the operation; carries the replacement message.
    Success(&'static str),

    /// Retries cannot help; fail the task immediately.
    Irrecoverable,

    /// May succeed on a later attempt.
    Retryable,
}

/// Static disposition table, optionally extended from configuration.
#[derive(Debug, Clone)]
pub struct Classifier {
    irrecoverable: BTreeSet<i32>,
    message_codes: Vec<(String, i32)>,
}

impl Classifier {
    /// Build a classifier from the `[classifier]` config section.
    #[must_use]
    pub fn from_config(config: &ClassifierConfig) -> Self {
        Self {
            irrecoverable: config.irrecoverable.iter().copied().collect(),
            message_codes: config
                .message_codes
                .iter()
                .map(|entry| (entry.substring.clone(), entry.code))
                .collect(),
        }
    }

    /// Find an exit code embedded in the message text, if any.
    #[must_use]
    pub fn find_msg_code(&self, message: &str) -> Option<i32> {
        self.message_codes
            .iter()
            .find(|(substring, _)| message.contains(substring.as_str()))
            .map(|(_, code)| *code)
    }

    /// The exit code to classify on: the message-derived code wins.
    #[must_use]
    pub fn effective_code(&self, exit_code: i32, message: &str) -> i32 {
        self.find_msg_code(message).unwrap_or(exit_code)
    }

    /// Classify a non-zero gateway result for the given operation type.
    #[must_use]
    pub fn classify(&self, op: OpType, exit_code: i32, message: &str) -> Disposition {
        let code = self.effective_code(exit_code, message);

        match op {
            OpType::Transfer if code == Errno::EEXIST as i32 => {
                return Disposition::Success(DESTINATION_EXISTS);
            }
            OpType::Deletion if code == Errno::ENOENT as i32 => {
                return Disposition::Success(TARGET_MISSING);
            }
            _ => {}
        }

        if self.irrecoverable.contains(&code) {
            Disposition::Irrecoverable
        } else {
            Disposition::Retryable
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::from_config(&ClassifierConfig::default())
    }
}
