//! Gateway implementation over the gfal2 command-line utilities.
//!
//! Each operation shells out to the matching tool (`gfal-copy`,
//! `gfal-stat`, `gfal-rm`, `gfal-bringonline`, `gfal-xattr`) with the
//! configured verbosity, capturing stdout and stderr as the per-call log
//! buffer and surfacing the tool's exit code verbatim. The tools pick up
//! `X509_USER_PROXY` from the environment, which is how the scheduler's
//! staging proxy swap reaches them.

use std::process::Command;
use std::time::Duration;

use uuid::Uuid;

use crate::classify::Classifier;
use crate::config::FodConfig;
use crate::gateway::{
    run_attempts, OpResult, PollStatus, StageRequest, StorageGateway, TransferParams,
};
use crate::store::OpType;

/// Gateway backed by the gfal2 utilities.
#[derive(Debug, Clone)]
pub struct GfalGateway {
    classifier: Classifier,
    verbose_args: Vec<String>,
}

impl GfalGateway {
    /// Build a gateway from the daemon configuration.
    #[must_use]
    pub fn new(config: &FodConfig) -> Self {
        Self {
            classifier: Classifier::from_config(&config.classifier),
            verbose_args: verbosity_args(&config.daemon().gfal2_verbosity),
        }
    }

    fn run_tool(&self, program: &str, args: &[String]) -> OpResult {
        let start = chrono::Utc::now().timestamp();
        let output = Command::new(program).args(args).output();
        let finish = chrono::Utc::now().timestamp();

        match output {
            Ok(out) => {
                let exit_code = out.status.code().unwrap_or(-1);
                let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
                let message = if exit_code == 0 {
                    String::new()
                } else {
                    last_line(&stderr)
                        .or_else(|| last_line(&stdout))
                        .unwrap_or_else(|| format!("{program} exited with code {exit_code}"))
                };
                let mut log = format!("$ {program} {}\n", args.join(" "));
                log.push_str(&stdout);
                log.push_str(&stderr);
                OpResult {
                    exit_code,
                    start: Some(start),
                    finish: Some(finish),
                    message,
                    log,
                }
            }
            Err(err) => OpResult {
                exit_code: -1,
                start: Some(start),
                finish: Some(finish),
                message: format!("failed to run {program}: {err}"),
                log: String::new(),
            },
        }
    }

    fn copy_args(&self, params: &TransferParams, source: &str, destination: &str) -> Vec<String> {
        let mut args = self.verbose_args.clone();
        args.push("--timeout".to_string());
        args.push(params.timeout.as_secs().to_string());
        if params.overwrite {
            args.push("--force".to_string());
        }
        if params.create_parents {
            args.push("--parent".to_string());
        }
        if let Some(checksum) = &params.checksum {
            args.push("--checksum".to_string());
            args.push(format!("{}:{}", checksum.algo, checksum.value));
        }
        args.push(source.to_string());
        args.push(destination.to_string());
        args
    }
}

impl StorageGateway for GfalGateway {
    fn filecopy(&self, params: &TransferParams, source: &str, destination: &str) -> OpResult {
        let args = self.copy_args(params, source, destination);
        run_attempts(&self.classifier, OpType::Transfer, || {
            self.run_tool("gfal-copy", &args)
        })
    }

    fn stat(&self, pfn: &str) -> OpResult {
        let mut args = self.verbose_args.clone();
        args.push(pfn.to_string());
        // Classified as a deletion probe: an absent file is a final answer,
        // not a transient failure.
        run_attempts(&self.classifier, OpType::Deletion, || {
            self.run_tool("gfal-stat", &args)
        })
    }

    fn unlink(&self, pfn: &str) -> OpResult {
        let mut args = self.verbose_args.clone();
        args.push(pfn.to_string());
        run_attempts(&self.classifier, OpType::Deletion, || {
            self.run_tool("gfal-rm", &args)
        })
    }

    fn bring_online(&self, pfns: &[String], pin_time: Duration, timeout: Duration) -> StageRequest {
        let mut args = self.verbose_args.clone();
        args.push("--pin-lifetime".to_string());
        args.push(pin_time.as_secs().to_string());
        args.push("--timeout".to_string());
        args.push(timeout.as_secs().to_string());
        args.push("--nowait".to_string());
        args.extend(pfns.iter().cloned());

        // A missing file is a final answer for a recall too, so this is
        // classified like the deletion probe.
        let result = run_attempts(&self.classifier, OpType::Deletion, || {
            self.run_tool("gfal-bringonline", &args)
        });
        if result.exit_code == -1 {
            // The tool never ran; every file failed.
            return StageRequest {
                errors: vec![Some(result.message.clone()); pfns.len()],
                token: None,
            };
        }

        // Per-file failures are reported on lines naming the PFN; a file
        // not named in the error output was accepted.
        let errors = pfns
            .iter()
            .map(|pfn| {
                result
                    .log
                    .lines()
                    .find(|line| line.contains("ERROR") && line.contains(pfn.as_str()))
                    .map(ToString::to_string)
            })
            .collect();

        // Recent gfal2 prints the request token; older builds do not, in
        // which case a synthetic handle still marks the batch as issued.
        let token = result
            .log
            .lines()
            .find_map(|line| line.strip_prefix("Got token"))
            .map(|token| token.trim_start_matches([' ', ':']).to_string())
            .or_else(|| Some(format!("req-{}", Uuid::new_v4())));

        StageRequest { errors, token }
    }

    fn bring_online_poll(&self, pfn: &str, _token: &str) -> PollStatus {
        let mut args = self.verbose_args.clone();
        args.push(pfn.to_string());
        args.push("user.status".to_string());
        let result = run_attempts(&self.classifier, OpType::Deletion, || {
            self.run_tool("gfal-xattr", &args)
        });

        if !result.is_success() {
            return PollStatus::Error(result);
        }
        if result.log.contains("ONLINE") {
            PollStatus::Ready
        } else {
            PollStatus::Pending
        }
    }
}

fn verbosity_args(level: &str) -> Vec<String> {
    let flag = match level.to_ascii_lowercase().as_str() {
        "info" | "verbose" => Some("-v"),
        "debug" => Some("-vv"),
        "trace" => Some("-vvv"),
        _ => None,
    };
    flag.map(|f| vec![f.to_string()]).unwrap_or_default()
}

fn last_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(ToString::to_string)
}
