//! fod-daemon: the file operations daemon.
//!
//! Drains the transfer and deletion task queues produced by the file
//! operations manager, executing each task against grid storage endpoints
//! and recording terminal state in the shared task database.
//!
//! # Fork safety
//!
//! Daemonization via `fork()` must happen before the Tokio runtime starts:
//! `fork()` only duplicates the calling thread, so forking a process that
//! already has runtime worker threads leaves mutexes locked forever in the
//! child. The binary therefore uses a synchronous `fn main()` that forks
//! first and only then constructs the runtime and enters `async_main`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fod_core::config::{FodConfig, CONFIG_ENV};
use fod_core::context::DaemonContext;
use fod_core::gateway::gfal::GfalGateway;
use fod_core::logging::RotatingWriter;
use fod_core::scheduler::{Scheduler, PROXY_ENV};
use fod_core::store::TaskStore;
use fod_core::SharedContext;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// File operations daemon.
#[derive(Parser, Debug)]
#[command(name = "fod-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the server configuration file; falls back to
    /// DYNAMO_SERVER_CONFIG.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run in foreground (don't daemonize).
    #[arg(long)]
    no_daemon: bool,

    /// Path to PID file.
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Create the task tables and exit (provisioning helper).
    #[arg(long)]
    init_schema: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Fork before any threads exist; see the module docs.
    if !args.no_daemon && !args.init_schema {
        daemonize()?;
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => FodConfig::from_file(path)?,
        None => FodConfig::from_env()
            .with_context(|| format!("pass --config or set {CONFIG_ENV}"))?,
    };

    init_tracing(&config)?;

    if args.no_daemon {
        info!("running in foreground mode (--no-daemon)");
    } else if !args.init_schema {
        info!("daemonized");
    }

    if args.init_schema {
        let store =
            TaskStore::open(config.db_path()).context("failed to open task database")?;
        store
            .init_schema()
            .context("failed to create task tables")?;
        let db_path = config.db_path();
        info!(db = ?db_path, "task tables created");
        return Ok(());
    }

    raise_rlimits();

    if let Some(user) = &config.user {
        drop_privileges(user)?;
    }

    if let Some(proxy) = &config.daemon().x509_proxy {
        std::env::set_var(PROXY_ENV, proxy);
    }

    let store = TaskStore::open(config.db_path()).context("failed to open task database")?;
    let gateway = Arc::new(GfalGateway::new(&config));
    let ctx: SharedContext = Arc::new(DaemonContext::new(store, gateway, &config));

    // Crash recovery: a previous instance may have died with tasks
    // mid-flight. Those rows go back to `new` before the first pass.
    let (transfers, deletions) = ctx
        .store()
        .recover_interrupted()
        .context("crash recovery sweep failed")?;
    if transfers + deletions > 0 {
        info!(transfers, deletions, "recovered interrupted tasks");
    }

    if let Some(pid_path) = &args.pid_file {
        write_pid_file(pid_path)?;
    }

    spawn_signal_task(Arc::clone(&ctx));

    let db_path = config.db_path();
    info!(
        pid = std::process::id(),
        db = ?db_path,
        "file operations daemon started"
    );

    let mut scheduler = Scheduler::new(Arc::clone(&ctx));
    let run_result = scheduler.run().await;

    info!(
        hard = ctx.hard_stop_requested(),
        "shutting down, waiting for pools"
    );
    scheduler.shutdown().await;

    // Best-effort: repeat the recovery sweep so no row is left mid-flight.
    if let Err(err) = ctx.store().recover_interrupted() {
        warn!(error = %err, "final cleanup sweep failed");
    }

    if let Some(pid_path) = &args.pid_file {
        remove_pid_file(pid_path);
    }

    info!("daemon shutdown complete");
    run_result?;
    Ok(())
}

/// Initialize the tracing subscriber: rotating file when a log path is
/// configured, stderr otherwise.
fn init_tracing(config: &FodConfig) -> Result<()> {
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(path) = &config.logging.path {
        let writer = RotatingWriter::open(path.clone(), &config.logging)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

/// Raise the file-descriptor and process limits toward their maxima.
///
/// Every transfer worker holds sockets and a helper process, so the stock
/// soft limits are far too low under full pools.
fn raise_rlimits() {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    const MAX_OPEN_FILES: u64 = 65_536;

    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((_, hard)) => {
            if let Err(err) = setrlimit(Resource::RLIMIT_NOFILE, MAX_OPEN_FILES.min(hard), hard) {
                warn!(error = %err, "failed to raise RLIMIT_NOFILE");
            }
        }
        Err(err) => warn!(error = %err, "failed to read RLIMIT_NOFILE"),
    }

    match getrlimit(Resource::RLIMIT_NPROC) {
        Ok((_, hard)) => {
            if let Err(err) = setrlimit(Resource::RLIMIT_NPROC, hard, hard) {
                warn!(error = %err, "failed to raise RLIMIT_NPROC");
            }
        }
        Err(err) => warn!(error = %err, "failed to read RLIMIT_NPROC"),
    }
}

/// Drop effective gid then uid to the configured account when running as
/// root.
fn drop_privileges(username: &str) -> Result<()> {
    use nix::unistd::{setgid, setuid, Uid, User};

    if !Uid::effective().is_root() {
        return Ok(());
    }

    let user = User::from_name(username)
        .with_context(|| format!("failed to look up user '{username}'"))?
        .with_context(|| format!("no such user: '{username}'"))?;

    setgid(user.gid).context("setgid failed")?;
    setuid(user.uid).context("setuid failed")?;
    info!(user = username, "dropped privileges");
    Ok(())
}

/// Translate TERM/INT/HUP into stop requests; TERM terminates in-flight
/// work, the others drain it.
fn spawn_signal_task(ctx: SharedContext) {
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        let mut sighup = signal(SignalKind::hangup()).expect("failed to register SIGHUP");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                ctx.request_hard_stop();
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                ctx.request_stop();
            }
            _ = sighup.recv() => {
                info!("received SIGHUP");
                ctx.request_stop();
            }
        }
    });
}

/// Perform double-fork daemonization.
///
/// Must run while the process is still single-threaded; the parent and the
/// intermediate child both exit here.
#[allow(unsafe_code)]
fn daemonize() -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    // SAFETY: no threads have been spawned yet; the runtime is constructed
    // only after this function returns in the grandchild.
    match unsafe { fork() }.context("first fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().context("setsid failed")?;

    // SAFETY: still single-threaded; the second fork prevents the daemon
    // from reacquiring a controlling terminal.
    match unsafe { fork() }.context("second fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    std::env::set_current_dir("/").context("chdir to / failed")?;
    Ok(())
}

/// Write the daemon PID file.
fn write_pid_file(pid_path: &PathBuf) -> Result<()> {
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(pid_path, std::process::id().to_string())?;
    info!("PID file written to {:?}", pid_path);
    Ok(())
}

/// Remove the daemon PID file.
fn remove_pid_file(pid_path: &PathBuf) {
    if pid_path.exists() {
        if let Err(err) = std::fs::remove_file(pid_path) {
            warn!("failed to remove PID file: {err}");
        }
    }
}
