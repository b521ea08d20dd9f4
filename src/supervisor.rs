//! Supervisor: worker process lifecycle and watchdog.
//!
//! The parent owns a single worker subprocess. The worker's stdout is a
//! dedicated liveness pipe: the sync engine writes one `ping` line per
//! completed cycle (logs go to stderr). Silence past the watchdog timeout,
//! a dead child, or a dashboard `restart` command all end with the child's
//! process group terminated and a fresh worker after a short cooldown.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config;
use crate::error::WorkerError;
use crate::state::StateStore;

const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(120);
const RESTART_COOLDOWN: Duration = Duration::from_secs(5);
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Why the supervisor decided to recycle the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    WorkerDied,
    WatchdogTimeout,
    RestartCommand,
}

/// Watchdog policy, separated from process plumbing: given the child's
/// state, the age of the last liveness ping, and the current dashboard
/// command, decide whether a restart is due.
pub fn watchdog_decision(
    worker_alive: bool,
    ping_age: Duration,
    command: &str,
) -> Option<RestartReason> {
    if command == "restart" {
        return Some(RestartReason::RestartCommand);
    }
    if !worker_alive {
        return Some(RestartReason::WorkerDied);
    }
    if ping_age >= WATCHDOG_TIMEOUT {
        return Some(RestartReason::WatchdogTimeout);
    }
    None
}

/// Supervisor main loop. Runs until the process is killed.
pub async fn run() -> anyhow::Result<()> {
    let store = StateStore::open(std::path::Path::new(config::STATE_DB_FILE)).await?;
    tracing::info!(version = %config::version(), "sync agent supervisor starting");

    let mut worker = spawn_worker()?;
    let mut last_ping = worker.watch_pings();

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let command = match store.read_command().await {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read agent command");
                "continue".to_string()
            }
        };

        let alive = worker.is_alive();
        let ping_age = last_ping.lock().await.elapsed();
        let Some(reason) = watchdog_decision(alive, ping_age, &command) else {
            continue;
        };

        tracing::warn!(?reason, "recycling worker");
        if reason == RestartReason::RestartCommand {
            if let Err(e) = store.set_command("continue").await {
                tracing::warn!(error = %e, "failed to reset agent command");
            }
        }

        worker.terminate().await;
        tokio::time::sleep(RESTART_COOLDOWN).await;
        worker = spawn_worker()?;
        last_ping = worker.watch_pings();
    }
}

/// A running worker subprocess plus its liveness reader.
struct Worker {
    child: Child,
}

fn spawn_worker() -> Result<Worker, WorkerError> {
    let exe = std::env::current_exe()?;
    let mut command = Command::new(exe);
    command
        .arg("worker")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    #[cfg(unix)]
    command.process_group(0);

    let child = command
        .spawn()
        .map_err(|e| WorkerError::Spawn(e.to_string()))?;
    tracing::info!(pid = child.id(), "worker started");
    Ok(Worker { child })
}

impl Worker {
    /// Spawn the stdout reader; every line the worker prints refreshes the
    /// shared ping instant.
    fn watch_pings(&mut self) -> Arc<Mutex<Instant>> {
        let last_ping = Arc::new(Mutex::new(Instant::now()));
        if let Some(stdout) = self.child.stdout.take() {
            let last_ping = Arc::clone(&last_ping);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(_line)) = lines.next_line().await {
                    *last_ping.lock().await = Instant::now();
                }
            });
        }
        last_ping
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// SIGTERM the child's whole process group (large-table children
    /// included), escalate to SIGKILL after the grace period.
    async fn terminate(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }

        if tokio::time::timeout(TERM_GRACE, self.child.wait())
            .await
            .is_ok()
        {
            return;
        }

        tracing::warn!("worker ignored SIGTERM, killing");
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}
