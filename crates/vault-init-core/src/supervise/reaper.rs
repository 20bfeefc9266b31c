//! Process-wide zombie reaper for PID-1 operation.
//!
//! When `vault-init` runs as init inside a container, descendants orphaned
//! by the supervised child are re-parented to us and must be waited on or
//! they linger as zombies. The reaper listens for SIGCHLD and drains every
//! pending exit — except directly supervised children, whose exit statuses
//! belong to their generation waiters. Zombies are peeked with
//! `waitid(WNOWAIT)` first so skipping a supervised child does not consume
//! its status. Started at most once per process lifetime.

use std::collections::HashSet;
use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Fallback sweep for exits whose SIGCHLD coalesced with one we skipped.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Pids of directly supervised children. Registered at spawn, removed by
/// each generation's waiter once the child has been reaped.
static SUPERVISED: LazyLock<Mutex<HashSet<i32>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

fn supervised() -> MutexGuard<'static, HashSet<i32>> {
    SUPERVISED.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shield a directly supervised child from the reaper.
pub(crate) fn protect(pid: u32) {
    supervised().insert(i32::try_from(pid).unwrap_or_default());
}

/// Lift the shield once the child has been waited on.
pub(crate) fn unprotect(pid: u32) {
    supervised().remove(&i32::try_from(pid).unwrap_or_default());
}

/// Spawn the reaper task. Runs until `cancel` fires.
pub(crate) fn spawn(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigchld = match signal(SignalKind::child()) {
            Ok(sigchld) => sigchld,
            Err(err) => {
                error!(error = %err, "could not install SIGCHLD handler for reaper");
                return;
            }
        };

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("subprocess reaper exiting");
                    return;
                }
                _ = sigchld.recv() => reap_pending(),
                _ = sweep.tick() => reap_pending(),
            }
        }
    });
}

/// Drain every reapable descendant without blocking, leaving supervised
/// children for their waiters.
fn reap_pending() {
    loop {
        // Peek without consuming so a skipped child keeps its status.
        let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
        let pid = match waitid(Id::All, flags) {
            Ok(WaitStatus::StillAlive) => return,
            Ok(status) => match status.pid() {
                Some(pid) => pid,
                None => return,
            },
            // ECHILD: nothing left to wait for.
            Err(_) => return,
        };

        if supervised().contains(&pid.as_raw()) {
            // Its waiter collects this one; any zombies queued behind it
            // are picked up on the next signal or sweep.
            return;
        }

        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => return,
            Ok(_) => debug!(pid = pid.as_raw(), "reaped orphaned descendant"),
        }
    }
}
