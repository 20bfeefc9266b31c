//! Child process supervision.
//!
//! The supervisor consumes environment snapshots from the watcher, spawns
//! the child with each fresh environment, and restarts it when the
//! environment changes or the child exits (unless one-shot).
//!
//! Each spawned child lives in its own *generation*: a record owning a
//! cancellation token derived from the parent token, the waiter task, and
//! the output forwarders. Replacing the child means cancelling the old
//! generation and building a new one. The old generation's waiter resolves
//! the race on its own cancel token and stays silent, so the old child's
//! OS-level exit is never mistaken for a crash of the new child.

pub mod forwarder;
#[cfg(target_os = "linux")]
mod reaper;
#[cfg(not(target_os = "linux"))]
mod reaper {
    // Zombie reaping is a Linux container concern; elsewhere the shield
    // bookkeeping is a no-op.
    pub(crate) fn protect(_pid: u32) {}
    pub(crate) fn unprotect(_pid: u32) {}
}

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{SpawnError, SuperviseError};
use self::forwarder::{Forwarder, StreamLabel};

/// Grace period between SIGTERM and SIGKILL when tearing a child down.
const TERM_GRACE: std::time::Duration = std::time::Duration::from_secs(10);

/// Pause before retrying a failed restart with the same snapshot.
const RESTART_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);

/// Configuration for the supervisor.
#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
    /// Argv of the child, executable first.
    pub command: Vec<String>,
    /// Exit instead of restarting when the child exits.
    pub one_shot: bool,
    /// Do not start the zombie reaper.
    pub no_reaper: bool,
    /// Extra sinks for the child's stdout lines.
    pub stdout_sinks: Vec<mpsc::Sender<String>>,
    /// Extra sinks for the child's stderr lines.
    pub stderr_sinks: Vec<mpsc::Sender<String>>,
}

impl SupervisorConfig {
    /// Resolve the program to execute: absolute paths are used as-is,
    /// anything else is looked up on `$PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::ProgramNotFound`] if the lookup fails.
    pub fn program(&self) -> Result<PathBuf, SpawnError> {
        let program = self.command.first().cloned().unwrap_or_default();
        if std::path::Path::new(&program).is_absolute() {
            return Ok(PathBuf::from(program));
        }

        which::which(&program).map_err(|source| SpawnError::ProgramNotFound { program, source })
    }

    /// Arguments passed to the program.
    #[must_use]
    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }

    /// The command as a display string.
    #[must_use]
    pub fn command_string(&self) -> String {
        self.command.join(" ")
    }
}

/// One spawned child together with its cancellation scope and waiter.
struct Generation {
    id: u64,
    cancel: CancellationToken,
    pid: u32,
    waiter: JoinHandle<()>,
}

/// The child lifecycle manager.
pub struct Supervisor {
    config: SupervisorConfig,
    last_env: Option<Vec<String>>,
    current: Option<Generation>,
    next_generation: u64,
}

impl Supervisor {
    #[must_use]
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            last_env: None,
            current: None,
            next_generation: 0,
        }
    }

    /// Run the supervision loop until shutdown: spawn on the first
    /// snapshot, restart on snapshot updates and child exits, and reap the
    /// child before returning.
    ///
    /// Returns the last child exit status observed by the loop; `None` when
    /// the child was torn down by shutdown or its status was lost.
    ///
    /// # Errors
    ///
    /// Returns [`SuperviseError::EmptyCommand`] when no command is
    /// configured and [`SuperviseError::Spawn`] when the *initial* spawn
    /// fails. Restart-time spawn failures are logged and retried.
    pub async fn start(
        mut self,
        mut env_rx: mpsc::Receiver<Vec<String>>,
        cancel: CancellationToken,
    ) -> Result<Option<ExitStatus>, SuperviseError> {
        if self.config.command.is_empty() {
            return Err(SuperviseError::EmptyCommand);
        }

        #[cfg(target_os = "linux")]
        if !self.config.no_reaper {
            info!("starting subprocess reaper");
            reaper::spawn(cancel.clone());
        }

        info!(command = %self.config.command_string(), "starting child supervisor");

        let (state_tx, mut state_rx) = mpsc::channel::<ExitEvent>(1);
        let mut last_exit = None;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("supervisor shutting down");
                    break;
                }
                snapshot = env_rx.recv() => {
                    let Some(snapshot) = snapshot else {
                        info!("environment channel closed, supervisor exiting");
                        break;
                    };
                    self.last_env = Some(snapshot);

                    if let Some(old) = self.current.take() {
                        info!(pid = old.pid, "environment updated, replacing child");
                        old.cancel.cancel();
                        match self.respawn(&cancel, &state_tx).await {
                            Some(generation) => self.current = Some(generation),
                            None => break,
                        }
                    } else {
                        // Initial spawn; failure here is fatal.
                        let generation = self.spawn_generation(&cancel, &state_tx)?;
                        self.current = Some(generation);
                    }
                }
                Some(event) = state_rx.recv() => {
                    // A waiter that lost the cancellation race can still
                    // have enqueued its event before the generation was
                    // replaced; only the current generation may restart.
                    if self.current.as_ref().is_none_or(|current| current.id != event.generation) {
                        debug!(generation = event.generation, "ignoring exit event from replaced generation");
                        continue;
                    }

                    log_exit(&event);
                    last_exit = event.status;
                    self.current = None;

                    if self.config.one_shot {
                        info!("one-shot mode, supervisor exiting");
                        break;
                    }

                    match self.respawn(&cancel, &state_tx).await {
                        Some(generation) => self.current = Some(generation),
                        None => break,
                    }
                }
            }
        }

        // Tear down and reap the current child before returning.
        if let Some(generation) = self.current.take() {
            generation.cancel.cancel();
            if let Err(err) = generation.waiter.await {
                warn!(error = %err, "child waiter task failed during shutdown");
            }
        }

        Ok(last_exit)
    }

    /// Spawn with the last snapshot, retrying until it works or the parent
    /// is cancelled. Used for every spawn after the initial one.
    async fn respawn(
        &mut self,
        parent: &CancellationToken,
        state_tx: &mpsc::Sender<ExitEvent>,
    ) -> Option<Generation> {
        loop {
            match self.spawn_generation(parent, state_tx) {
                Ok(generation) => return Some(generation),
                Err(err) => {
                    error!(error = %err, "could not restart child, retrying");
                    tokio::select! {
                        () = parent.cancelled() => return None,
                        () = tokio::time::sleep(RESTART_BACKOFF) => {}
                    }
                }
            }
        }
    }

    /// Spawn one child generation from the cached snapshot.
    fn spawn_generation(
        &mut self,
        parent: &CancellationToken,
        state_tx: &mpsc::Sender<ExitEvent>,
    ) -> Result<Generation, SpawnError> {
        let program = self.config.program()?;
        let snapshot = self.last_env.clone().unwrap_or_default();

        let mut command = Command::new(&program);
        command
            .args(self.config.args())
            .env_clear()
            .envs(snapshot.iter().filter_map(|entry| entry.split_once('=')))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| SpawnError::StartFailed {
            program: program.display().to_string(),
            source,
        })?;

        let stdout = child.stdout.take().ok_or(SpawnError::PipeSetup)?;
        let stderr = child.stderr.take().ok_or(SpawnError::PipeSetup)?;
        let pid = child.id().unwrap_or_default();

        // Shield this child from the zombie reaper until its waiter has
        // collected the exit status.
        reaper::protect(pid);

        let cancel = parent.child_token();

        let mut stdout_fwd = Forwarder::new(stdout, StreamLabel::Stdout);
        for sink in &self.config.stdout_sinks {
            stdout_fwd.tee(sink.clone());
        }
        stdout_fwd.start(cancel.clone());

        let mut stderr_fwd = Forwarder::new(stderr, StreamLabel::Stderr);
        for sink in &self.config.stderr_sinks {
            stderr_fwd.tee(sink.clone());
        }
        stderr_fwd.start(cancel.clone());

        let id = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        info!(pid, generation = id, program = %program.display(), "child process started");

        let waiter = tokio::spawn(wait_child(id, pid, child, cancel.clone(), state_tx.clone()));

        Ok(Generation {
            id,
            cancel,
            pid,
            waiter,
        })
    }
}

/// Exit notification from a generation's waiter.
struct ExitEvent {
    /// Which generation exited.
    generation: u64,
    /// The collected exit status; `None` when it was lost to the global
    /// reaper.
    status: Option<ExitStatus>,
}

/// Per-generation waiter: wait for the OS-level exit, then race against the
/// generation's cancel token. A generation that was replaced or shut down
/// stays silent; only natural exits of the current generation become
/// `child_state` events.
async fn wait_child(
    generation: u64,
    pid: u32,
    mut child: Child,
    cancel: CancellationToken,
    state_tx: mpsc::Sender<ExitEvent>,
) {
    tokio::select! {
        result = child.wait() => {
            let status = match result {
                Ok(status) => Some(status),
                Err(err) => {
                    // The child spawned and exited before the reaper shield
                    // took effect; it is gone either way.
                    warn!(error = %err, "could not collect child exit status");
                    None
                }
            };

            if cancel.is_cancelled() {
                debug!(generation, "child generation already torn down, suppressing exit event");
            } else {
                let _ = state_tx.send(ExitEvent { generation, status }).await;
            }
        }
        () = cancel.cancelled() => {
            terminate(&mut child).await;
        }
    }

    // The child has been waited on in every branch above.
    reaper::unprotect(pid);
}

/// Terminate a cancelled child: SIGTERM, then SIGKILL after a grace
/// period. Always reaps before returning.
async fn terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        // Already exited; collect the status.
        let _ = child.wait().await;
        return;
    };

    debug!(pid, "terminating child process");
    send_sigterm(pid);

    match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(pid, "child did not exit after SIGTERM, sending SIGKILL");
            if child.start_kill().is_ok() {
                let _ = child.wait().await;
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(i32::try_from(pid).unwrap_or_default());
    if let Err(err) = kill(pid, Signal::SIGTERM) {
        debug!(error = %err, "could not deliver SIGTERM to child");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

fn log_exit(event: &ExitEvent) {
    match event.status {
        Some(status) => match status.code() {
            Some(code) => info!(code, "child exited"),
            None => info!("child terminated by signal"),
        },
        None => info!("child exited with unknown status"),
    }
}
