use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::credentials::{AuthSecret, Credentials};
use crate::error::SupervisorError;

/// How the VPN client is invoked
#[derive(Clone, Debug)]
pub struct ClientCommand {
    pub program: PathBuf,
    /// Placed before the protocol arguments (e.g. `sudo` running `openconnect`)
    pub leading_args: Vec<String>,
    /// How long to wait after SIGTERM before killing the client (None = forever)
    pub terminate_grace: Option<Duration>,
}

impl Default for ClientCommand {
    fn default() -> Self {
        Self {
            program: PathBuf::from("openconnect"),
            leading_args: Vec::new(),
            terminate_grace: Some(Duration::from_secs(10)),
        }
    }
}

/// A freshly started client with its output pipes detached
pub(crate) struct SpawnedClient {
    pub child: Child,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

impl ClientCommand {
    /// Start the client and feed it the secret.
    ///
    /// Stdin is closed once the secret is written, so the client sees EOF
    /// after one line of input.
    pub(crate) fn spawn(
        &self,
        credentials: &Credentials,
        secret: AuthSecret<'_>,
    ) -> Result<SpawnedClient, SupervisorError> {
        let args = credentials.client_args(secret);
        info!(
            "Starting {} with args: {:?} {:?}",
            self.program.display(),
            self.leading_args,
            args
        );

        let mut child = Command::new(&self.program)
            .args(&self.leading_args)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| {
                error!("Failed to spawn '{}': {}", self.program.display(), source);
                SupervisorError::Launch {
                    program: self.program.clone(),
                    source,
                }
            })?;

        let streams = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, stderr) = match streams {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            (stdin, stdout, _) => {
                let missing = if stdin.is_none() {
                    "stdin"
                } else if stdout.is_none() {
                    "stdout"
                } else {
                    "stderr"
                };
                abandon(child);
                return Err(SupervisorError::StreamUnavailable(missing));
            }
        };

        info!("Client started with PID: {:?}", child.id());

        let secret = secret.as_bytes().to_vec();
        tokio::spawn(async move {
            let mut stdin = stdin;
            if let Err(e) = stdin.write_all(&secret).await {
                warn!("Failed to write secret to client stdin: {}", e);
                return;
            }
            if let Err(e) = stdin.shutdown().await {
                debug!("Closing client stdin: {}", e);
            }
        });

        Ok(SpawnedClient {
            child,
            stdout,
            stderr,
        })
    }
}

/// Kill a child we could not wire up and reap it in the background
fn abandon(mut child: Child) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to kill half-started client: {}", e);
    }
    tokio::spawn(async move {
        let _ = child.wait().await;
    });
}

/// Owned handle to the running client.
///
/// The child itself lives in the exit watcher task; this handle can signal
/// it and wait for the watcher to observe its exit.
pub(crate) struct ManagedProcess {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    watcher: JoinHandle<()>,
}

impl ManagedProcess {
    /// Spawn the exit watcher for `child`.
    ///
    /// `on_exit` runs once the child has been reaped.
    pub fn watch<F, Fut>(mut child: Child, on_exit: F) -> Self
    where
        F: FnOnce(std::io::Result<ExitStatus>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let watcher = tokio::spawn(async move {
            debug!("Client {:?} is running", pid);
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill client {:?}: {}", pid, e);
                    }
                    child.wait().await
                }
            };
            match &status {
                Ok(status) => info!("Client {:?} terminated: {}", pid, status),
                Err(e) => warn!("Failed to wait for client {:?}: {}", pid, e),
            }
            on_exit(status).await;
        });

        Self {
            pid,
            kill_tx: Some(kill_tx),
            watcher,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the client to exit (SIGTERM on unix)
    pub fn request_termination(&mut self) {
        if self.watcher.is_finished() {
            debug!("Client {:?} already exited, not signaling", self.pid);
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = self.pid {
                info!("Sending SIGTERM to client {}", pid);
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!("Failed to send SIGTERM to client {}: {}", pid, e);
                }
            }
        }
        #[cfg(not(unix))]
        {
            self.force_kill();
        }
    }

    fn force_kill(&mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }

    /// Wait until the watcher has reaped the client.
    ///
    /// With a grace period, a client still alive when it runs out is killed.
    pub async fn wait_for_exit(mut self, grace: Option<Duration>) {
        if let Some(grace) = grace {
            if tokio::time::timeout(grace, &mut self.watcher).await.is_ok() {
                return;
            }
            warn!(
                "Client {:?} still running {:?} after SIGTERM, killing it",
                self.pid, grace
            );
            self.force_kill();
        }

        if let Err(e) = (&mut self.watcher).await {
            error!("Client exit watcher failed: {}", e);
        }
    }
}
