use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{Mutex, MutexGuard, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::classifier::{StdoutLine, classify_stderr, classify_stdout, parse_session_expiry};
use crate::credentials::Credentials;
use crate::error::SupervisorError;
use crate::process::{ClientCommand, ManagedProcess};
use crate::state::{Attempt, ConnectionStatus, Generation, SupervisorState};

type SharedState = Arc<Mutex<SupervisorState>>;

/// How long a closed stdout waits for stderr to drain before resolving
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How a connect attempt resolved
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The caller has to finish a browser login at `url`
    SamlChallenge { url: String },
    Connected,
    /// The client stopped talking without connecting or reporting a failure
    Disconnected,
    /// The client stopped talking after printing a failure line
    Failed { reason: String },
}

/// Supervises the single VPN client process.
///
/// `operations` serializes whole API calls (including a connect's wait for
/// its notification); `state` guards the supervisor state and is shared with
/// the output workers and the exit watcher.
pub struct Supervisor {
    command: ClientCommand,
    operations: Mutex<()>,
    state: SharedState,
}

impl Supervisor {
    pub fn new(command: ClientCommand) -> Self {
        Self {
            command,
            operations: Mutex::new(()),
            state: Arc::new(Mutex::new(SupervisorState::default())),
        }
    }

    pub fn command(&self) -> &ClientCommand {
        &self.command
    }

    /// Replace any running client with a new one and wait for it to resolve.
    ///
    /// Returns once the client printed a SAML redirect, reported the tunnel
    /// up, or closed its stdout. There is no timeout.
    pub async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<ConnectOutcome, SupervisorError> {
        let secret = credentials.validate()?;

        let _operation = self.operations.lock().await;
        let state = self.state.lock().await;
        let mut state = self.teardown(state).await;

        let generation = state.next_generation();
        let spawned = self.command.spawn(credentials, secret)?;

        let (notify_tx, notify_rx) = oneshot::channel();
        let (drained_tx, drained_rx) = oneshot::channel();
        let stdout_worker = spawn_output_worker(
            self.state.clone(),
            generation,
            OutputStream::Stdout {
                stderr_drained: drained_rx,
            },
            spawned.stdout,
        );
        let stderr_worker = spawn_output_worker(
            self.state.clone(),
            generation,
            OutputStream::Stderr {
                drained: drained_tx,
            },
            spawned.stderr,
        );
        let watched_state = self.state.clone();
        let process = ManagedProcess::watch(spawned.child, move |_status| async move {
            watched_state.lock().await.process_exited(generation);
        });
        info!("Started client {:?} for {}", process.pid(), generation);

        state.install(
            Attempt::new(generation, notify_tx)
                .with_process(process)
                .with_workers(stdout_worker, stderr_worker),
        );

        info!("Waiting for {} to resolve", generation);
        drop(state);
        // A closed channel means the attempt was retired; either way it is over
        let _ = notify_rx.await;
        let mut state = self.state.lock().await;
        debug!("Done waiting for {}", generation);
        debug_assert!(state.is_live(generation) && state.notified());

        if let Some(url) = state.take_saml_url() {
            info!("Connect got a SAML URL: {}", url);
            return Ok(ConnectOutcome::SamlChallenge { url });
        }

        let outcome = match (state.status(), state.last_error()) {
            (ConnectionStatus::Connected, _) => ConnectOutcome::Connected,
            (ConnectionStatus::Disconnected, Some(reason)) => ConnectOutcome::Failed {
                reason: reason.to_string(),
            },
            (ConnectionStatus::Disconnected, None) => ConnectOutcome::Disconnected,
        };
        info!("Connect did not get a SAML URL, returning {:?}", outcome);
        Ok(outcome)
    }

    /// Stop the client, if any. Always ends disconnected.
    pub async fn disconnect(&self) -> ConnectionStatus {
        let _operation = self.operations.lock().await;
        let state = self.state.lock().await;
        let state = self.teardown(state).await;
        state.status()
    }

    pub async fn status(&self) -> ConnectionStatus {
        let _operation = self.operations.lock().await;
        self.state.lock().await.status()
    }

    /// Most recent failure line printed by the client for the current attempt
    pub async fn last_error(&self) -> Option<String> {
        let _operation = self.operations.lock().await;
        self.state.lock().await.last_error().map(str::to_string)
    }

    /// Tear everything down before the host process exits
    pub async fn shutdown(&self) {
        info!("Supervisor shutdown requested");
        let _operation = self.operations.lock().await;
        let state = self.state.lock().await;
        drop(self.teardown(state).await);
        info!("Supervisor shutdown complete");
    }

    /// Terminate the current client and retire its attempt.
    ///
    /// The state lock is released while waiting for the client to exit and
    /// for its workers to finish, and held again on return.
    async fn teardown<'a>(
        &'a self,
        mut state: MutexGuard<'a, SupervisorState>,
    ) -> MutexGuard<'a, SupervisorState> {
        if let Some(mut process) = state.take_process() {
            process.request_termination();
            info!("Waiting for client {:?} to terminate", process.pid());
            drop(state);
            process.wait_for_exit(self.command.terminate_grace).await;
            state = self.state.lock().await;
            info!("Client terminated");
        }

        if let Some(retired) = state.retire() {
            drop(state);
            retired.join().await;
            state = self.state.lock().await;
        }

        debug_assert!(!state.has_process());
        state
    }
}

/// Which client stream a worker reads.
///
/// The stderr worker drops `drained` when it reaches EOF; the stdout worker
/// waits for that before resolving the attempt, so a failure line printed
/// right before exit is recorded first.
#[derive(Debug)]
enum OutputStream {
    Stdout {
        stderr_drained: oneshot::Receiver<()>,
    },
    Stderr {
        drained: oneshot::Sender<()>,
    },
}

impl OutputStream {
    fn name(&self) -> &'static str {
        match self {
            OutputStream::Stdout { .. } => "stdout",
            OutputStream::Stderr { .. } => "stderr",
        }
    }
}

/// Read one of the client's streams line by line until EOF
fn spawn_output_worker<R>(
    state: SharedState,
    generation: Generation,
    stream: OutputStream,
    reader: R,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        debug!("Start reading {} of {}", stream.name(), generation);
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\r', '\n']);
                    debug!("client[{}]: {}", stream.name(), line);
                    match &stream {
                        OutputStream::Stdout { .. } => {
                            handle_stdout_line(&state, generation, line).await
                        }
                        OutputStream::Stderr { .. } => {
                            handle_stderr_line(&state, generation, line).await
                        }
                    }
                }
                Err(e) => {
                    warn!("Error reading client {}: {}", stream.name(), e);
                    break;
                }
            }
        }
        debug!("Done reading {} of {}", stream.name(), generation);

        match stream {
            OutputStream::Stdout { stderr_drained } => {
                if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, stderr_drained)
                    .await
                    .is_err()
                {
                    debug!("stderr of {} still open after stdout closed", generation);
                }
                state.lock().await.stdout_closed(generation);
            }
            OutputStream::Stderr { drained } => drop(drained),
        }
    })
}

async fn handle_stdout_line(state: &SharedState, generation: Generation, line: &str) {
    let classified = classify_stdout(line);
    if classified.resolves_attempt() {
        let mut state = state.lock().await;
        match classified {
            StdoutLine::SamlRedirect { url } => state.record_saml_url(generation, url),
            StdoutLine::Connected { reason } => state.mark_connected(generation, reason),
            _ => {}
        }
        return;
    }

    match classified {
        StdoutLine::SessionExpiry { raw } => match parse_session_expiry(raw) {
            Ok(expires) => info!("Session expiration: {}", expires),
            Err(warning) => warn!("{}", warning),
        },
        StdoutLine::GatewaysAvailable { count } => {
            info!("Number of gateways available: {}", count)
        }
        _ => {}
    }
}

async fn handle_stderr_line(state: &SharedState, generation: Generation, line: &str) {
    if let Some(failure) = classify_stderr(line) {
        state.lock().await.record_failure(generation, failure);
    }
}
