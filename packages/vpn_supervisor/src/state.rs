use std::fmt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::process::ManagedProcess;

/// Identifies one connection attempt.
///
/// Workers, the exit watcher and the notification capture the generation
/// of the attempt that spawned them and only act while it is still live.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Generation(pub u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt-{}", self.0)
    }
}

/// Whether the tunnel is up
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything owned by one connection attempt
pub(crate) struct Attempt {
    generation: Generation,
    process: Option<ManagedProcess>,
    stdout_worker: Option<JoinHandle<()>>,
    stderr_worker: Option<JoinHandle<()>>,
    /// Consumed when the attempt resolves; `None` means already notified
    notifier: Option<oneshot::Sender<()>>,
    pending_saml_url: Option<String>,
    last_error: Option<String>,
    connected: bool,
}

impl Attempt {
    pub fn new(generation: Generation, notifier: oneshot::Sender<()>) -> Self {
        Self {
            generation,
            process: None,
            stdout_worker: None,
            stderr_worker: None,
            notifier: Some(notifier),
            pending_saml_url: None,
            last_error: None,
            connected: false,
        }
    }

    pub fn with_process(mut self, process: ManagedProcess) -> Self {
        self.process = Some(process);
        self
    }

    fn notify(&mut self) {
        if let Some(notifier) = self.notifier.take() {
            debug!("Notifying waiter of {}", self.generation);
            let _ = notifier.send(());
        }
    }

    pub fn with_workers(mut self, stdout: JoinHandle<()>, stderr: JoinHandle<()>) -> Self {
        self.stdout_worker = Some(stdout);
        self.stderr_worker = Some(stderr);
        self
    }
}

/// What is left of an attempt once it has been retired
pub(crate) struct RetiredAttempt {
    generation: Generation,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl RetiredAttempt {
    /// Wait for the attempt's output workers to drain their streams
    pub async fn join(self) {
        for (stream, worker) in self.workers {
            debug!("Waiting for {} worker of {}", stream, self.generation);
            if let Err(e) = worker.await {
                warn!("{} worker of {} failed: {}", stream, self.generation, e);
            }
        }
    }
}

/// Supervisor state, guarded by the supervisor's state lock
#[derive(Default)]
pub(crate) struct SupervisorState {
    last_generation: u64,
    attempt: Option<Attempt>,
}

impl SupervisorState {
    /// Allocate the generation for a new attempt.
    ///
    /// Must only be called once the previous attempt has been retired.
    pub fn next_generation(&mut self) -> Generation {
        debug_assert!(self.attempt.is_none());
        self.last_generation += 1;
        Generation(self.last_generation)
    }

    pub fn install(&mut self, attempt: Attempt) {
        debug_assert!(self.attempt.is_none());
        debug!("Installing {}", attempt.generation);
        self.attempt = Some(attempt);
    }

    pub fn is_live(&self, generation: Generation) -> bool {
        self.attempt
            .as_ref()
            .is_some_and(|a| a.generation == generation)
    }

    fn live_mut(&mut self, generation: Generation) -> Option<&mut Attempt> {
        if !self.is_live(generation) {
            debug!("Discarding effect from superseded {}", generation);
            return None;
        }
        self.attempt.as_mut()
    }

    pub fn status(&self) -> ConnectionStatus {
        match &self.attempt {
            Some(a) if a.process.is_some() && a.connected => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }

    pub fn has_process(&self) -> bool {
        self.attempt.as_ref().is_some_and(|a| a.process.is_some())
    }

    /// True once the current attempt has fired its notification
    pub fn notified(&self) -> bool {
        self.attempt.as_ref().is_some_and(|a| a.notifier.is_none())
    }

    pub fn last_error(&self) -> Option<&str> {
        self.attempt.as_ref().and_then(|a| a.last_error.as_deref())
    }

    /// Hand out the captured SAML URL, at most once
    pub fn take_saml_url(&mut self) -> Option<String> {
        self.attempt
            .as_mut()
            .and_then(|a| a.pending_saml_url.take())
    }

    pub fn record_saml_url(&mut self, generation: Generation, url: &str) {
        if let Some(attempt) = self.live_mut(generation) {
            info!("Found SAML URL: {}", url);
            attempt.pending_saml_url = Some(url.to_string());
            attempt.notify();
        }
    }

    pub fn mark_connected(&mut self, generation: Generation, reason: &str) {
        if let Some(attempt) = self.live_mut(generation) {
            info!("Connected: {}", reason);
            attempt.connected = true;
            attempt.notify();
        }
    }

    pub fn record_failure(&mut self, generation: Generation, line: &str) {
        if let Some(attempt) = self.live_mut(generation) {
            attempt.last_error = Some(line.to_string());
        }
    }

    /// The client closed its stdout; resolve the attempt if nothing else did
    pub fn stdout_closed(&mut self, generation: Generation) {
        if let Some(attempt) = self.live_mut(generation) {
            debug!("Stdout of {} closed", generation);
            attempt.notify();
        }
    }

    pub fn process_exited(&mut self, generation: Generation) {
        if let Some(attempt) = self.live_mut(generation) {
            attempt.connected = false;
        }
    }

    /// Detach the running process so it can be terminated
    pub fn take_process(&mut self) -> Option<ManagedProcess> {
        self.attempt.as_mut().and_then(|a| a.process.take())
    }

    /// End the current attempt.
    ///
    /// Its generation stops being live, its notification is closed and all
    /// attempt-scoped fields are dropped. Returns the workers still to join.
    pub fn retire(&mut self) -> Option<RetiredAttempt> {
        let attempt = self.attempt.take()?;
        debug!("Retiring {}", attempt.generation);
        let workers = [
            ("stdout", attempt.stdout_worker),
            ("stderr", attempt.stderr_worker),
        ]
        .into_iter()
        .filter_map(|(stream, worker)| worker.map(|w| (stream, w)))
        .collect();
        Some(RetiredAttempt {
            generation: attempt.generation,
            workers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot::error::TryRecvError;

    fn state_with_attempt() -> (SupervisorState, Generation, oneshot::Receiver<()>) {
        let mut state = SupervisorState::default();
        let generation = state.next_generation();
        let (tx, rx) = oneshot::channel();
        state.install(Attempt::new(generation, tx));
        (state, generation, rx)
    }

    #[test]
    fn test_empty_state() {
        let state = SupervisorState::default();
        assert_eq!(state.status(), ConnectionStatus::Disconnected);
        assert!(!state.has_process());
        assert!(!state.notified());
        assert!(state.last_error().is_none());
        assert!(!state.is_live(Generation(0)));
    }

    #[test]
    fn test_generations_increase() {
        let mut state = SupervisorState::default();
        let first = state.next_generation();
        let second = state.next_generation();
        assert!(second > first);
        assert_eq!(first.to_string(), "attempt-1");
    }

    #[test]
    fn test_saml_url_notifies_and_is_consumed_once() {
        let (mut state, generation, mut rx) = state_with_attempt();
        state.record_saml_url(generation, "https://idp.example/login");

        assert!(state.notified());
        assert_eq!(rx.try_recv(), Ok(()));
        assert_eq!(
            state.take_saml_url().as_deref(),
            Some("https://idp.example/login")
        );
        assert_eq!(state.take_saml_url(), None);
    }

    #[test]
    fn test_notification_fires_once() {
        let (mut state, generation, mut rx) = state_with_attempt();
        state.mark_connected(generation, "tunnel connected");
        state.record_saml_url(generation, "https://idp.example/login");
        state.stdout_closed(generation);

        assert_eq!(rx.try_recv(), Ok(()));
        // The sender was consumed by the first event
        assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
        // Later events still update state
        assert!(state.take_saml_url().is_some());
    }

    #[test]
    fn test_stdout_close_notifies() {
        let (mut state, generation, mut rx) = state_with_attempt();
        state.stdout_closed(generation);
        assert_eq!(rx.try_recv(), Ok(()));
        assert_eq!(state.take_saml_url(), None);
        assert_eq!(state.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let (mut state, old, _old_rx) = state_with_attempt();
        state.retire();
        let current = state.next_generation();
        let (tx, mut rx) = oneshot::channel();
        state.install(Attempt::new(current, tx));

        state.record_saml_url(old, "https://stale.example/");
        state.mark_connected(old, "tunnel connected");
        state.record_failure(old, "Failed to connect");
        state.stdout_closed(old);

        assert!(!state.notified());
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(state.take_saml_url(), None);
        assert!(state.last_error().is_none());
        assert!(!state.is_live(old));
        assert!(state.is_live(current));
    }

    #[test]
    fn test_failure_is_advisory() {
        let (mut state, generation, mut rx) = state_with_attempt();
        state.record_failure(generation, "Failed to complete authentication");
        assert_eq!(
            state.last_error(),
            Some("Failed to complete authentication")
        );
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_status_requires_process() {
        let (mut state, generation, _rx) = state_with_attempt();
        state.mark_connected(generation, "tunnel connected");
        // No managed process attached to this attempt
        assert_eq!(state.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_retire_clears_attempt_scope() {
        let (mut state, generation, mut rx) = state_with_attempt();
        state.record_saml_url(generation, "https://idp.example/login");
        state.record_failure(generation, "Failed");
        let _ = rx.try_recv();

        let retired = state.retire().unwrap();
        assert!(retired.workers.is_empty());
        assert_eq!(state.take_saml_url(), None);
        assert!(state.last_error().is_none());
        assert!(!state.notified());
        assert!(state.retire().is_none());
    }

    #[test]
    fn test_retire_closes_notification() {
        let (mut state, _generation, mut rx) = state_with_attempt();
        state.retire();
        assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
    }
}
