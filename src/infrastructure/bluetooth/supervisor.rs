//! Reconnection Supervisor
//!
//! Runs a slot's [`DeviceSession`] over and over on a dedicated thread:
//!
//! ```text
//! Idle ─▶ Connecting ─▶ Connected ─▶ Backoff ─▶ Connecting ─▶ ...
//!              │                        ▲
//!              └────── failed ──────────┘
//!
//! any state ── stop token ──▶ Stopped
//! ```
//!
//! The retry delay is fixed and retries are unlimited; a wireless slot only
//! stops trying when it is disabled. A panic on the worker thread ends the
//! supervisor with the slot's status set to `Failed`.

use crate::domain::models::{ConnectionStatus, SlotId, StopToken};
use crate::infrastructure::bluetooth::link::LinkProvider;
use crate::infrastructure::bluetooth::session::{DeviceSession, SessionOutcome};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Connecting,
    Connected,
    Backoff,
    Stopped,
}

#[derive(Debug, Clone)]
struct StateCell(Arc<Mutex<SupervisorState>>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(SupervisorState::Idle)))
    }

    fn set(&self, state: SupervisorState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn get(&self) -> SupervisorState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ReconnectSupervisor<P: LinkProvider> {
    session: DeviceSession<P>,
    retry_delay: Duration,
    stop: StopToken,
    state: StateCell,
}

impl<P: LinkProvider> ReconnectSupervisor<P> {
    /// The supervisor observes the same stop token as its session
    pub fn new(session: DeviceSession<P>, retry_delay: Duration) -> Self {
        let stop = session.stop_token().clone();
        Self {
            session,
            retry_delay,
            stop,
            state: StateCell::new(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state.get()
    }

    /// Retry loop; returns once the stop token has been observed
    pub async fn run(self) {
        let slot = self.session.slot();
        info!(slot = %slot, address = %self.session.address(), "Supervisor started");

        let mut failures: u64 = 0;
        while !self.stop.is_stopped() {
            self.state.set(SupervisorState::Connecting);

            let outcome = self
                .session
                .run_once(|| self.state.set(SupervisorState::Connected))
                .await;

            match outcome {
                SessionOutcome::Stopped => break,
                SessionOutcome::ConnectFailed(_) => failures += 1,
                SessionOutcome::LinkLost => failures = 0,
            }

            self.state.set(SupervisorState::Backoff);
            debug!(
                slot = %slot,
                failures,
                "Retrying in {:?}",
                self.retry_delay
            );

            tokio::select! {
                biased;
                _ = self.stop.stopped() => break,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        self.state.set(SupervisorState::Stopped);
        info!(slot = %slot, "Supervisor stopped");
    }

    /// Run on a dedicated thread with its own single-threaded runtime
    pub fn spawn(self) -> std::io::Result<SupervisorHandle> {
        let slot = self.session.slot();
        let stop = self.stop.clone();
        let state = self.state.clone();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(format!("ble-slot-{}", slot))
            .spawn(move || {
                // Dropped last, after the runtime, even if the worker panics
                let _done = done_tx;
                let status = self.session.status().clone();
                let worker_state = self.state.clone();

                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(slot = %slot, "Failed to create runtime: {}", e);
                        status.set(ConnectionStatus::failed(format!("worker runtime: {}", e)));
                        worker_state.set(SupervisorState::Stopped);
                        return;
                    }
                };

                let outcome = panic::catch_unwind(AssertUnwindSafe(|| rt.block_on(self.run())));
                if let Err(payload) = outcome {
                    let message = panic_message(payload.as_ref());
                    error!(slot = %slot, "Supervisor panicked: {}", message);
                    worker_state.set(SupervisorState::Stopped);
                    status.set(ConnectionStatus::failed(format!("worker panicked: {}", message)));
                }
            })?;

        Ok(SupervisorHandle {
            slot,
            stop,
            state,
            done: done_rx,
            thread: Some(thread),
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Owner's handle to a running supervisor thread.
///
/// Dropping the handle signals stop but does not wait.
pub struct SupervisorHandle {
    slot: SlotId,
    stop: StopToken,
    state: StateCell,
    done: mpsc::Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl SupervisorHandle {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn state(&self) -> SupervisorState {
        self.state.get()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Signal stop and wait up to `timeout` for the worker to exit.
    ///
    /// Returns `false` if the worker was still running at the deadline; it
    /// is then detached and winds down on its own.
    pub fn stop_and_join(mut self, timeout: Duration) -> bool {
        self.stop.stop();

        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(thread) = self.thread.take() {
                    if thread.join().is_err() {
                        error!(slot = %self.slot, "Supervisor thread panicked");
                    }
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    slot = %self.slot,
                    "Supervisor did not stop within {:?}, detaching",
                    timeout
                );
                false
            }
        }
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ConnectionPhase, SharedStatus};
    use crate::infrastructure::bluetooth::session::SessionConfig;
    use crate::infrastructure::bluetooth::simulated::{SimDevice, SimulatedProvider};
    use std::time::Instant;
    use tokio::sync::mpsc as tokio_mpsc;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:01";

    fn supervisor(
        provider: Arc<SimulatedProvider>,
        retry_delay: Duration,
    ) -> (ReconnectSupervisor<SimulatedProvider>, SharedStatus) {
        let (tx, _rx) = tokio_mpsc::unbounded_channel();
        let status = SharedStatus::new();
        let config = SessionConfig {
            connect_timeout: Duration::from_secs(1),
            liveness_poll: Duration::from_millis(5),
            characteristic: "beb5483e-36e1-4688-b7f5-ea07361b26a8".to_string(),
        };
        let session = DeviceSession::new(
            SlotId::One,
            ADDRESS.to_string(),
            provider,
            config,
            status.clone(),
            tx,
            StopToken::new(),
        );
        (ReconnectSupervisor::new(session, retry_delay), status)
    }

    fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_keeps_retrying_unreachable_device() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.add_device(ADDRESS, SimDevice::unreachable());
        let (supervisor, status) = supervisor(provider.clone(), Duration::from_millis(2));

        let handle = supervisor.spawn().unwrap();
        wait_for("ten attempts", || provider.connect_attempts(ADDRESS) >= 10);

        assert!(!handle.is_finished());
        assert_ne!(handle.state(), SupervisorState::Stopped);
        assert_eq!(status.get().phase, ConnectionPhase::Failed);
        assert!(handle.stop_and_join(Duration::from_secs(2)));
    }

    #[test]
    fn test_reconnects_after_link_loss() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.add_device(ADDRESS, SimDevice::reachable());
        let (supervisor, status) = supervisor(provider.clone(), Duration::from_millis(5));

        let handle = supervisor.spawn().unwrap();
        wait_for("first connection", || status.get().is_connected());
        wait_for("connected state", || handle.state() == SupervisorState::Connected);

        provider.sever(ADDRESS);
        wait_for("second attempt", || provider.connect_attempts(ADDRESS) >= 2);
        wait_for("reconnection", || status.get().is_connected());

        assert!(handle.stop_and_join(Duration::from_secs(2)));
        assert_eq!(provider.open_links(), 0);
    }

    #[test]
    fn test_stop_during_backoff() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.add_device(ADDRESS, SimDevice::unreachable());
        let (supervisor, _status) = supervisor(provider.clone(), Duration::from_secs(30));

        let handle = supervisor.spawn().unwrap();
        wait_for("backoff", || handle.state() == SupervisorState::Backoff);

        let started = Instant::now();
        assert!(handle.stop_and_join(Duration::from_secs(2)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(provider.connect_attempts(ADDRESS), 1);
    }

    #[test]
    fn test_worker_panic_reports_failed() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.add_device(ADDRESS, SimDevice::panicking());
        let (supervisor, status) = supervisor(provider.clone(), Duration::from_millis(5));

        let handle = supervisor.spawn().unwrap();
        wait_for("worker exit", || handle.is_finished());

        let status = status.get();
        assert_eq!(status.phase, ConnectionPhase::Failed);
        assert!(status.reason.unwrap().contains("worker panicked"));
        assert_eq!(handle.state(), SupervisorState::Stopped);
        assert!(handle.stop_and_join(Duration::from_secs(1)));
    }

    #[test]
    fn test_panic_message() {
        let text: Box<dyn Any + Send> = Box::new("boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(text.as_ref()), "boom");
        assert_eq!(panic_message(owned.as_ref()), "bang");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn test_run_returns_immediately_when_already_stopped() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.add_device(ADDRESS, SimDevice::reachable());
        let (supervisor, _status) = supervisor(provider.clone(), Duration::from_millis(5));

        supervisor.stop.stop();
        let state = supervisor.state.clone();
        supervisor.run().await;

        assert_eq!(state.get(), SupervisorState::Stopped);
        assert_eq!(provider.connect_attempts(ADDRESS), 0);
    }
}
