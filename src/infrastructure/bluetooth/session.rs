//! Device Session
//!
//! One connection attempt and its active lifetime for one device address.
//! Retrying is the supervisor's job; a session returns as soon as the
//! attempt fails, the link drops, or the stop token fires.
//!
//! Opening the link and subscribing share one `connect_timeout` deadline.
//! Both steps are raced against the stop token: when stop fires mid-attempt
//! the in-flight provider future is dropped rather than awaited, and any
//! link already opened is closed before the session returns. Closing is
//! bounded by the same timeout; past it the handle is dropped, which
//! releases it.

use crate::domain::models::{ConnectionStatus, SharedStatus, SlotId, StopToken};
use crate::domain::settings::BridgeConfig;
use crate::infrastructure::bluetooth::link::{FrameHandler, LinkError, LinkProvider, PeripheralLink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Message carried from the notification context to the consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Raw notification payload
    Chunk(Vec<u8>),
    /// A new link was established; partial frames from the old one are void
    LinkReset,
}

pub type DeliverySender = mpsc::UnboundedSender<Delivery>;
pub type DeliveryReceiver = mpsc::UnboundedReceiver<Delivery>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    ConnectFailed(LinkError),
    LinkLost,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub liveness_poll: Duration,
    pub characteristic: String,
}

impl From<&BridgeConfig> for SessionConfig {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            liveness_poll: config.liveness_poll(),
            characteristic: config.characteristic_uuid.clone(),
        }
    }
}

pub struct DeviceSession<P: LinkProvider> {
    slot: SlotId,
    address: String,
    provider: Arc<P>,
    config: SessionConfig,
    status: SharedStatus,
    delivery: DeliverySender,
    stop: StopToken,
}

impl<P: LinkProvider> DeviceSession<P> {
    pub fn new(
        slot: SlotId,
        address: String,
        provider: Arc<P>,
        config: SessionConfig,
        status: SharedStatus,
        delivery: DeliverySender,
        stop: StopToken,
    ) -> Self {
        Self {
            slot,
            address,
            provider,
            config,
            status,
            delivery,
            stop,
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn status(&self) -> &SharedStatus {
        &self.status
    }

    pub fn stop_token(&self) -> &StopToken {
        &self.stop
    }

    /// Connect, subscribe, and wait until the link drops or stop is requested.
    ///
    /// `on_connected` runs once the link is subscribed, before the wait.
    pub async fn run_once(&self, on_connected: impl FnOnce()) -> SessionOutcome {
        match self.connect().await {
            Ok(active) => {
                on_connected();
                active.wait_for_disconnect().await
            }
            Err(outcome) => outcome,
        }
    }

    /// Open the link and start notifications.
    ///
    /// On failure the status is already `Failed` (or `NotConnected` when
    /// stopped) and the returned outcome says why.
    pub async fn connect(&self) -> Result<ActiveSession<'_, P::Link>, SessionOutcome> {
        self.status.set(ConnectionStatus::connecting());
        info!(slot = %self.slot, address = %self.address, "Connecting");

        let deadline = Instant::now() + self.config.connect_timeout;

        let opened = tokio::select! {
            biased;
            _ = self.stop.stopped() => None,
            result = tokio::time::timeout_at(deadline, self.provider.connect(&self.address)) => Some(result),
        };

        let mut link = match opened {
            None => return Err(self.stopped()),
            Some(Ok(Ok(link))) => link,
            Some(Ok(Err(e))) => return Err(self.fail(e)),
            Some(Err(_)) => return Err(self.fail(self.timed_out())),
        };

        // A fresh link never continues a partial frame from the previous one
        let _ = self.delivery.send(Delivery::LinkReset);

        let subscribed = tokio::select! {
            biased;
            _ = self.stop.stopped() => None,
            result = tokio::time::timeout_at(
                deadline,
                link.subscribe(&self.config.characteristic, self.frame_handler()),
            ) => Some(result),
        };

        match subscribed {
            Some(Ok(Ok(()))) => {}
            None => {
                close_link(self.slot, link, self.config.connect_timeout).await;
                return Err(self.stopped());
            }
            Some(Ok(Err(e))) => {
                close_link(self.slot, link, self.config.connect_timeout).await;
                return Err(self.fail(e));
            }
            Some(Err(_)) => {
                close_link(self.slot, link, self.config.connect_timeout).await;
                return Err(self.fail(self.timed_out()));
            }
        }

        let (lost_tx, lost_rx) = oneshot::channel();
        let event_driven = link.on_disconnect(Box::new(move || {
            let _ = lost_tx.send(());
        }));
        if !event_driven {
            debug!(
                slot = %self.slot,
                "Provider has no disconnect events, polling every {:?}",
                self.config.liveness_poll
            );
        }

        self.status.set(ConnectionStatus::connected());
        info!(slot = %self.slot, address = %self.address, "Connected");

        Ok(ActiveSession {
            slot: self.slot,
            status: &self.status,
            stop: &self.stop,
            liveness_poll: self.config.liveness_poll,
            close_timeout: self.config.connect_timeout,
            link,
            lost: event_driven.then_some(lost_rx),
        })
    }

    fn stopped(&self) -> SessionOutcome {
        self.status.set(ConnectionStatus::not_connected());
        SessionOutcome::Stopped
    }

    fn timed_out(&self) -> LinkError {
        LinkError::ConnectTimeout {
            address: self.address.clone(),
            timeout_ms: self.config.connect_timeout.as_millis() as u64,
        }
    }

    fn fail(&self, error: LinkError) -> SessionOutcome {
        warn!(slot = %self.slot, address = %self.address, "Connection failed: {}", error);
        self.status.set(ConnectionStatus::failed(error.to_string()));
        SessionOutcome::ConnectFailed(error)
    }

    fn frame_handler(&self) -> FrameHandler {
        let sender = self.delivery.clone();
        let stop = self.stop.clone();
        let slot = self.slot;
        Arc::new(move |frame: &[u8]| {
            if stop.is_stopped() {
                return;
            }
            if sender.send(Delivery::Chunk(frame.to_vec())).is_err() {
                trace!(slot = %slot, "Consumer gone, dropping frame");
            }
        })
    }
}

/// A subscribed link waiting to be lost or stopped
pub struct ActiveSession<'a, L: PeripheralLink> {
    slot: SlotId,
    status: &'a SharedStatus,
    stop: &'a StopToken,
    liveness_poll: Duration,
    close_timeout: Duration,
    link: L,
    lost: Option<oneshot::Receiver<()>>,
}

enum Watch {
    Stop,
    Lost,
    HandlerDropped,
    Tick,
}

impl<L: PeripheralLink> ActiveSession<'_, L> {
    /// Block this worker until disconnection, then close the link
    pub async fn wait_for_disconnect(mut self) -> SessionOutcome {
        let outcome = self.watch().await;

        let Self {
            slot,
            status,
            close_timeout,
            link,
            ..
        } = self;
        close_link(slot, link, close_timeout).await;
        status.set(ConnectionStatus::not_connected());

        match outcome {
            SessionOutcome::Stopped => info!(slot = %slot, "Link closed on stop"),
            _ => info!(slot = %slot, "Link lost"),
        }
        outcome
    }

    async fn watch(&mut self) -> SessionOutcome {
        // Polling is the backstop; a disconnect event ends the wait immediately
        let mut poll = tokio::time::interval(self.liveness_poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                biased;
                _ = self.stop.stopped() => Watch::Stop,
                notified = wait_lost(&mut self.lost) => {
                    if notified { Watch::Lost } else { Watch::HandlerDropped }
                }
                _ = poll.tick() => Watch::Tick,
            };

            match event {
                Watch::Stop => return SessionOutcome::Stopped,
                Watch::Lost => return SessionOutcome::LinkLost,
                Watch::HandlerDropped => {
                    debug!(slot = %self.slot, "Disconnect notifier dropped, polling only");
                    self.lost = None;
                }
                Watch::Tick => {
                    if !self.link.is_connected() {
                        return SessionOutcome::LinkLost;
                    }
                }
            }
        }
    }
}

/// Close `link`, dropping the handle instead if the provider stalls
async fn close_link<L: PeripheralLink>(slot: SlotId, mut link: L, timeout: Duration) {
    if tokio::time::timeout(timeout, link.close()).await.is_err() {
        warn!(slot = %slot, "Closing the link timed out after {:?}, dropping it", timeout);
    }
}

/// `true` when the provider reported loss, `false` when it dropped the notifier
async fn wait_lost(lost: &mut Option<oneshot::Receiver<()>>) -> bool {
    match lost {
        Some(rx) => rx.await.is_ok(),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ConnectionPhase;
    use crate::infrastructure::bluetooth::simulated::{SimDevice, SimulatedProvider};

    const ADDRESS: &str = "64:E8:33:88:5E:E2";

    fn session(
        provider: Arc<SimulatedProvider>,
        connect_timeout: Duration,
    ) -> (DeviceSession<SimulatedProvider>, DeliveryReceiver, StopToken) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = StopToken::new();
        let config = SessionConfig {
            connect_timeout,
            liveness_poll: Duration::from_millis(5),
            characteristic: "beb5483e-36e1-4688-b7f5-ea07361b26a8".to_string(),
        };
        let session = DeviceSession::new(
            SlotId::One,
            ADDRESS.to_string(),
            provider,
            config,
            SharedStatus::new(),
            tx,
            stop.clone(),
        );
        (session, rx, stop)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_connect_failure_reports_failed() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.add_device(ADDRESS, SimDevice::unreachable());
        let (session, _rx, _stop) = session(provider.clone(), Duration::from_secs(1));

        let outcome = session.run_once(|| {}).await;

        assert!(matches!(
            outcome,
            SessionOutcome::ConnectFailed(LinkError::ConnectFailed { .. })
        ));
        assert_eq!(session.status().get().phase, ConnectionPhase::Failed);
        assert_eq!(provider.connect_attempts(ADDRESS), 1);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.add_device(ADDRESS, SimDevice::hanging());
        let (session, _rx, _stop) = session(provider, Duration::from_millis(30));

        let outcome = session.run_once(|| {}).await;

        assert!(matches!(
            outcome,
            SessionOutcome::ConnectFailed(LinkError::ConnectTimeout { timeout_ms: 30, .. })
        ));
        let status = session.status().get();
        assert_eq!(status.phase, ConnectionPhase::Failed);
        assert!(status.reason.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_subscribe_failure_closes_link() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.add_device(ADDRESS, SimDevice::reachable().rejecting_subscribe());
        let (session, _rx, _stop) = session(provider.clone(), Duration::from_secs(1));

        let outcome = session.run_once(|| {}).await;

        assert!(matches!(
            outcome,
            SessionOutcome::ConnectFailed(LinkError::SubscribeFailed { .. })
        ));
        assert_eq!(provider.open_links(), 0);
    }

    #[tokio::test]
    async fn test_hanging_subscribe_times_out_and_releases_link() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.add_device(ADDRESS, SimDevice::reachable().hanging_subscribe());
        let (session, _rx, _stop) = session(provider.clone(), Duration::from_millis(40));

        let outcome = session.run_once(|| {}).await;

        assert!(matches!(
            outcome,
            SessionOutcome::ConnectFailed(LinkError::ConnectTimeout { timeout_ms: 40, .. })
        ));
        assert_eq!(session.status().get().phase, ConnectionPhase::Failed);
        assert_eq!(provider.open_links(), 0);
    }

    #[tokio::test]
    async fn test_stop_during_hanging_subscribe_releases_link() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.add_device(ADDRESS, SimDevice::reachable().hanging_subscribe());
        let (session, _rx, stop) = session(provider.clone(), Duration::from_secs(10));

        let (outcome, ()) = tokio::join!(session.run_once(|| {}), async {
            wait_until(|| provider.open_links() == 1).await;
            stop.stop();
        });

        assert_eq!(outcome, SessionOutcome::Stopped);
        assert_eq!(session.status().get(), ConnectionStatus::not_connected());
        assert_eq!(provider.open_links(), 0);
    }

    #[tokio::test]
    async fn test_slow_close_is_bounded() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.add_device(
            ADDRESS,
            SimDevice::reachable().with_close_delay(Duration::from_secs(30)),
        );
        let (session, _rx, stop) = session(provider.clone(), Duration::from_millis(50));

        let started = std::time::Instant::now();
        let (outcome, ()) = tokio::join!(session.run_once(|| {}), async {
            wait_until(|| session.status().get().is_connected()).await;
            stop.stop();
        });

        assert_eq!(outcome, SessionOutcome::Stopped);
        assert!(started.elapsed() < Duration::from_secs(5));
        // The handle was dropped when the close timed out
        assert_eq!(provider.open_links(), 0);
    }

    #[tokio::test]
    async fn test_on_connected_runs_after_subscribe() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.add_device(ADDRESS, SimDevice::reachable());
        let (session, _rx, stop) = session(provider.clone(), Duration::from_secs(1));

        let mut connected_seen = None;
        let (outcome, ()) = tokio::join!(
            session.run_once(|| connected_seen = Some(session.status().get())),
            async {
                wait_until(|| session.status().get().is_connected()).await;
                stop.stop();
            }
        );

        assert_eq!(outcome, SessionOutcome::Stopped);
        assert_eq!(connected_seen, Some(ConnectionStatus::connected()));
    }

    #[tokio::test]
    async fn test_frames_are_enqueued_after_reset() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.add_device(
            ADDRESS,
            SimDevice::reachable().with_frames(vec![b"{\"Ax\":0.5}".to_vec()]),
        );
        let (session, mut rx, stop) = session(provider.clone(), Duration::from_secs(1));

        let (outcome, ()) = tokio::join!(session.run_once(|| {}), async {
            // LinkReset first, then the frame
            wait_until(|| rx.len() >= 2).await;
            stop.stop();
        });

        assert_eq!(outcome, SessionOutcome::Stopped);
        assert_eq!(rx.recv().await, Some(Delivery::LinkReset));
        assert_eq!(
            rx.recv().await,
            Some(Delivery::Chunk(b"{\"Ax\":0.5}".to_vec()))
        );
        assert_eq!(session.status().get(), ConnectionStatus::not_connected());
        assert_eq!(provider.open_links(), 0);
    }

    #[tokio::test]
    async fn test_stop_while_connecting() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.add_device(ADDRESS, SimDevice::hanging());
        let (session, _rx, stop) = session(provider, Duration::from_secs(10));

        let (outcome, ()) = tokio::join!(session.run_once(|| {}), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stop.stop();
        });

        assert_eq!(outcome, SessionOutcome::Stopped);
        assert_eq!(session.status().get(), ConnectionStatus::not_connected());
    }

    #[tokio::test]
    async fn test_loss_detected_by_event() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.add_device(ADDRESS, SimDevice::reachable());
        let (session, _rx, _stop) = session(provider.clone(), Duration::from_secs(1));

        let (outcome, ()) = tokio::join!(session.run_once(|| {}), async {
            wait_until(|| session.status().get().is_connected()).await;
            provider.sever(ADDRESS);
        });

        assert_eq!(outcome, SessionOutcome::LinkLost);
        assert_eq!(session.status().get(), ConnectionStatus::not_connected());
        assert_eq!(provider.open_links(), 0);
    }

    #[tokio::test]
    async fn test_loss_detected_by_polling() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.add_device(
            ADDRESS,
            SimDevice::reachable()
                .without_disconnect_events()
                .dropping_after(Duration::from_millis(20)),
        );
        let (session, _rx, _stop) = session(provider.clone(), Duration::from_secs(1));

        let outcome = session.run_once(|| {}).await;

        assert_eq!(outcome, SessionOutcome::LinkLost);
        assert_eq!(provider.open_links(), 0);
    }
}
