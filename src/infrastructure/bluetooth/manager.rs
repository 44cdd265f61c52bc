//! Connection Manager
//!
//! Public face of the bridge. Owns up to two reconnection supervisors and
//! the consumer side of each slot's delivery channel.
//!
//! Calls from the game loop (`status`, `latest_control`) never wait on a
//! worker: the slot table lock only guards enable/disable bookkeeping and
//! each feed lock is only taken by the consumer and by enable/disable.

use crate::domain::frame::{self, FrameAssembler};
use crate::domain::models::{
    ConfigError, ConnectionPhase, ConnectionStatus, ControlValue, SharedStatus, SlotId, StopToken,
};
use crate::domain::settings::BridgeConfig;
use crate::infrastructure::bluetooth::link::{normalize_address, LinkProvider};
use crate::infrastructure::bluetooth::session::{
    Delivery, DeliveryReceiver, DeviceSession, SessionConfig,
};
use crate::infrastructure::bluetooth::supervisor::{
    ReconnectSupervisor, SupervisorHandle, SupervisorState,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not start worker for slot {slot}: {source}")]
    Spawn {
        slot: SlotId,
        #[source]
        source: std::io::Error,
    },
}

struct ActiveSlot {
    address: String,
    generation: u64,
    status: SharedStatus,
    supervisor: SupervisorHandle,
}

/// Consumer side of one slot's delivery channel
#[derive(Default)]
struct ControlFeed {
    generation: u64,
    receiver: Option<DeliveryReceiver>,
    assembler: Option<FrameAssembler>,
    latest: ControlValue,
    decode_errors: u64,
}

impl ControlFeed {
    fn attach(&mut self, generation: u64, receiver: DeliveryReceiver, reassemble: bool) {
        *self = Self {
            generation,
            receiver: Some(receiver),
            assembler: reassemble.then(FrameAssembler::default),
            ..Self::default()
        };
    }

    /// Drop the channel, unless a newer enable has already replaced it
    fn detach(&mut self, generation: u64) -> bool {
        if self.generation != generation {
            return false;
        }
        *self = Self::default();
        true
    }

    /// Decode everything pending and keep only the newest good value
    fn drain(&mut self, slot: SlotId) -> ControlValue {
        let Self {
            generation: _,
            receiver,
            assembler,
            latest,
            decode_errors,
        } = self;

        let Some(receiver) = receiver.as_mut() else {
            return *latest;
        };

        loop {
            match receiver.try_recv() {
                Ok(Delivery::Chunk(bytes)) => match assembler.as_mut() {
                    Some(assembler) => {
                        for segment in assembler.push(&bytes) {
                            accept(slot, &segment, latest, decode_errors);
                        }
                    }
                    None => accept(slot, &bytes, latest, decode_errors),
                },
                Ok(Delivery::LinkReset) => {
                    if let Some(assembler) = assembler.as_mut() {
                        assembler.reset();
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        *latest
    }
}

fn accept(slot: SlotId, frame: &[u8], latest: &mut ControlValue, decode_errors: &mut u64) {
    match frame::decode(frame) {
        Ok(value) => *latest = value,
        Err(e) => {
            *decode_errors += 1;
            debug!(slot = %slot, errors = *decode_errors, "Dropping frame: {}", e);
        }
    }
}

pub struct ConnectionManager<P: LinkProvider> {
    provider: Arc<P>,
    config: BridgeConfig,
    slots: Mutex<[Option<ActiveSlot>; 2]>,
    feeds: [Mutex<ControlFeed>; 2],
    generations: AtomicU64,
}

impl<P: LinkProvider> ConnectionManager<P> {
    pub fn new(provider: P, config: BridgeConfig) -> Self {
        Self::with_shared_provider(Arc::new(provider), config)
    }

    pub fn with_shared_provider(provider: Arc<P>, config: BridgeConfig) -> Self {
        Self {
            provider,
            config,
            slots: Mutex::new([None, None]),
            feeds: [
                Mutex::new(ControlFeed::default()),
                Mutex::new(ControlFeed::default()),
            ],
            generations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Start supervising `address` for `slot`.
    ///
    /// A no-op when the slot is already running for the same address;
    /// binding a different address requires [`ConnectionManager::disable_slot`] first.
    pub fn enable_slot(&self, slot: SlotId, address: &str) -> Result<(), BridgeError> {
        let address = normalize_address(address);
        if address.is_empty() {
            return Err(ConfigError::EmptyAddress.into());
        }

        let mut slots = lock(&self.slots);
        if let Some(active) = &slots[slot.index()] {
            if active.address != address {
                return Err(ConfigError::AddressConflict {
                    slot,
                    bound: active.address.clone(),
                    requested: address,
                }
                .into());
            }
            if !active.supervisor.is_finished() {
                debug!(slot = %slot, "Slot already enabled");
                return Ok(());
            }
            warn!(slot = %slot, "Supervisor exited unexpectedly, restarting");
            if let Some(dead) = slots[slot.index()].take() {
                dead.supervisor.stop_and_join(self.config.stop_join_timeout());
                lock(&self.feeds[slot.index()]).detach(dead.generation);
            }
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let status = SharedStatus::new();
        let session = DeviceSession::new(
            slot,
            address.clone(),
            self.provider.clone(),
            SessionConfig::from(&self.config),
            status.clone(),
            sender,
            StopToken::new(),
        );
        let supervisor = ReconnectSupervisor::new(session, self.config.retry_delay())
            .spawn()
            .map_err(|source| BridgeError::Spawn { slot, source })?;

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&self.feeds[slot.index()]).attach(generation, receiver, self.config.reassemble_frames);
        info!(slot = %slot, address = %address, "Slot enabled");
        slots[slot.index()] = Some(ActiveSlot {
            address,
            generation,
            status,
            supervisor,
        });

        Ok(())
    }

    /// Stop the slot's supervisor and release its link.
    ///
    /// Returns once the worker has exited (or the join timeout elapsed) and
    /// no further frames can reach the consumer. Safe on idle slots.
    pub fn disable_slot(&self, slot: SlotId) {
        let Some(active) = lock(&self.slots)[slot.index()].take() else {
            return;
        };

        let joined = active
            .supervisor
            .stop_and_join(self.config.stop_join_timeout());
        if !lock(&self.feeds[slot.index()]).detach(active.generation) {
            debug!(slot = %slot, "Slot re-enabled while stopping, keeping the new feed");
        }

        if joined {
            info!(slot = %slot, address = %active.address, "Slot disabled");
        } else {
            warn!(slot = %slot, address = %active.address, "Slot disabled, worker still winding down");
        }
    }

    /// Like [`ConnectionManager::disable_slot`] for a user-supplied player number
    pub fn disable_player(&self, number: u8) -> Result<(), ConfigError> {
        self.disable_slot(SlotId::from_number(number)?);
        Ok(())
    }

    pub fn is_enabled(&self, slot: SlotId) -> bool {
        lock(&self.slots)[slot.index()].is_some()
    }

    pub fn address(&self, slot: SlotId) -> Option<String> {
        lock(&self.slots)[slot.index()]
            .as_ref()
            .map(|active| active.address.clone())
    }

    /// Snapshot of the slot's link state; `NotConnected` for idle slots.
    ///
    /// An enabled slot whose worker has exited always reads as `Failed`.
    pub fn status(&self, slot: SlotId) -> ConnectionStatus {
        lock(&self.slots)[slot.index()]
            .as_ref()
            .map(|active| {
                let status = active.status.get();
                if active.supervisor.is_finished() && status.phase != ConnectionPhase::Failed {
                    ConnectionStatus::failed("worker stopped unexpectedly")
                } else {
                    status
                }
            })
            .unwrap_or_default()
    }

    pub fn supervisor_state(&self, slot: SlotId) -> Option<SupervisorState> {
        lock(&self.slots)[slot.index()]
            .as_ref()
            .map(|active| active.supervisor.state())
    }

    /// Newest decoded deflection for the slot (last value wins).
    ///
    /// Stale intermediate frames are decoded and discarded. The value stays
    /// at its last good reading across decode errors and link loss, and is
    /// zero for idle slots.
    pub fn latest_control(&self, slot: SlotId) -> ControlValue {
        lock(&self.feeds[slot.index()]).drain(slot)
    }

    /// Frames dropped as undecodable since the slot was enabled
    pub fn decode_errors(&self, slot: SlotId) -> u64 {
        lock(&self.feeds[slot.index()]).decode_errors
    }

    /// Disable every slot; blocks until all workers have stopped
    pub fn shutdown(&self) {
        for slot in SlotId::ALL {
            self.disable_slot(slot);
        }
    }
}

impl<P: LinkProvider> Drop for ConnectionManager<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
