use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// One of the two logical players the bridge serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SlotId {
    One,
    Two,
}

impl SlotId {
    pub const ALL: [SlotId; 2] = [SlotId::One, SlotId::Two];

    /// Zero-based index into per-slot tables
    pub fn index(self) -> usize {
        match self {
            SlotId::One => 0,
            SlotId::Two => 1,
        }
    }

    /// Player number as shown to the user (1 or 2)
    pub fn number(self) -> u8 {
        self.index() as u8 + 1
    }

    pub fn from_number(number: u8) -> Result<Self, ConfigError> {
        match number {
            1 => Ok(SlotId::One),
            2 => Ok(SlotId::Two),
            other => Err(ConfigError::UnknownSlot(other)),
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Where a player's input comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlSource {
    #[default]
    Disabled,
    Keyboard,
    Wireless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    #[default]
    NotConnected,
    Connecting,
    Connected,
    Failed,
}

/// Snapshot of one slot's link state.
///
/// Display-only: the phase and reason are replaced together but readers
/// must not derive invariants across two consecutive reads.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub phase: ConnectionPhase,
    pub reason: Option<String>,
}

impl ConnectionStatus {
    pub fn not_connected() -> Self {
        Self::default()
    }

    pub fn connecting() -> Self {
        Self {
            phase: ConnectionPhase::Connecting,
            reason: None,
        }
    }

    pub fn connected() -> Self {
        Self {
            phase: ConnectionPhase::Connected,
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            phase: ConnectionPhase::Failed,
            reason: Some(reason.into()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }
}

/// Status cell shared between a slot's session (writer) and any reader.
///
/// Every write replaces the whole value, so a poisoned lock still holds a
/// consistent snapshot and is recovered rather than propagated.
#[derive(Debug, Clone, Default)]
pub struct SharedStatus {
    inner: Arc<Mutex<ConnectionStatus>>,
}

impl SharedStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, status: ConnectionStatus) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn get(&self) -> ConnectionStatus {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Normalized joystick deflection, nominally in [-1.0, 1.0] on both axes.
///
/// Values are not clamped here; consumers clamp if they need to.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControlValue {
    pub x: f32,
    pub y: f32,
}

impl ControlValue {
    pub const ZERO: ControlValue = ControlValue { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// What the presentation layer shows for a player
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeStatus {
    Disabled,
    Keyboard,
    Connecting,
    Connected,
    Failed(String),
}

impl BridgeStatus {
    /// Combine a player's configured source with the slot's link status.
    ///
    /// A wireless slot between attempts (not connected, no failure) is shown
    /// as connecting since the supervisor is about to retry.
    pub fn from_parts(source: ControlSource, status: &ConnectionStatus) -> Self {
        match source {
            ControlSource::Disabled => BridgeStatus::Disabled,
            ControlSource::Keyboard => BridgeStatus::Keyboard,
            ControlSource::Wireless => match status.phase {
                ConnectionPhase::Connected => BridgeStatus::Connected,
                ConnectionPhase::Failed => BridgeStatus::Failed(
                    status
                        .reason
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                ),
                ConnectionPhase::Connecting | ConnectionPhase::NotConnected => {
                    BridgeStatus::Connecting
                }
            },
        }
    }
}

impl fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeStatus::Disabled => write!(f, "disabled"),
            BridgeStatus::Keyboard => write!(f, "keyboard"),
            BridgeStatus::Connecting => write!(f, "connecting..."),
            BridgeStatus::Connected => write!(f, "connected"),
            BridgeStatus::Failed(reason) => write!(f, "connection failed ({})", reason),
        }
    }
}

/// One-shot stop signal handed to a slot's worker at spawn time.
///
/// Once stopped it stays stopped; clones observe the same signal.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    token: CancellationToken,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`StopToken::stop`] has been called
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}

/// Errors reported synchronously to whoever configures the slots
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("slot {slot} is already bound to {bound}; disable it before binding {requested}")]
    AddressConflict {
        slot: SlotId,
        bound: String,
        requested: String,
    },
    #[error("unknown slot {0} (expected 1 or 2)")]
    UnknownSlot(u8),
    #[error("device address must not be empty")]
    EmptyAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_numbers() {
        assert_eq!(SlotId::from_number(1), Ok(SlotId::One));
        assert_eq!(SlotId::from_number(2), Ok(SlotId::Two));
        assert_eq!(SlotId::from_number(3), Err(ConfigError::UnknownSlot(3)));
        assert_eq!(SlotId::Two.number(), 2);
        assert_eq!(SlotId::Two.to_string(), "2");
    }

    #[test]
    fn test_bridge_status_mapping() {
        let failed = ConnectionStatus::failed("timeout");
        assert_eq!(
            BridgeStatus::from_parts(ControlSource::Wireless, &failed),
            BridgeStatus::Failed("timeout".to_string())
        );
        assert_eq!(
            BridgeStatus::from_parts(ControlSource::Keyboard, &failed),
            BridgeStatus::Keyboard
        );
        assert_eq!(
            BridgeStatus::from_parts(ControlSource::Wireless, &ConnectionStatus::not_connected()),
            BridgeStatus::Connecting
        );
    }

    #[tokio::test]
    async fn test_stop_token_is_one_shot() {
        let token = StopToken::new();
        let observer = token.clone();
        assert!(!observer.is_stopped());

        token.stop();
        token.stop();
        assert!(observer.is_stopped());
        observer.stopped().await;
    }

    #[test]
    fn test_shared_status_replaces_wholesale() {
        let status = SharedStatus::new();
        status.set(ConnectionStatus::failed("no device"));
        status.set(ConnectionStatus::connected());
        assert_eq!(status.get(), ConnectionStatus::connected());
    }
}
