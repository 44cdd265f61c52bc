//! Peripheral Link Seam
//!
//! The transport (pairing, GATT negotiation, retransmission) lives behind
//! [`LinkProvider`]. A provider is a shared factory; every successful
//! connect hands back a private [`PeripheralLink`] owned by exactly one
//! session, so two slots never touch the same connection object.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Invoked once per notification on a provider-owned thread.
///
/// Must not block: implementations only enqueue.
pub type FrameHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Invoked at most once when the provider notices the link dropped
pub type DisconnectHandler = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("could not connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },
    #[error("connecting to {address} timed out after {timeout_ms} ms")]
    ConnectTimeout { address: String, timeout_ms: u64 },
    #[error("could not subscribe to {characteristic}: {reason}")]
    SubscribeFailed {
        characteristic: String,
        reason: String,
    },
    #[error("device scan failed: {0}")]
    ScanFailed(String),
    #[error("{0} is not supported by this provider")]
    Unsupported(&'static str),
}

impl LinkError {
    pub fn connect_failed(address: &str, reason: impl ToString) -> Self {
        LinkError::ConnectFailed {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn subscribe_failed(characteristic: &str, reason: impl ToString) -> Self {
        LinkError::SubscribeFailed {
            characteristic: characteristic.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// One open connection to one device
pub trait PeripheralLink: Send + 'static {
    /// Start notifications on `characteristic`, calling `handler` per frame
    fn subscribe(
        &mut self,
        characteristic: &str,
        handler: FrameHandler,
    ) -> impl Future<Output = Result<(), LinkError>>;

    /// Register an event-driven loss notification.
    ///
    /// Returns `false` when the provider cannot report disconnects, in which
    /// case the session relies on [`PeripheralLink::is_connected`] polling.
    fn on_disconnect(&mut self, handler: DisconnectHandler) -> bool {
        drop(handler);
        false
    }

    fn is_connected(&self) -> bool;

    /// Release the connection; no frames are delivered afterwards
    fn close(&mut self) -> impl Future<Output = ()>;
}

/// A device seen during discovery that advertises the joystick service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: Option<String>,
    pub signal_strength: Option<i16>,
}

/// Opens links by stable device address
pub trait LinkProvider: Send + Sync + 'static {
    type Link: PeripheralLink;

    fn connect(&self, address: &str) -> impl Future<Output = Result<Self::Link, LinkError>>;

    /// Listen for `window` and return candidate addresses for a slot.
    ///
    /// Discovery is optional; the bridge itself never scans.
    fn scan(
        &self,
        window: Duration,
    ) -> impl Future<Output = Result<Vec<DiscoveredDevice>, LinkError>> {
        let _ = window;
        async { Err(LinkError::Unsupported("device discovery")) }
    }
}

/// Parse a colon or dash separated 48-bit MAC address (e.g. `64:E8:33:88:5E:E2`)
pub fn parse_mac_address(address: &str) -> Option<u64> {
    let hex: String = address
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();

    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    u64::from_str_radix(&hex, 16).ok()
}

/// Format a raw 48-bit address the way slots are configured
pub fn format_mac_address(raw: u64) -> String {
    (0..6)
        .rev()
        .map(|i| format!("{:02X}", (raw >> (i * 8)) & 0xFF))
        .collect::<Vec<_>>()
        .join(":")
}

/// Canonical form used to compare addresses bound to slots
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_uppercase()
}
