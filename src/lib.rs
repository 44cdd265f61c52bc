//! Multi-device wireless input bridge.
//!
//! Keeps up to two BLE joysticks connected, retrying forever while a slot
//! is enabled, and exposes their latest deflection to a real-time game
//! loop without ever blocking it.

pub mod domain;
pub mod infrastructure;

pub use domain::control::{KeyDirection, PlayerControls};
pub use domain::frame::{decode, DecodeError, FrameAssembler};
pub use domain::models::{
    BridgeStatus, ConfigError, ConnectionPhase, ConnectionStatus, ControlSource, ControlValue,
    SlotId,
};
pub use infrastructure::bluetooth::link::{DiscoveredDevice, LinkError, LinkProvider, PeripheralLink};
pub use infrastructure::bluetooth::{BridgeError, ConnectionManager};
