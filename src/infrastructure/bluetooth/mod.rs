//! Bluetooth Module
//!
//! Keeps up to two wireless joysticks connected and hands their latest
//! readings to the game loop.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                    ConnectionManager                       │
//! │  (slot table, status snapshots, last-value-wins feeds)     │
//! └──────────────┬───────────────────────────┬────────────────┘
//!                │ one per enabled slot      │ drains
//!                ▼                           │
//! ┌──────────────────────────┐               │
//! │   ReconnectSupervisor    │   (own thread, fixed retry delay)
//! └──────────────┬───────────┘               │
//!                ▼                           │
//! ┌──────────────────────────┐  Delivery  ┌──┴───────────────┐
//! │      DeviceSession       │ ─────────▶ │  ControlFeed      │
//! │ connect/subscribe/watch  │  channel   │  (assemble+decode)│
//! └──────────────┬───────────┘            └──────────────────┘
//!                ▼
//! ┌──────────────────────────┐
//! │  LinkProvider / Link     │  (WinRT, or simulated)
//! └──────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`link`] - Provider traits and link errors
//! - [`session`] - One connection attempt and its lifetime
//! - [`supervisor`] - Per-slot retry loop on a dedicated thread
//! - [`manager`] - Public API used by the game loop
//! - [`simulated`] - Scripted provider for tests and demos

pub mod link;
pub mod manager;
pub mod session;
pub mod simulated;
pub mod supervisor;
#[cfg(windows)]
pub mod winrt;

pub use manager::{BridgeError, ConnectionManager};
