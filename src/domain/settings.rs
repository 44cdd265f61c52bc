use crate::domain::control::DEFAULT_PADDLE_SPEED;
use crate::domain::models::{ControlSource, SlotId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_true")]
    pub show_thread_names: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_names: default_true(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

/// Timing and GATT parameters shared by every slot's worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Worst-case latency for noticing a dropped link when the provider
    /// does not report disconnects itself
    #[serde(default = "default_liveness_poll_ms")]
    pub liveness_poll_ms: u64,
    /// Fixed delay between a failed or lost connection and the next attempt
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// How long disabling a slot waits for its worker to wind down
    #[serde(default = "default_stop_join_timeout_ms")]
    pub stop_join_timeout_ms: u64,
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_characteristic_uuid")]
    pub characteristic_uuid: String,
    /// Split notifications on `\n` instead of treating each one as a frame
    #[serde(default = "default_true")]
    pub reassemble_frames: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            liveness_poll_ms: default_liveness_poll_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            stop_join_timeout_ms: default_stop_join_timeout_ms(),
            service_uuid: default_service_uuid(),
            characteristic_uuid: default_characteristic_uuid(),
            reassemble_frames: default_true(),
        }
    }
}

impl BridgeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn liveness_poll(&self) -> Duration {
        // A zero period would make tokio's interval panic
        Duration::from_millis(self.liveness_poll_ms.max(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn stop_join_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_join_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotSettings {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub source: ControlSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_player1")]
    pub player1: SlotSettings,
    #[serde(default = "default_player2")]
    pub player2: SlotSettings,

    #[serde(default)]
    pub bridge: BridgeConfig,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Game loop
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_paddle_speed")]
    pub paddle_speed: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            player1: default_player1(),
            player2: default_player2(),
            bridge: BridgeConfig::default(),
            log_settings: LogSettings::default(),
            tick_ms: default_tick_ms(),
            paddle_speed: default_paddle_speed(),
        }
    }
}

impl Settings {
    pub fn slot(&self, slot: SlotId) -> &SlotSettings {
        match slot {
            SlotId::One => &self.player1,
            SlotId::Two => &self.player2,
        }
    }

    pub fn slot_mut(&mut self, slot: SlotId) -> &mut SlotSettings {
        match slot {
            SlotId::One => &mut self.player1,
            SlotId::Two => &mut self.player2,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ble_joystick_bridge".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_liveness_poll_ms() -> u64 {
    50
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_stop_join_timeout_ms() -> u64 {
    3000
}
fn default_service_uuid() -> String {
    "4fafc201-1fb5-459e-8fcc-c5c9c331914b".to_string()
}
fn default_characteristic_uuid() -> String {
    "beb5483e-36e1-4688-b7f5-ea07361b26a8".to_string()
}
fn default_player1() -> SlotSettings {
    SlotSettings {
        address: "64:E8:33:88:5E:E2".to_string(),
        source: ControlSource::Wireless,
    }
}
fn default_player2() -> SlotSettings {
    SlotSettings {
        address: "64:E8:33:88:9E:36".to_string(),
        source: ControlSource::Keyboard,
    }
}
fn default_tick_ms() -> u64 {
    20
}
fn default_paddle_speed() -> f32 {
    DEFAULT_PADDLE_SPEED
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load settings from the per-user config directory, falling back to defaults
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::default_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load settings from an explicit file, falling back to defaults
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Self {
            settings,
            settings_path,
        }
    }

    fn default_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleJoystickBridge");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn set_slot(
        &mut self,
        slot: SlotId,
        address: String,
        source: ControlSource,
    ) -> anyhow::Result<()> {
        *self.settings.slot_mut(slot) = SlotSettings { address, source };
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: Settings = serde_json::from_str(
            r#"{ "bridge": { "retry_delay_ms": 250 }, "player2": { "address": "AA:BB", "source": "wireless" } }"#,
        )
        .unwrap();

        assert_eq!(settings.bridge.retry_delay(), Duration::from_millis(250));
        assert_eq!(settings.bridge.connect_timeout(), Duration::from_secs(5));
        assert_eq!(settings.bridge.liveness_poll(), Duration::from_millis(50));
        assert_eq!(settings.player1.source, ControlSource::Wireless);
        assert_eq!(settings.slot(SlotId::Two).address, "AA:BB");
        assert_eq!(settings.slot(SlotId::Two).source, ControlSource::Wireless);
        assert_eq!(settings.tick_ms, 20);
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let config = BridgeConfig {
            liveness_poll_ms: 0,
            ..BridgeConfig::default()
        };
        assert_eq!(config.liveness_poll(), Duration::from_millis(1));
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir()
            .join(format!("ble_joystick_bridge_test_{}", std::process::id()))
            .join("settings.json");

        let mut service = SettingsService::from_path(path.clone());
        service
            .set_slot(SlotId::One, "11:22:33:44:55:66".to_string(), ControlSource::Keyboard)
            .unwrap();

        let reloaded = SettingsService::from_path(path.clone());
        assert_eq!(reloaded.get().player1.address, "11:22:33:44:55:66");
        assert_eq!(reloaded.get().player1.source, ControlSource::Keyboard);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
