use crate::domain::models::{ControlSource, ControlValue, SlotId};

/// Paddle speed (pixels per tick) at full deflection or while a key is held
pub const DEFAULT_PADDLE_SPEED: f32 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, Default)]
struct PlayerState {
    source: ControlSource,
    keyboard_axis: f32,
    wireless: ControlValue,
}

/// Per-player speed state read by the game tick.
///
/// Keyboard players are driven by key press/release events, wireless
/// players by the latest control value pulled from the bridge.
#[derive(Debug, Clone)]
pub struct PlayerControls {
    players: [PlayerState; 2],
    paddle_speed: f32,
}

impl Default for PlayerControls {
    fn default() -> Self {
        Self::new(DEFAULT_PADDLE_SPEED)
    }
}

impl PlayerControls {
    pub fn new(paddle_speed: f32) -> Self {
        Self {
            players: [PlayerState::default(); 2],
            paddle_speed,
        }
    }

    /// Switch a player's input source, dropping any state from the old one
    pub fn set_source(&mut self, slot: SlotId, source: ControlSource) {
        self.players[slot.index()] = PlayerState {
            source,
            ..PlayerState::default()
        };
    }

    pub fn source(&self, slot: SlotId) -> ControlSource {
        self.players[slot.index()].source
    }

    pub fn key_pressed(&mut self, slot: SlotId, direction: KeyDirection) {
        let player = &mut self.players[slot.index()];
        if player.source == ControlSource::Keyboard {
            player.keyboard_axis = match direction {
                KeyDirection::Up => -1.0,
                KeyDirection::Down => 1.0,
            };
        }
    }

    pub fn key_released(&mut self, slot: SlotId) {
        self.players[slot.index()].keyboard_axis = 0.0;
    }

    /// Store the latest wireless deflection; ignored for non-wireless players
    pub fn apply_wireless(&mut self, slot: SlotId, value: ControlValue) {
        let player = &mut self.players[slot.index()];
        if player.source == ControlSource::Wireless {
            player.wireless = value;
        }
    }

    /// Vertical paddle speed for this tick
    pub fn paddle_speed(&self, slot: SlotId) -> f32 {
        let player = &self.players[slot.index()];
        match player.source {
            ControlSource::Disabled => 0.0,
            ControlSource::Keyboard => player.keyboard_axis * self.paddle_speed,
            ControlSource::Wireless => player.wireless.x * self.paddle_speed,
        }
    }

    /// Free-moving velocity for two-axis games (ball steering)
    pub fn velocity(&self, slot: SlotId) -> (f32, f32) {
        let player = &self.players[slot.index()];
        match player.source {
            ControlSource::Wireless => (
                player.wireless.x * self.paddle_speed,
                player.wireless.y * self.paddle_speed,
            ),
            ControlSource::Keyboard => (0.0, player.keyboard_axis * self.paddle_speed),
            ControlSource::Disabled => (0.0, 0.0),
        }
    }
}
