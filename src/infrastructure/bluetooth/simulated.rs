//! Simulated Link Provider
//!
//! Scripted stand-in for a BLE stack, used by the tests and by the binary's
//! `--simulate` mode. Each device address gets a [`SimDevice`] script;
//! notifications are delivered from a provider-owned thread just like a
//! real stack would.

use crate::infrastructure::bluetooth::link::{
    normalize_address, DiscoveredDevice, DisconnectHandler, FrameHandler, LinkError, LinkProvider,
    PeripheralLink,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

/// Produces the `n`th frame of an endless stream
pub type FrameGenerator = Arc<dyn Fn(u64) -> Vec<u8> + Send + Sync>;

#[derive(Clone)]
enum FrameSource {
    Silent,
    Scripted { frames: Vec<Vec<u8>>, repeat: bool },
    Generated(FrameGenerator),
}

/// Behaviour script for one simulated peripheral
#[derive(Clone)]
pub struct SimDevice {
    fail_first: u32,
    hang: bool,
    panic_on_connect: bool,
    connect_delay: Duration,
    subscribe_fails: bool,
    subscribe_hangs: bool,
    close_delay: Duration,
    frames: FrameSource,
    frame_interval: Duration,
    drop_after: Option<Duration>,
    disconnect_events: bool,
}

impl SimDevice {
    /// Connects on every attempt and sends nothing until given frames
    pub fn reachable() -> Self {
        Self {
            fail_first: 0,
            hang: false,
            panic_on_connect: false,
            connect_delay: Duration::ZERO,
            subscribe_fails: false,
            subscribe_hangs: false,
            close_delay: Duration::ZERO,
            frames: FrameSource::Silent,
            frame_interval: Duration::from_millis(5),
            drop_after: None,
            disconnect_events: true,
        }
    }

    /// Refuses every connection attempt
    pub fn unreachable() -> Self {
        Self {
            fail_first: u32::MAX,
            ..Self::reachable()
        }
    }

    /// Connection attempts never complete
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::reachable()
        }
    }

    /// Connecting panics inside the provider, like a crashing BLE stack
    pub fn panicking() -> Self {
        Self {
            panic_on_connect: true,
            ..Self::reachable()
        }
    }

    /// Refuse the first `attempts` connections, then connect
    pub fn failing_first(mut self, attempts: u32) -> Self {
        self.fail_first = attempts;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn rejecting_subscribe(mut self) -> Self {
        self.subscribe_fails = true;
        self
    }

    /// The notify subscription never completes
    pub fn hanging_subscribe(mut self) -> Self {
        self.subscribe_hangs = true;
        self
    }

    /// `close()` takes this long before the link is released
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    /// Send these notifications once per connection
    pub fn with_frames(mut self, frames: Vec<Vec<u8>>) -> Self {
        self.frames = FrameSource::Scripted {
            frames,
            repeat: false,
        };
        self
    }

    /// Cycle through these notifications for as long as the link is up
    pub fn repeating_frames(mut self, frames: Vec<Vec<u8>>) -> Self {
        self.frames = FrameSource::Scripted {
            frames,
            repeat: true,
        };
        self
    }

    pub fn with_generator(
        mut self,
        generator: impl Fn(u64) -> Vec<u8> + Send + Sync + 'static,
    ) -> Self {
        self.frames = FrameSource::Generated(Arc::new(generator));
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Drop every link this long after it was subscribed
    pub fn dropping_after(mut self, after: Duration) -> Self {
        self.drop_after = Some(after);
        self
    }

    /// Only report loss through `is_connected`
    pub fn without_disconnect_events(mut self) -> Self {
        self.disconnect_events = false;
        self
    }

    fn frame(&self, sequence: u64) -> Option<Vec<u8>> {
        match &self.frames {
            FrameSource::Silent => None,
            FrameSource::Scripted { frames, repeat } => {
                if *repeat && !frames.is_empty() {
                    frames.get(sequence as usize % frames.len()).cloned()
                } else {
                    frames.get(sequence as usize).cloned()
                }
            }
            FrameSource::Generated(generator) => Some(generator(sequence)),
        }
    }
}

struct LinkState {
    connected: AtomicBool,
    on_disconnect: Mutex<Option<DisconnectHandler>>,
}

impl LinkState {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            on_disconnect: Mutex::new(None),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Drop the link from the device side and notify the session
    fn sever(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            if let Some(notify) = lock(&self.on_disconnect).take() {
                notify();
            }
        }
    }
}

#[derive(Default)]
struct DeviceRecord {
    attempts: u32,
    live: Vec<Weak<LinkState>>,
}

#[derive(Default)]
pub struct SimulatedProvider {
    devices: Mutex<HashMap<String, SimDevice>>,
    records: Mutex<HashMap<String, DeviceRecord>>,
    open_links: Arc<AtomicUsize>,
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, address: &str, device: SimDevice) {
        lock(&self.devices).insert(normalize_address(address), device);
    }

    /// Connection attempts seen for `address`, successful or not
    pub fn connect_attempts(&self, address: &str) -> u32 {
        lock(&self.records)
            .get(&normalize_address(address))
            .map_or(0, |record| record.attempts)
    }

    /// Links handed out and not yet closed or dropped
    pub fn open_links(&self) -> usize {
        self.open_links.load(Ordering::SeqCst)
    }

    /// Drop every live link to `address`, as if the device went out of range
    pub fn sever(&self, address: &str) {
        let live: Vec<Arc<LinkState>> = lock(&self.records)
            .get_mut(&normalize_address(address))
            .map(|record| {
                record.live.retain(|state| state.strong_count() > 0);
                record.live.iter().filter_map(Weak::upgrade).collect()
            })
            .unwrap_or_default();

        for state in live {
            state.sever();
        }
    }
}

impl LinkProvider for SimulatedProvider {
    type Link = SimLink;

    async fn connect(&self, address: &str) -> Result<SimLink, LinkError> {
        let key = normalize_address(address);
        let device = lock(&self.devices).get(&key).cloned();
        let attempt = {
            let mut records = lock(&self.records);
            let record = records.entry(key.clone()).or_default();
            record.attempts += 1;
            record.attempts
        };

        let Some(device) = device else {
            return Err(LinkError::connect_failed(address, "device not found"));
        };

        if device.panic_on_connect {
            panic!("simulated BLE stack crashed while connecting to {}", key);
        }
        if device.hang {
            std::future::pending::<()>().await;
        }
        if !device.connect_delay.is_zero() {
            tokio::time::sleep(device.connect_delay).await;
        }
        if attempt <= device.fail_first {
            return Err(LinkError::connect_failed(
                address,
                format!("attempt {} refused", attempt),
            ));
        }

        let state = Arc::new(LinkState::new());
        if let Some(record) = lock(&self.records).get_mut(&key) {
            record.live.push(Arc::downgrade(&state));
        }
        self.open_links.fetch_add(1, Ordering::SeqCst);
        debug!(address = %key, attempt, "Simulated link opened");

        Ok(SimLink {
            address: key,
            device,
            state,
            open_links: self.open_links.clone(),
            closed: false,
        })
    }

    /// Every registered device that would accept a notify subscription
    async fn scan(&self, _window: Duration) -> Result<Vec<DiscoveredDevice>, LinkError> {
        let mut found: Vec<DiscoveredDevice> = lock(&self.devices)
            .iter()
            .filter(|(_, device)| !device.subscribe_fails)
            .map(|(address, _)| DiscoveredDevice {
                address: address.clone(),
                name: Some("Simulated joystick".to_string()),
                signal_strength: None,
            })
            .collect();
        found.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(found)
    }
}

pub struct SimLink {
    address: String,
    device: SimDevice,
    state: Arc<LinkState>,
    open_links: Arc<AtomicUsize>,
    closed: bool,
}

impl SimLink {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.connected.store(false, Ordering::SeqCst);
            self.open_links.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl PeripheralLink for SimLink {
    async fn subscribe(&mut self, characteristic: &str, handler: FrameHandler) -> Result<(), LinkError> {
        if self.device.subscribe_hangs {
            std::future::pending::<()>().await;
        }
        if self.device.subscribe_fails {
            return Err(LinkError::subscribe_failed(
                characteristic,
                "characteristic not found",
            ));
        }

        let device = self.device.clone();
        let state = self.state.clone();
        std::thread::Builder::new()
            .name(format!("sim-notify-{}", self.address))
            .spawn(move || stream_frames(device, state, handler))
            .map_err(|e| LinkError::subscribe_failed(characteristic, e))?;

        Ok(())
    }

    fn on_disconnect(&mut self, handler: DisconnectHandler) -> bool {
        if !self.device.disconnect_events {
            return false;
        }
        *lock(&self.state.on_disconnect) = Some(handler);
        true
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    async fn close(&mut self) {
        if !self.closed && !self.device.close_delay.is_zero() {
            tokio::time::sleep(self.device.close_delay).await;
        }
        self.release();
    }
}

impl Drop for SimLink {
    fn drop(&mut self) {
        self.release();
    }
}

fn stream_frames(device: SimDevice, state: Arc<LinkState>, handler: FrameHandler) {
    let started = Instant::now();
    let mut sequence: u64 = 0;

    while state.is_connected() {
        if let Some(limit) = device.drop_after {
            if started.elapsed() >= limit {
                state.sever();
                break;
            }
        }

        if let Some(frame) = device.frame(sequence) {
            handler(&frame);
        }
        sequence += 1;

        std::thread::sleep(device.frame_interval);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
