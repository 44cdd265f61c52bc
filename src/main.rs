use anyhow::Result;
use ble_joystick_bridge::domain::control::PlayerControls;
use ble_joystick_bridge::domain::models::{BridgeStatus, ControlSource, SlotId};
use ble_joystick_bridge::domain::settings::{Settings, SettingsService, SlotSettings};
use ble_joystick_bridge::infrastructure::bluetooth::link::LinkProvider;
use ble_joystick_bridge::infrastructure::bluetooth::simulated::{SimDevice, SimulatedProvider};
use ble_joystick_bridge::infrastructure::bluetooth::ConnectionManager;
use ble_joystick_bridge::infrastructure::logging;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Parser)]
#[command(name = "ble-joystick-bridge", version)]
#[command(about = "Feed up to two BLE joysticks into a fixed-tick game loop")]
struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use scripted in-process devices instead of real Bluetooth
    #[arg(long)]
    simulate: bool,

    /// Stop after this many ticks instead of waiting for Ctrl-C
    #[arg(long)]
    ticks: Option<u64>,

    /// Bind player 1 to this device address
    #[arg(long)]
    player1: Option<String>,

    /// Bind player 2 to this device address
    #[arg(long)]
    player2: Option<String>,

    /// List nearby joysticks and exit
    #[arg(long)]
    scan: bool,

    /// How long to listen for advertisements with --scan
    #[arg(long, default_value_t = 5, value_name = "SECONDS")]
    scan_secs: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings_service = match &cli.config {
        Some(path) => SettingsService::from_path(path.clone()),
        None => SettingsService::new()?,
    };
    for (slot, address) in [(SlotId::One, &cli.player1), (SlotId::Two, &cli.player2)] {
        if let Some(address) = address {
            *settings_service.get_mut().slot_mut(slot) = SlotSettings {
                address: address.clone(),
                source: ControlSource::Wireless,
            };
        }
    }
    let settings = settings_service.get().clone();

    let _logging_guard = logging::init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!(settings = %settings_service.path().display(), "Starting BLE joystick bridge");

    if cli.simulate {
        let provider = simulated_provider(&settings);
        execute(provider, settings, &cli).await
    } else {
        run_bluetooth(settings, &cli).await
    }
}

#[cfg(windows)]
async fn run_bluetooth(settings: Settings, cli: &Cli) -> Result<()> {
    use ble_joystick_bridge::infrastructure::bluetooth::winrt::WinRtProvider;

    let provider = WinRtProvider::new(settings.bridge.service_uuid.clone());
    execute(provider, settings, cli).await
}

#[cfg(not(windows))]
async fn run_bluetooth(_settings: Settings, _cli: &Cli) -> Result<()> {
    anyhow::bail!("No Bluetooth link provider on this platform, run with --simulate")
}

async fn execute<P: LinkProvider>(provider: P, settings: Settings, cli: &Cli) -> Result<()> {
    if cli.scan {
        scan(&provider, Duration::from_secs(cli.scan_secs)).await
    } else {
        run(provider, settings, cli.ticks).await
    }
}

async fn scan<P: LinkProvider>(provider: &P, window: Duration) -> Result<()> {
    let devices = provider.scan(window).await?;
    if devices.is_empty() {
        println!("No joysticks found");
        return Ok(());
    }

    for device in devices {
        let name = device.name.as_deref().unwrap_or("Unknown");
        match device.signal_strength {
            Some(rssi) => println!("{}  {}  {} dBm", device.address, name, rssi),
            None => println!("{}  {}", device.address, name),
        }
    }
    Ok(())
}

/// Joysticks that refuse a couple of connections, stream a slow circle,
/// and drop out every ten seconds
fn simulated_provider(settings: &Settings) -> SimulatedProvider {
    let provider = SimulatedProvider::new();
    let delimiter = if settings.bridge.reassemble_frames {
        "\n"
    } else {
        ""
    };

    for slot in SlotId::ALL {
        let phase = slot.index() as f32 * std::f32::consts::FRAC_PI_2;
        let delimiter = delimiter.to_string();
        let device = SimDevice::reachable()
            .failing_first(2)
            .with_connect_delay(Duration::from_millis(300))
            .with_frame_interval(Duration::from_millis(20))
            .dropping_after(Duration::from_secs(10))
            .with_generator(move |n| {
                let t = n as f32 * 0.05 + phase;
                format!("{{\"Ax\":{:.3},\"Ay\":{:.3}}}{}", t.sin(), t.cos(), delimiter).into_bytes()
            });
        provider.add_device(&settings.slot(slot).address, device);
    }

    provider
}

async fn run<P: LinkProvider>(provider: P, settings: Settings, ticks: Option<u64>) -> Result<()> {
    let manager = Arc::new(ConnectionManager::new(provider, settings.bridge.clone()));
    let mut controls = PlayerControls::new(settings.paddle_speed);

    for slot in SlotId::ALL {
        let slot_settings = settings.slot(slot);
        controls.set_source(slot, slot_settings.source);

        if slot_settings.source == ControlSource::Wireless {
            if let Err(e) = manager.enable_slot(slot, &slot_settings.address) {
                error!(slot = %slot, "Wireless input unavailable, using keyboard: {}", e);
                controls.set_source(slot, ControlSource::Keyboard);
            }
        }
    }

    let mut shown: [Option<BridgeStatus>; 2] = [None, None];
    let mut interval = tokio::time::interval(Duration::from_millis(settings.tick_ms.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            _ = interval.tick() => {}
        }

        for slot in SlotId::ALL {
            if controls.source(slot) == ControlSource::Wireless {
                controls.apply_wireless(slot, manager.latest_control(slot));
            }

            let status = BridgeStatus::from_parts(controls.source(slot), &manager.status(slot));
            if shown[slot.index()].as_ref() != Some(&status) {
                info!(slot = %slot, "Player {}: {}", slot, status);
                shown[slot.index()] = Some(status);
            }
        }

        if tick % 50 == 0 {
            debug!(
                player1 = controls.paddle_speed(SlotId::One),
                player2 = controls.paddle_speed(SlotId::Two),
                "Paddle speeds"
            );
        }

        tick += 1;
        if ticks.is_some_and(|limit| tick >= limit) {
            break;
        }
    }

    let bridge = manager.clone();
    tokio::task::spawn_blocking(move || bridge.shutdown()).await?;
    info!("Bridge stopped");

    Ok(())
}
