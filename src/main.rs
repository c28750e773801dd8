//! Daemon entry point: load the config, start the enabled subsystems, run
//! until SIGINT/SIGTERM, then stop the reactors and join their threads.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;

use onboard_control::config::Config;
use onboard_control::core::StopHandle;
use onboard_control::devices::{SharedCamera, SimCamera};
use onboard_control::subsystems::{BoardControl, CameraControl, D2dTracker, WifiControl};

const DEFAULT_CONFIG_PATH: &str = "/etc/onboard-control.toml";
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = Arc::new(
        Config::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?,
    );

    let camera_count = if config.support_multiple_camera { 2 } else { 1 };
    let camera = SharedCamera::new(SimCamera::new(camera_count));

    let mut tasks: Vec<(&str, StopHandle, JoinHandle<()>)> = Vec::new();
    if config.board_control_enabled {
        let (stop, handle) = BoardControl::spawn(Arc::clone(&config))
            .context("starting board control")?;
        tasks.push(("board-control", stop, handle));
    }
    if config.camera_control_enabled {
        let (stop, handle) = CameraControl::spawn(Arc::clone(&config), camera.clone())
            .context("starting camera control")?;
        tasks.push(("camera-control", stop, handle));
    }
    if config.d2d_tracker_enabled {
        let (stop, handle) = D2dTracker::spawn(Arc::clone(&config), camera.clone())
            .context("starting d2d tracker")?;
        tasks.push(("d2d-tracker", stop, handle));
    }
    if config.wifi_control_enabled {
        let (stop, handle) =
            WifiControl::spawn(Arc::clone(&config)).context("starting wifi control")?;
        tasks.push(("wifi-control", stop, handle));
    }

    if tasks.is_empty() {
        log::warn!("no subsystem enabled in {}", config_path.display());
        return Ok(());
    }
    log::info!("onboard-control up with {} subsystem(s)", tasks.len());

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;
    while !term.load(Ordering::Relaxed) {
        std::thread::sleep(SHUTDOWN_POLL);
    }

    log::info!("shutting down");
    for (name, stop, _) in &tasks {
        log::debug!("stopping {name}");
        stop.stop();
    }
    for (name, _, handle) in tasks {
        if handle.join().is_err() {
            log::error!("{name} thread panicked");
        }
    }
    Ok(())
}
