use anyhow::{Context, Result};
use selfiecam_core::{spawn_controller, OnnxFaceDetector};
use selfiecam_hw::V4lAcquisition;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use zbus::object_server::SignalEmitter;

mod config;
mod dbus_interface;

use config::Config;
use dbus_interface::{CaptureService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load()?;
    tracing::info!(
        device = %config.camera_device,
        model = %config.model_path.display(),
        flags = ?config.flags(),
        "selfiecamd starting"
    );

    let detector = OnnxFaceDetector::load(&config.model_path_str())
        .with_context(|| format!("loading face model {}", config.model_path.display()))?;
    let acquisition = V4lAcquisition::new(config.camera_device.clone());

    let (handle, events) = spawn_controller(
        Arc::new(acquisition),
        Arc::new(detector),
        config.capture_config(),
        config.flags(),
    );

    let conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, CaptureService::new(handle.clone()))?
        .build()
        .await
        .context("registering on the session bus")?;

    let emitter = SignalEmitter::new(&conn, OBJECT_PATH)?;
    tokio::spawn(dbus_interface::pump_events(emitter.clone(), events));
    tokio::spawn(dbus_interface::pump_state(emitter, handle.watch()));

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "selfiecamd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("selfiecamd shutting down");
    handle.teardown().await;

    Ok(())
}
