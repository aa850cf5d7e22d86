use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use selfiecam_core::{
    encode, spawn_controller, CaptureEvent, CaptureFlags, CaptureStatus, OnnxFaceDetector,
};
use selfiecam_hw::{Camera, V4lAcquisition};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "selfiecam", about = "Face-gated selfie capture")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List V4L2 capture devices
    Devices,
    /// Open the camera locally and auto-capture once a face is in view
    Capture {
        /// Output JPEG path
        #[arg(short, long, default_value = "selfie.jpg")]
        output: PathBuf,
        /// Camera device
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Face detection model (defaults to the installed model)
        #[arg(short, long)]
        model: Option<PathBuf>,
    },
    /// Read an image file the way a manual upload does
    Upload {
        file: PathBuf,
        /// Write the data URL to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Ask selfiecamd to start capturing
    Start,
    /// Ask selfiecamd to skip the selfie step
    Skip,
    /// Show selfiecamd status
    Status,
}

#[zbus::proxy(
    interface = "org.selfiecam.Capture1",
    default_service = "org.selfiecam.Capture1",
    default_path = "/org/selfiecam/Capture1"
)]
trait Capture {
    async fn start_capture(&self) -> zbus::Result<String>;
    async fn skip(&self) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Capture {
            output,
            device,
            model,
        } => capture(output, device, model).await?,
        Commands::Upload { file, output } => {
            let image = encode::read_upload(&file).await?;
            println!(
                "{}: {} {}x{} ({} bytes)",
                file.display(),
                image.mime,
                image.width,
                image.height,
                image.bytes.len()
            );
            if let Some(output) = output {
                std::fs::write(&output, image.to_data_url())
                    .with_context(|| format!("writing {}", output.display()))?;
                println!("Data URL written to {}", output.display());
            }
        }
        Commands::Start => {
            let outcome = proxy().await?.start_capture().await?;
            println!("selfiecamd: {outcome}");
        }
        Commands::Skip => {
            proxy().await?.skip().await?;
            println!("selfiecamd: skipped");
        }
        Commands::Status => {
            let status = match proxy().await {
                Ok(proxy) => proxy.status().await,
                Err(e) => Err(e),
            };
            match status {
                Ok(json) => {
                    let value: serde_json::Value = serde_json::from_str(&json)?;
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
                Err(e) => println!("selfiecamd: not connected ({e})"),
            }
        }
    }

    Ok(())
}

async fn proxy() -> zbus::Result<CaptureProxy<'static>> {
    let conn = zbus::Connection::session().await?;
    CaptureProxy::new(&conn).await
}

/// Run a controller in-process with auto-start and wait for one still.
async fn capture(output: PathBuf, device: String, model: Option<PathBuf>) -> Result<()> {
    let model = model.unwrap_or_else(|| selfiecam_core::default_model_dir().join(selfiecam_core::FACE_MODEL_FILE));
    let detector = OnnxFaceDetector::load(&model.to_string_lossy())
        .with_context(|| format!("loading face model {}", model.display()))?;

    let flags = CaptureFlags {
        auto_start: true,
        ..Default::default()
    };
    let (handle, mut events) = spawn_controller(
        Arc::new(V4lAcquisition::new(device.clone())),
        Arc::new(detector),
        Default::default(),
        flags,
    );
    let mut snapshots = handle.watch();
    tracing::debug!(%device, model = %model.display(), "local capture controller spawned");

    println!("Opening {device}, look into the camera...");
    let result = loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break Err(anyhow::anyhow!("capture controller stopped"));
                }
                let snapshot = snapshots.borrow_and_update().clone();
                match (snapshot.status, snapshot.seconds_remaining) {
                    (CaptureStatus::Counting, Some(n)) => println!("  {n}..."),
                    (CaptureStatus::Live, _) => println!("  waiting for a face"),
                    _ => {}
                }
            }
            event = events.recv() => match event {
                Some(CaptureEvent::Captured(image)) => break Ok(image),
                Some(CaptureEvent::AcquisitionFailed(reason)) => break Err(anyhow::anyhow!("camera unavailable: {reason}")),
                Some(CaptureEvent::CaptureFailed(reason)) => break Err(anyhow::anyhow!("capture failed: {reason}")),
                Some(CaptureEvent::Skipped) => continue,
                None => break Err(anyhow::anyhow!("capture controller stopped")),
            },
            _ = tokio::signal::ctrl_c() => break Err(anyhow::anyhow!("interrupted")),
        }
    };
    handle.teardown().await;

    let image = result?;
    if image.bytes.is_empty() {
        bail!("captured image is empty");
    }
    std::fs::write(&output, &image.bytes).with_context(|| format!("writing {}", output.display()))?;
    println!("Saved {}x{} selfie to {}", image.width, image.height, output.display());
    Ok(())
}
