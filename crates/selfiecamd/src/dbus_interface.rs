use selfiecam_core::{CaptureEvent, CaptureHandle, CaptureSnapshot, ControllerError, StartOutcome};
use std::path::Path;
use tokio::sync::{mpsc, watch};
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.selfiecam.Capture1";
pub const OBJECT_PATH: &str = "/org/selfiecam/Capture1";

/// D-Bus interface the kiosk shell drives the selfie step through.
///
/// Bus name: org.selfiecam.Capture1
/// Object path: /org/selfiecam/Capture1
pub struct CaptureService {
    handle: CaptureHandle,
}

impl CaptureService {
    pub fn new(handle: CaptureHandle) -> Self {
        Self { handle }
    }
}

fn to_fdo(e: ControllerError) -> zbus::fdo::Error {
    match e {
        ControllerError::SkipDisabled => zbus::fdo::Error::AccessDenied(e.to_string()),
        ControllerError::Upload(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        _ => zbus::fdo::Error::Failed(e.to_string()),
    }
}

#[interface(name = "org.selfiecam.Capture1")]
impl CaptureService {
    /// Open the camera and begin face-gated auto-capture.
    ///
    /// Returns "started", or "active" when a session is already open.
    async fn start_capture(&self) -> zbus::fdo::Result<String> {
        tracing::info!("start_capture requested");
        match self.handle.start_capture().await.map_err(to_fdo)? {
            StartOutcome::Started => Ok("started".into()),
            StartOutcome::AlreadyActive => Ok("active".into()),
        }
    }

    async fn skip(&self) -> zbus::fdo::Result<()> {
        tracing::info!("skip requested");
        self.handle.skip().await.map_err(to_fdo)
    }

    /// Use an image file instead of the camera.
    async fn manual_upload(&self, path: &str) -> zbus::fdo::Result<()> {
        tracing::info!(path, "manual_upload requested");
        self.handle.manual_upload(Path::new(path)).await.map_err(to_fdo)
    }

    async fn set_initializing(&self, value: bool) -> zbus::fdo::Result<()> {
        self.handle.set_initializing(value).await.map_err(to_fdo)
    }

    async fn set_skip_disabled(&self, value: bool) -> zbus::fdo::Result<()> {
        self.handle.set_skip_disabled(value).await.map_err(to_fdo)
    }

    /// Return the current capture snapshot as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(status_json(&self.handle.snapshot()))
    }

    #[zbus(signal)]
    async fn captured(
        emitter: &SignalEmitter<'_>,
        data_url: &str,
        width: u32,
        height: u32,
        source: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn skipped(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn acquisition_failed(emitter: &SignalEmitter<'_>, reason: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn capture_failed(emitter: &SignalEmitter<'_>, reason: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn state_changed(emitter: &SignalEmitter<'_>, snapshot: &str) -> zbus::Result<()>;
}

fn status_json(snapshot: &CaptureSnapshot) -> String {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "capture": snapshot,
    })
    .to_string()
}

/// Forward controller events to D-Bus signals until the controller's
/// event channel closes.
pub async fn pump_events(emitter: SignalEmitter<'static>, mut events: mpsc::UnboundedReceiver<CaptureEvent>) {
    while let Some(event) = events.recv().await {
        let sent = match &event {
            CaptureEvent::Captured(image) => {
                tracing::info!(source = image.source.as_str(), width = image.width, height = image.height, "emitting Captured");
                CaptureService::captured(
                    &emitter,
                    &image.to_data_url(),
                    image.width,
                    image.height,
                    image.source.as_str(),
                )
                .await
            }
            CaptureEvent::Skipped => CaptureService::skipped(&emitter).await,
            CaptureEvent::AcquisitionFailed(reason) => CaptureService::acquisition_failed(&emitter, reason).await,
            CaptureEvent::CaptureFailed(reason) => CaptureService::capture_failed(&emitter, reason).await,
        };
        if let Err(e) = sent {
            tracing::warn!(error = %e, "failed to emit signal");
        }
    }
    tracing::debug!("event pump finished");
}

/// Emit StateChanged for every published snapshot.
pub async fn pump_state(emitter: SignalEmitter<'static>, mut snapshots: watch::Receiver<CaptureSnapshot>) {
    while snapshots.changed().await.is_ok() {
        let json = snapshots.borrow_and_update().to_json();
        if let Err(e) = CaptureService::state_changed(&emitter, &json).await {
            tracing::warn!(error = %e, "failed to emit StateChanged");
        }
    }
    tracing::debug!("state pump finished");
}
