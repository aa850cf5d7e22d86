//! selfiecam-core — Face-gated selfie auto-capture.
//!
//! The capture controller opens a camera stream, polls a face detector
//! while the stream is live, runs a countdown while a face stays in view,
//! and encodes one still when the countdown expires. Detection runs an
//! UltraFace model via ONNX Runtime.

pub mod controller;
pub mod countdown;
pub mod detector;
pub mod encode;
pub mod sink;
pub mod types;

use std::path::PathBuf;

pub use controller::{
    spawn_controller, CaptureConfig, CaptureEvent, CaptureFlags, CaptureHandle, CaptureSnapshot,
    CaptureStatus, ControllerError, StartOutcome,
};
pub use detector::{DetectorError, FaceDetector, OnnxFaceDetector};
pub use encode::{EncodeError, UploadError};
pub use sink::{ReadyState, VideoSink};
pub use types::{CaptureSource, CapturedImage, Detection};

/// File name of the bundled face detection model.
pub const FACE_MODEL_FILE: &str = "version-RFB-320.onnx";

/// Default model directory: `$XDG_DATA_HOME/selfiecam/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("selfiecam/models")
}
