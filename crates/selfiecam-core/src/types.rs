use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bounding box of a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Where a captured still came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSource {
    /// Auto-captured from the live camera after a countdown.
    Camera,
    /// Supplied through the manual file picker.
    Upload,
}

impl CaptureSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::Upload => "upload",
        }
    }
}

/// An encoded still image handed to the shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedImage {
    /// Encoded image bytes.
    pub bytes: Vec<u8>,
    /// MIME type of `bytes` (e.g. "image/jpeg").
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub source: CaptureSource,
    pub captured_at: DateTime<Utc>,
}

impl CapturedImage {
    /// Render as a `data:` URL, the form the kiosk front end consumes.
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, STANDARD.encode(&self.bytes))
    }
}
