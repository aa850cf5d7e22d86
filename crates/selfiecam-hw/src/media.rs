//! Media acquisition capability: open a camera stream, read its latest
//! frame, stop it.

use crate::frame::Frame;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Why a camera stream could not be opened.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiation(String),
    #[error("stream failed: {0}")]
    StreamFailed(String),
}

/// Which camera to prefer when several are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front-facing camera (selfie).
    #[default]
    User,
    Environment,
}

/// Requested stream shape. Devices may negotiate something else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConstraints {
    pub facing: FacingMode,
    pub width: u32,
    pub height: u32,
}

impl Default for StreamConstraints {
    fn default() -> Self {
        Self {
            facing: FacingMode::User,
            width: 1280,
            height: 720,
        }
    }
}

/// A live video stream.
///
/// Implementations must stop their tracks when dropped so that a stream
/// nobody holds any more never keeps the hardware open.
pub trait MediaStream: Send {
    /// Most recent decoded frame, or `None` before the first frame arrives.
    fn latest_frame(&self) -> Option<Arc<Frame>>;

    /// Native video dimensions; `(0, 0)` until metadata is known.
    fn dimensions(&self) -> (u32, u32);

    /// Stop all tracks. Safe to call more than once.
    fn stop(&mut self);

    fn is_active(&self) -> bool;
}

/// Platform capability that opens camera streams.
#[async_trait]
pub trait MediaAcquisition: Send + Sync {
    async fn acquire(
        &self,
        constraints: &StreamConstraints,
    ) -> Result<Box<dyn MediaStream>, AcquisitionError>;
}
