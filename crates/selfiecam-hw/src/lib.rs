//! selfiecam-hw — Camera acquisition for the selfie kiosk.
//!
//! Defines the media capability traits the capture controller consumes and
//! a V4L2 implementation that streams decoded RGB frames.

pub mod camera;
pub mod frame;
pub mod media;

pub use camera::{Camera, CameraStream, DeviceInfo, PixelFormat, V4lAcquisition};
pub use frame::{Frame, FrameError};
pub use media::{AcquisitionError, FacingMode, MediaAcquisition, MediaStream, StreamConstraints};
