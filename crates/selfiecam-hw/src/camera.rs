//! V4L2 camera stream via the `v4l` crate.
//!
//! Each acquired stream owns a dedicated capture thread that holds the
//! device, dequeues buffers, and publishes the latest decoded frame.
//! Stopping the stream (or dropping it) tells the thread to exit, which
//! closes the device.

use crate::frame::{self, Frame, FrameError};
use crate::media::{AcquisitionError, MediaAcquisition, MediaStream, StreamConstraints};
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion-JPEG, one JPEG image per buffer.
    Mjpeg,
    /// 8-bit grayscale.
    Grey,
    /// Packed 24-bit RGB.
    Rgb24,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpeg),
            b"GREY" => Some(Self::Grey),
            b"RGB3" => Some(Self::Rgb24),
            _ => None,
        }
    }
}

/// Open V4L2 capture device with a negotiated format.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera by path (e.g. "/dev/video0") and negotiate a
    /// format close to `constraints`.
    pub fn open(device_path: &str, constraints: &StreamConstraints) -> Result<Self, AcquisitionError> {
        if !Path::new(device_path).exists() {
            return Err(AcquisitionError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| map_open_error(device_path, e))?;

        let caps = device
            .query_caps()
            .map_err(|e| AcquisitionError::StreamFailed(format!("failed to query capabilities: {e}")))?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(AcquisitionError::FormatNegotiation(format!(
                "{device_path} is not a video capture device"
            )));
        }

        // V4L2 has no notion of facing; the configured device path decides.
        tracing::debug!(facing = ?constraints.facing, "facing mode is selected by device path");

        let mut fmt = device
            .format()
            .map_err(|e| AcquisitionError::FormatNegotiation(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = constraints.width;
        fmt.height = constraints.height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| AcquisitionError::FormatNegotiation(format!("failed to set format: {e}")))?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            AcquisitionError::FormatNegotiation(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, MJPG, GREY, or RGB3)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Decode one dequeued buffer into an RGB frame.
    fn decode(&self, buf: &[u8], sequence: u32) -> Result<Frame, FrameError> {
        match self.pixel_format {
            PixelFormat::Yuyv => {
                let rgb = frame::yuyv_to_rgb(buf, self.width, self.height)?;
                Frame::from_rgb(rgb, self.width, self.height, sequence)
            }
            PixelFormat::Grey => {
                let rgb = frame::gray_to_rgb(buf, self.width, self.height)?;
                Frame::from_rgb(rgb, self.width, self.height, sequence)
            }
            PixelFormat::Rgb24 => {
                let len = self.width as usize * self.height as usize * 3;
                let data = buf.get(..len).ok_or(FrameError::InvalidLength {
                    expected: len,
                    actual: buf.len(),
                })?;
                Frame::from_rgb(data.to_vec(), self.width, self.height, sequence)
            }
            PixelFormat::Mjpeg => {
                // MJPEG frames carry their own dimensions.
                let rgb = image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)?.to_rgb8();
                let (width, height) = rgb.dimensions();
                Frame::from_rgb(rgb.into_raw(), width, height, sequence)
            }
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

fn map_open_error(device_path: &str, e: io::Error) -> AcquisitionError {
    match e.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EPERM) => {
            return AcquisitionError::PermissionDenied(format!("{device_path}: {e}"))
        }
        Some(libc::EBUSY) => return AcquisitionError::DeviceBusy,
        Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ENXIO) => {
            return AcquisitionError::DeviceNotFound(format!("{device_path}: {e}"))
        }
        _ => {}
    }
    match e.kind() {
        io::ErrorKind::PermissionDenied => AcquisitionError::PermissionDenied(format!("{device_path}: {e}")),
        io::ErrorKind::NotFound => AcquisitionError::DeviceNotFound(format!("{device_path}: {e}")),
        _ => AcquisitionError::StreamFailed(format!("failed to open {device_path}: {e}")),
    }
}

/// State shared between a [`CameraStream`] and its capture thread.
#[derive(Default)]
struct StreamShared {
    latest: Mutex<Option<Arc<Frame>>>,
    stop: AtomicBool,
    running: AtomicBool,
}

/// Opens V4L2 streams on a fixed device path.
pub struct V4lAcquisition {
    device_path: String,
}

impl V4lAcquisition {
    pub fn new(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
        }
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }
}

#[async_trait]
impl MediaAcquisition for V4lAcquisition {
    async fn acquire(
        &self,
        constraints: &StreamConstraints,
    ) -> Result<Box<dyn MediaStream>, AcquisitionError> {
        let shared = Arc::new(StreamShared::default());
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread_shared = Arc::clone(&shared);
        let device_path = self.device_path.clone();
        let constraints = constraints.clone();
        std::thread::Builder::new()
            .name("selfiecam-camera".into())
            .spawn(move || capture_loop(&device_path, &constraints, &thread_shared, ready_tx))
            .map_err(|e| AcquisitionError::StreamFailed(format!("failed to spawn capture thread: {e}")))?;

        // Owned before waiting, so a cancelled request still stops the thread.
        let stream = CameraStream {
            shared,
            device_path: self.device_path.clone(),
        };
        ready_rx
            .await
            .map_err(|_| AcquisitionError::StreamFailed("capture thread exited".into()))??;

        Ok(Box::new(stream))
    }
}

/// Capture thread body. Reports readiness exactly once, then publishes
/// frames until asked to stop. The device closes when this returns.
fn capture_loop(
    device_path: &str,
    constraints: &StreamConstraints,
    shared: &StreamShared,
    ready_tx: oneshot::Sender<Result<(), AcquisitionError>>,
) {
    let camera = match Camera::open(device_path, constraints) {
        Ok(camera) => camera,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let mut stream = match MmapStream::with_buffers(&camera.device, BufType::VideoCapture, 4) {
        Ok(stream) => stream,
        Err(e) => {
            let err = if e.raw_os_error() == Some(libc::EBUSY) {
                AcquisitionError::DeviceBusy
            } else {
                AcquisitionError::StreamFailed(format!("failed to create mmap stream: {e}"))
            };
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    shared.running.store(true, Ordering::Release);
    if ready_tx.send(Ok(())).is_err() {
        // Requester went away while we were opening; release immediately.
        tracing::debug!(device = device_path, "stream abandoned before ready, closing");
        shared.running.store(false, Ordering::Release);
        return;
    }

    while !shared.stop.load(Ordering::Acquire) {
        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(device = device_path, error = %e, "failed to dequeue buffer");
                break;
            }
        };

        let used = (meta.bytesused as usize).min(buf.len());
        let used = if used == 0 { buf.len() } else { used };
        match camera.decode(&buf[..used], meta.sequence) {
            Ok(frame) => {
                if let Ok(mut slot) = shared.latest.lock() {
                    *slot = Some(Arc::new(frame));
                }
            }
            Err(e) => tracing::debug!(seq = meta.sequence, error = %e, "dropping undecodable frame"),
        }
    }

    shared.running.store(false, Ordering::Release);
    tracing::debug!(device = device_path, "capture thread exiting, camera released");
}

/// Live V4L2 stream handle. Dropping it stops capture.
pub struct CameraStream {
    shared: Arc<StreamShared>,
    device_path: String,
}

impl MediaStream for CameraStream {
    fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.shared.latest.lock().ok().and_then(|slot| slot.clone())
    }

    fn dimensions(&self) -> (u32, u32) {
        self.latest_frame()
            .map(|frame| frame.dimensions())
            .unwrap_or((0, 0))
    }

    fn stop(&mut self) {
        if !self.shared.stop.swap(true, Ordering::AcqRel) {
            tracing::debug!(device = %self.device_path, "stopping camera stream");
        }
        if let Ok(mut slot) = self.shared.latest.lock() {
            *slot = None;
        }
    }

    fn is_active(&self) -> bool {
        !self.shared.stop.load(Ordering::Acquire) && self.shared.running.load(Ordering::Acquire)
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.stop();
    }
}
