//! Still-image encoding for camera captures and manual uploads.

use crate::types::{CaptureSource, CapturedImage};
use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageReader};
use selfiecam_hw::Frame;
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

/// JPEG quality for auto-captured stills.
pub const JPEG_QUALITY: u8 = 92;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("frame has no pixels ({0}x{1})")]
    EmptyFrame(u32, u32),
    #[error("JPEG encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
    #[error("encoder worker failed: {0}")]
    Worker(String),
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} is not a readable image")]
    NotAnImage(String),
}

/// Encode a frame as JPEG at its native resolution.
pub fn encode_frame(frame: &Frame, quality: u8) -> Result<CapturedImage, EncodeError> {
    if frame.is_empty() {
        return Err(EncodeError::EmptyFrame(frame.width, frame.height));
    }

    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100)).encode(
        &frame.data,
        frame.width,
        frame.height,
        ExtendedColorType::Rgb8,
    )?;

    Ok(CapturedImage {
        bytes,
        mime: "image/jpeg".to_string(),
        width: frame.width,
        height: frame.height,
        source: CaptureSource::Camera,
        captured_at: Utc::now(),
    })
}

/// Read an image file picked by the user, keeping its original bytes.
///
/// The format is sniffed from the content, not the extension.
pub async fn read_upload(path: &Path) -> Result<CapturedImage, UploadError> {
    let shown = path.display().to_string();
    let bytes = tokio::fs::read(path).await.map_err(|source| UploadError::Read {
        path: shown.clone(),
        source,
    })?;

    let format = image::guess_format(&bytes).map_err(|_| UploadError::NotAnImage(shown.clone()))?;
    let (width, height) = ImageReader::with_format(Cursor::new(&bytes), format)
        .into_dimensions()
        .map_err(|_| UploadError::NotAnImage(shown.clone()))?;

    tracing::debug!(path = %shown, mime = format.to_mime_type(), width, height, "read upload");

    Ok(CapturedImage {
        mime: format.to_mime_type().to_string(),
        bytes,
        width,
        height,
        source: CaptureSource::Upload,
        captured_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn gradient_frame(width: u32, height: u32) -> Frame {
        let data = (0..width * height)
            .flat_map(|i| {
                let v = (i % 256) as u8;
                [v, 255 - v, v / 2]
            })
            .collect();
        Frame::from_rgb(data, width, height, 0).unwrap()
    }

    #[test]
    fn test_encode_frame_produces_jpeg() {
        let image = encode_frame(&gradient_frame(64, 48), JPEG_QUALITY).unwrap();
        assert_eq!(&image.bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(image.mime, "image/jpeg");
        assert_eq!((image.width, image.height), (64, 48));
        assert_eq!(image.source, CaptureSource::Camera);
        assert!(image.to_data_url().starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn test_encode_keeps_native_resolution() {
        let image = encode_frame(&gradient_frame(33, 17), JPEG_QUALITY).unwrap();
        let decoded = image::load_from_memory(&image.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (33, 17));
    }

    #[test]
    fn test_encode_empty_frame_fails() {
        let frame = Frame::from_rgb(Vec::new(), 0, 0, 0).unwrap();
        assert!(matches!(encode_frame(&frame, JPEG_QUALITY), Err(EncodeError::EmptyFrame(0, 0))));
    }

    #[tokio::test]
    async fn test_read_upload_png() {
        let mut png = Vec::new();
        image::RgbImage::new(5, 3)
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&png).unwrap();

        let image = read_upload(file.path()).await.unwrap();
        assert_eq!(image.mime, "image/png");
        assert_eq!((image.width, image.height), (5, 3));
        assert_eq!(image.source, CaptureSource::Upload);
        assert_eq!(image.bytes, png);
        assert!(image.to_data_url().starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn test_read_upload_rejects_non_image() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not an image").unwrap();
        assert!(matches!(
            read_upload(file.path()).await,
            Err(UploadError::NotAnImage(_))
        ));
    }

    #[tokio::test]
    async fn test_read_upload_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("selfie.jpg");
        assert!(matches!(read_upload(&missing).await, Err(UploadError::Read { .. })));
    }
}
