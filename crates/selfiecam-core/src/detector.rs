//! Face-presence detection.
//!
//! The controller only needs to know whether a face is in front of the
//! kiosk, so the detector answers with the single best face above a score
//! threshold. `OnnxFaceDetector` runs an UltraFace-style model (RFB-320)
//! via ONNX Runtime.

use crate::types::Detection;
use async_trait::async_trait;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use selfiecam_hw::Frame;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

// --- Named constants ---
const ULTRAFACE_INPUT_WIDTH: u32 = 320;
const ULTRAFACE_INPUT_HEIGHT: u32 = 240;
const ULTRAFACE_MEAN: f32 = 127.0;
const ULTRAFACE_STD: f32 = 128.0;

/// Minimum face score for a detection to count as "face present".
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame not ready for detection")]
    FrameNotReady,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Answers whether a face is present in a video frame.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    /// Best face scoring above `score_threshold`, if any.
    async fn detect_single_face(
        &self,
        frame: Arc<Frame>,
        score_threshold: f32,
    ) -> Result<Option<Detection>, DetectorError>;
}

/// UltraFace face detector on ONNX Runtime.
///
/// Inference is blocking, so each call runs on the blocking pool with the
/// session behind a mutex.
pub struct OnnxFaceDetector {
    session: Arc<Mutex<Session>>,
}

impl OnnxFaceDetector {
    /// Load the ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name().to_string()).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded face detection model"
        );

        if output_names.len() < 2 {
            return Err(DetectorError::InferenceFailed(format!(
                "face model requires 2 outputs (scores, boxes), got {}",
                output_names.len()
            )));
        }

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
        })
    }
}

#[async_trait]
impl FaceDetector for OnnxFaceDetector {
    async fn detect_single_face(
        &self,
        frame: Arc<Frame>,
        score_threshold: f32,
    ) -> Result<Option<Detection>, DetectorError> {
        if frame.is_empty() {
            return Err(DetectorError::FrameNotReady);
        }

        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || {
            let mut session = session
                .lock()
                .map_err(|_| DetectorError::InferenceFailed("session mutex poisoned".into()))?;
            run_inference(&mut session, &frame, score_threshold)
        })
        .await
        .map_err(|e| DetectorError::InferenceFailed(format!("detector task failed: {e}")))?
    }
}

fn run_inference(
    session: &mut Session,
    frame: &Frame,
    score_threshold: f32,
) -> Result<Option<Detection>, DetectorError> {
    let input = preprocess(frame)?;
    let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

    let (_, scores) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| DetectorError::InferenceFailed(format!("scores: {e}")))?;
    let (_, boxes) = outputs[1]
        .try_extract_tensor::<f32>()
        .map_err(|e| DetectorError::InferenceFailed(format!("boxes: {e}")))?;

    Ok(best_detection(scores, boxes, frame.width, frame.height, score_threshold))
}

/// Resize an RGB frame to the model input and normalize into NCHW.
fn preprocess(frame: &Frame) -> Result<Array4<f32>, DetectorError> {
    let view = ImageBuffer::<Rgb<u8>, &[u8]>::from_raw(frame.width, frame.height, &frame.data[..])
        .ok_or(DetectorError::FrameNotReady)?;
    let resized = imageops::resize(&view, ULTRAFACE_INPUT_WIDTH, ULTRAFACE_INPUT_HEIGHT, FilterType::Triangle);

    let (w, h) = (ULTRAFACE_INPUT_WIDTH as usize, ULTRAFACE_INPUT_HEIGHT as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ULTRAFACE_MEAN) / ULTRAFACE_STD;
        }
    }
    Ok(tensor)
}

/// Pick the highest-scoring anchor above the threshold.
///
/// `scores` holds `[background, face]` pairs per anchor; `boxes` holds
/// normalized `[x1, y1, x2, y2]` corners per anchor.
fn best_detection(
    scores: &[f32],
    boxes: &[f32],
    frame_width: u32,
    frame_height: u32,
    threshold: f32,
) -> Option<Detection> {
    let anchors = (scores.len() / 2).min(boxes.len() / 4);
    let (idx, score) = (0..anchors)
        .map(|i| (i, scores[i * 2 + 1]))
        .filter(|&(_, score)| score > threshold)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))?;

    let corner = |v: f32| v.clamp(0.0, 1.0);
    let x1 = corner(boxes[idx * 4]) * frame_width as f32;
    let y1 = corner(boxes[idx * 4 + 1]) * frame_height as f32;
    let x2 = corner(boxes[idx * 4 + 2]) * frame_width as f32;
    let y2 = corner(boxes[idx * 4 + 3]) * frame_height as f32;

    Some(Detection {
        x: x1,
        y: y1,
        width: (x2 - x1).max(0.0),
        height: (y2 - y1).max(0.0),
        confidence: score,
    })
}
