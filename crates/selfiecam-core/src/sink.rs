//! The video sink a live stream is attached to. Both the detection poll
//! and the final capture read frames from here.

use selfiecam_hw::{Frame, MediaStream};
use std::sync::Arc;

/// How much of the stream is available for reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    HaveNothing,
    HaveMetadata,
    HaveCurrentData,
}

/// Exclusive owner of at most one attached stream.
#[derive(Default)]
pub struct VideoSink {
    stream: Option<Box<dyn MediaStream>>,
}

impl VideoSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a stream, releasing any stream already attached.
    pub fn attach(&mut self, stream: Box<dyn MediaStream>) {
        self.release();
        self.stream = Some(stream);
    }

    pub fn is_attached(&self) -> bool {
        self.stream.is_some()
    }

    pub fn ready_state(&self) -> ReadyState {
        let Some(stream) = self.stream.as_ref().filter(|s| s.is_active()) else {
            return ReadyState::HaveNothing;
        };
        if stream.latest_frame().is_some() {
            ReadyState::HaveCurrentData
        } else if stream.dimensions() != (0, 0) {
            ReadyState::HaveMetadata
        } else {
            ReadyState::HaveNothing
        }
    }

    /// The current frame, or `None` until the sink has current data.
    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        if self.ready_state() < ReadyState::HaveCurrentData {
            return None;
        }
        self.stream.as_ref().and_then(|s| s.latest_frame())
    }

    /// Native video dimensions; `(0, 0)` when nothing is attached yet.
    pub fn video_dimensions(&self) -> (u32, u32) {
        self.stream.as_ref().map(|s| s.dimensions()).unwrap_or((0, 0))
    }

    /// Stop every track and detach the stream. Returns whether a stream
    /// was attached.
    pub fn release(&mut self) -> bool {
        match self.stream.take() {
            Some(mut stream) => {
                stream.stop();
                true
            }
            None => false,
        }
    }
}

impl Drop for VideoSink {
    fn drop(&mut self) {
        self.release();
    }
}
