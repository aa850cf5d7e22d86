//! Selfie capture controller.
//!
//! A single task owns the whole capture session: the camera stream, the
//! detection poll, the countdown, and the final capture. Shell actions
//! arrive as commands through a [`CaptureHandle`]; results leave as
//! [`CaptureEvent`]s, and the current [`CaptureSnapshot`] is published on a
//! watch channel for rendering.
//!
//! Every timer and pending task lives inside the [`Phase`] value it belongs
//! to, so leaving a phase drops (and thereby cancels) all of them before any
//! other handler runs.

use crate::countdown::{Countdown, COUNTDOWN_START};
use crate::detector::{FaceDetector, DEFAULT_SCORE_THRESHOLD};
use crate::encode::{self, EncodeError, UploadError, JPEG_QUALITY};
use crate::sink::VideoSink;
use crate::types::CapturedImage;
use selfiecam_hw::{AcquisitionError, MediaAcquisition, MediaStream, StreamConstraints};
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Duration, Interval, MissedTickBehavior};
use uuid::Uuid;

/// Interval between detection polls while the camera is live.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Interval between countdown steps.
pub const DEFAULT_COUNTDOWN_PERIOD: Duration = Duration::from_secs(1);

/// Shortest poll or countdown period; tokio intervals reject zero.
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

/// Timing and encoding parameters of the capture pipeline.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub poll_interval: Duration,
    pub countdown_start: u8,
    pub countdown_period: Duration,
    pub score_threshold: f32,
    pub jpeg_quality: u8,
    pub constraints: StreamConstraints,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            countdown_start: COUNTDOWN_START,
            countdown_period: DEFAULT_COUNTDOWN_PERIOD,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            jpeg_quality: JPEG_QUALITY,
            constraints: StreamConstraints::default(),
        }
    }
}

/// Flags set by the shell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureFlags {
    /// Open the camera on its own once `initializing` clears.
    pub auto_start: bool,
    /// Refuse `skip()`.
    pub disabled_skip: bool,
    /// The shell is still preparing; start and skip are unavailable.
    pub initializing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    Idle,
    Acquiring,
    Live,
    /// Live with a countdown running.
    Counting,
    Capturing,
}

/// What the shell needs to render the capture screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSnapshot {
    pub status: CaptureStatus,
    pub face_detected: bool,
    pub seconds_remaining: Option<u8>,
    pub session: Option<Uuid>,
}

impl CaptureSnapshot {
    pub fn idle() -> Self {
        Self {
            status: CaptureStatus::Idle,
            face_detected: false,
            seconds_remaining: None,
            session: None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Events delivered to the shell.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// A still was captured or uploaded. Fired once per completed
    /// countdown or upload.
    Captured(CapturedImage),
    Skipped,
    /// The camera could not be opened; the controller is idle again.
    AcquisitionFailed(String),
    /// The frame was grabbed but could not be encoded.
    CaptureFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A camera request was issued.
    Started,
    /// A session is already open; nothing changed.
    AlreadyActive,
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("capture is still initializing")]
    Initializing,
    #[error("skip is disabled")]
    SkipDisabled,
    #[error("cannot skip while {0:?}")]
    Busy(CaptureStatus),
    #[error("something went wrong reading the file, please try again: {0}")]
    Upload(#[from] UploadError),
    #[error("capture controller has shut down")]
    Closed,
}

enum Command {
    Start {
        reply: oneshot::Sender<Result<StartOutcome, ControllerError>>,
    },
    Skip {
        reply: oneshot::Sender<Result<(), ControllerError>>,
    },
    SetInitializing {
        value: bool,
        reply: oneshot::Sender<()>,
    },
    SetSkipDisabled {
        value: bool,
        reply: oneshot::Sender<()>,
    },
    Teardown {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to a running controller.
#[derive(Clone)]
pub struct CaptureHandle {
    tx: mpsc::Sender<Command>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    snapshot: watch::Receiver<CaptureSnapshot>,
}

impl CaptureHandle {
    /// Open the camera and begin face-gated auto-capture. No-op when a
    /// session is already open.
    pub async fn start_capture(&self) -> Result<StartOutcome, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Start { reply }, rx).await?
    }

    /// Skip the selfie step.
    pub async fn skip(&self) -> Result<(), ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Skip { reply }, rx).await?
    }

    /// Use a picked file instead of the camera. Independent of the capture
    /// session: emits [`CaptureEvent::Captured`] directly.
    pub async fn manual_upload(&self, path: &Path) -> Result<(), ControllerError> {
        let image = match encode::read_upload(path).await {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "manual upload failed");
                return Err(e.into());
            }
        };
        tracing::info!(mime = %image.mime, width = image.width, height = image.height, "manual upload accepted");
        self.events
            .send(CaptureEvent::Captured(image))
            .map_err(|_| ControllerError::Closed)
    }

    pub async fn set_initializing(&self, value: bool) -> Result<(), ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::SetInitializing { value, reply }, rx).await
    }

    pub async fn set_skip_disabled(&self, value: bool) -> Result<(), ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::SetSkipDisabled { value, reply }, rx).await
    }

    /// Release the camera, cancel every timer, and stop the controller.
    /// Safe to call any number of times.
    pub async fn teardown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Teardown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn snapshot(&self) -> CaptureSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CaptureSnapshot> {
        self.snapshot.clone()
    }

    async fn request<T>(&self, cmd: Command, rx: oneshot::Receiver<T>) -> Result<T, ControllerError> {
        self.tx.send(cmd).await.map_err(|_| ControllerError::Closed)?;
        rx.await.map_err(|_| ControllerError::Closed)
    }
}

/// Spawn a controller task. Returns its handle and the event stream.
pub fn spawn_controller(
    acquisition: Arc<dyn MediaAcquisition>,
    detector: Arc<dyn FaceDetector>,
    config: CaptureConfig,
    flags: CaptureFlags,
) -> (CaptureHandle, mpsc::UnboundedReceiver<CaptureEvent>) {
    let (tx, commands) = mpsc::channel(16);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(CaptureSnapshot::idle());

    let config = CaptureConfig {
        poll_interval: config.poll_interval.max(MIN_TIMER_PERIOD),
        countdown_period: config.countdown_period.max(MIN_TIMER_PERIOD),
        ..config
    };
    let controller = Controller::new(acquisition, detector, config, flags, events_tx.clone(), snapshot_tx);
    tokio::spawn(controller.run(commands));

    let handle = CaptureHandle {
        tx,
        events: events_tx,
        snapshot: snapshot_rx,
    };
    (handle, events_rx)
}

/// Pending camera request. Dropping it abandons the request; a stream
/// that was already delivered is dropped with it, which stops it.
struct Acquisition {
    id: Uuid,
    task: JoinHandle<Result<Box<dyn MediaStream>, AcquisitionError>>,
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// An open camera session with its detection poll and optional countdown.
struct LiveSession {
    id: Uuid,
    sink: VideoSink,
    poll: Interval,
    detections: JoinSet<bool>,
    face_detected: bool,
    countdown: Option<Countdown>,
}

impl LiveSession {
    fn new(id: Uuid, sink: VideoSink, poll_interval: Duration) -> Self {
        // First poll fires immediately on entry.
        let mut poll = time::interval(poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            id,
            sink,
            poll,
            detections: JoinSet::new(),
            face_detected: false,
            countdown: None,
        }
    }

    async fn next_event(&mut self) -> PhaseEvent {
        let countdown = self.countdown.as_mut();
        tokio::select! {
            _ = self.poll.tick() => PhaseEvent::PollDue,
            Some(joined) = self.detections.join_next(), if !self.detections.is_empty() => {
                // A panicking detector counts as "no face".
                PhaseEvent::Detected(joined.unwrap_or(false))
            }
            _ = async move {
                match countdown {
                    Some(countdown) => countdown.tick().await,
                    None => std::future::pending().await,
                }
            } => PhaseEvent::CountdownTick,
        }
    }

    /// Run one detection against the current frame. A sink without
    /// current data counts as "no face". At most one detection runs at a
    /// time; a tick that finds one still running is skipped.
    fn poll(&mut self, detector: &Arc<dyn FaceDetector>, config: &CaptureConfig) {
        if !self.detections.is_empty() {
            tracing::trace!(session = %self.id, "detection still running, skipping poll");
            return;
        }
        let Some(frame) = self.sink.current_frame() else {
            self.apply_detection(false, config);
            return;
        };

        let detector = Arc::clone(detector);
        let threshold = config.score_threshold;
        let session = self.id;
        self.detections.spawn(async move {
            match detector.detect_single_face(frame, threshold).await {
                Ok(found) => found.is_some(),
                Err(e) => {
                    tracing::debug!(%session, error = %e, "face detection failed, treating as no face");
                    false
                }
            }
        });
    }

    fn apply_detection(&mut self, present: bool, config: &CaptureConfig) {
        if present != self.face_detected {
            tracing::debug!(session = %self.id, present, "face presence changed");
        }
        self.face_detected = present;

        if !present {
            if self.countdown.take().is_some() {
                tracing::info!(session = %self.id, "face lost, countdown cancelled");
            }
            return;
        }

        if self.countdown.is_none() {
            tracing::info!(session = %self.id, from = config.countdown_start, "face detected, countdown started");
            self.countdown = Some(Countdown::start(config.countdown_start, config.countdown_period));
        }
    }

    /// End the session's timers and detections, keeping only the sink.
    fn into_sink(self) -> (Uuid, VideoSink) {
        let Self {
            id,
            sink,
            poll,
            detections,
            countdown,
            face_detected: _,
        } = self;
        drop(poll);
        drop(countdown);
        drop(detections);
        (id, sink)
    }
}

/// A grabbed frame being encoded. The stream stays attached until the
/// encoded still is handed out.
struct CaptureJob {
    id: Uuid,
    sink: VideoSink,
    task: JoinHandle<Result<CapturedImage, EncodeError>>,
}

enum Phase {
    Idle,
    Acquiring(Acquisition),
    Live(LiveSession),
    Capturing(CaptureJob),
}

enum PhaseEvent {
    Acquired(Result<Box<dyn MediaStream>, AcquisitionError>),
    PollDue,
    Detected(bool),
    CountdownTick,
    Encoded(Result<CapturedImage, EncodeError>),
}

impl Phase {
    async fn next_event(&mut self) -> PhaseEvent {
        match self {
            Phase::Idle => std::future::pending().await,
            Phase::Acquiring(acquisition) => PhaseEvent::Acquired(match (&mut acquisition.task).await {
                Ok(result) => result,
                Err(e) => Err(AcquisitionError::StreamFailed(format!("acquisition task failed: {e}"))),
            }),
            Phase::Live(live) => live.next_event().await,
            Phase::Capturing(job) => PhaseEvent::Encoded(match (&mut job.task).await {
                Ok(result) => result,
                Err(e) => Err(EncodeError::Worker(e.to_string())),
            }),
        }
    }

    fn snapshot(&self) -> CaptureSnapshot {
        match self {
            Phase::Idle => CaptureSnapshot::idle(),
            Phase::Acquiring(acquisition) => CaptureSnapshot {
                status: CaptureStatus::Acquiring,
                face_detected: false,
                seconds_remaining: None,
                session: Some(acquisition.id),
            },
            Phase::Live(live) => CaptureSnapshot {
                status: if live.countdown.is_some() {
                    CaptureStatus::Counting
                } else {
                    CaptureStatus::Live
                },
                face_detected: live.face_detected,
                seconds_remaining: live.countdown.as_ref().map(Countdown::remaining),
                session: Some(live.id),
            },
            Phase::Capturing(job) => CaptureSnapshot {
                status: CaptureStatus::Capturing,
                face_detected: true,
                seconds_remaining: Some(0),
                session: Some(job.id),
            },
        }
    }
}

struct Controller {
    acquisition: Arc<dyn MediaAcquisition>,
    detector: Arc<dyn FaceDetector>,
    config: CaptureConfig,
    flags: CaptureFlags,
    has_auto_started: bool,
    phase: Phase,
    events: mpsc::UnboundedSender<CaptureEvent>,
    snapshot: watch::Sender<CaptureSnapshot>,
}

impl Controller {
    fn new(
        acquisition: Arc<dyn MediaAcquisition>,
        detector: Arc<dyn FaceDetector>,
        config: CaptureConfig,
        flags: CaptureFlags,
        events: mpsc::UnboundedSender<CaptureEvent>,
        snapshot: watch::Sender<CaptureSnapshot>,
    ) -> Self {
        Self {
            acquisition,
            detector,
            config,
            flags,
            has_auto_started: false,
            phase: Phase::Idle,
            events,
            snapshot,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        tracing::info!(flags = ?self.flags, "capture controller started");
        self.maybe_auto_start();
        self.publish();

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        tracing::debug!("all handles dropped");
                        break;
                    };
                    if self.handle_command(cmd).is_break() {
                        break;
                    }
                }
                event = self.phase.next_event() => self.handle_phase_event(event),
            }
            self.publish();
        }

        self.close_session();
        self.publish();
        tracing::info!("capture controller stopped");
    }

    fn handle_command(&mut self, cmd: Command) -> ControlFlow<()> {
        match cmd {
            Command::Start { reply } => {
                let _ = reply.send(self.start());
            }
            Command::Skip { reply } => {
                let _ = reply.send(self.skip());
            }
            Command::SetInitializing { value, reply } => {
                self.flags.initializing = value;
                self.maybe_auto_start();
                let _ = reply.send(());
            }
            Command::SetSkipDisabled { value, reply } => {
                self.flags.disabled_skip = value;
                let _ = reply.send(());
            }
            Command::Teardown { reply } => {
                tracing::info!("teardown requested");
                self.close_session();
                self.publish();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_phase_event(&mut self, event: PhaseEvent) {
        match event {
            PhaseEvent::Acquired(result) => self.on_acquired(result),
            PhaseEvent::PollDue => {
                if let Phase::Live(live) = &mut self.phase {
                    live.poll(&self.detector, &self.config);
                }
            }
            PhaseEvent::Detected(present) => {
                if let Phase::Live(live) = &mut self.phase {
                    live.apply_detection(present, &self.config);
                }
            }
            PhaseEvent::CountdownTick => self.on_countdown_tick(),
            PhaseEvent::Encoded(result) => self.on_encoded(result),
        }
    }

    fn start(&mut self) -> Result<StartOutcome, ControllerError> {
        if !matches!(self.phase, Phase::Idle) {
            tracing::debug!(status = ?self.phase.snapshot().status, "start ignored, session already open");
            return Ok(StartOutcome::AlreadyActive);
        }
        if self.flags.initializing {
            return Err(ControllerError::Initializing);
        }
        self.begin_acquisition();
        Ok(StartOutcome::Started)
    }

    fn skip(&mut self) -> Result<(), ControllerError> {
        let status = self.phase.snapshot().status;
        if status != CaptureStatus::Idle {
            return Err(ControllerError::Busy(status));
        }
        if self.flags.disabled_skip || self.flags.initializing {
            return Err(ControllerError::SkipDisabled);
        }
        tracing::info!("selfie skipped");
        self.emit(CaptureEvent::Skipped);
        Ok(())
    }

    /// Auto-start fires at most once per controller.
    fn maybe_auto_start(&mut self) {
        if !self.flags.auto_start
            || self.flags.initializing
            || self.has_auto_started
            || !matches!(self.phase, Phase::Idle)
        {
            return;
        }
        self.has_auto_started = true;
        tracing::info!("auto-starting capture");
        self.begin_acquisition();
    }

    fn begin_acquisition(&mut self) {
        let id = Uuid::new_v4();
        let acquisition = Arc::clone(&self.acquisition);
        let constraints = self.config.constraints.clone();
        let task = tokio::spawn(async move { acquisition.acquire(&constraints).await });
        tracing::info!(session = %id, "requesting camera");
        self.phase = Phase::Acquiring(Acquisition { id, task });
    }

    fn on_acquired(&mut self, result: Result<Box<dyn MediaStream>, AcquisitionError>) {
        if !matches!(self.phase, Phase::Acquiring(_)) {
            // Nobody asked for this stream any more.
            if let Ok(mut stream) = result {
                stream.stop();
            }
            return;
        }
        let Phase::Acquiring(acquisition) = std::mem::replace(&mut self.phase, Phase::Idle) else {
            return;
        };
        let id = acquisition.id;

        match result {
            Ok(stream) => {
                let mut sink = VideoSink::new();
                sink.attach(stream);
                tracing::info!(session = %id, "camera live");
                self.phase = Phase::Live(LiveSession::new(id, sink, self.config.poll_interval));
            }
            Err(e) => {
                tracing::warn!(session = %id, error = %e, "camera acquisition failed");
                self.emit(CaptureEvent::AcquisitionFailed(e.to_string()));
            }
        }
    }

    fn on_countdown_tick(&mut self) {
        let expired = match &mut self.phase {
            Phase::Live(live) => match live.countdown.as_mut() {
                Some(countdown) => {
                    let remaining = countdown.advance();
                    tracing::debug!(session = %live.id, remaining, "countdown tick");
                    countdown.is_expired()
                }
                None => false,
            },
            // Ticks that outlive their session have no effect.
            _ => false,
        };
        if expired {
            self.begin_capture();
        }
    }

    /// Grab the current frame and hand it to the encoder. Only a live
    /// session with an expired countdown can start a capture, so a second
    /// zero tick finds the controller already in `Capturing` and does
    /// nothing.
    fn begin_capture(&mut self) {
        let frame = {
            let Phase::Live(live) = &mut self.phase else {
                return;
            };
            if !live.face_detected || !live.countdown.as_ref().is_some_and(Countdown::is_expired) {
                return;
            }

            let (width, height) = live.sink.video_dimensions();
            match live.sink.current_frame() {
                Some(frame) if width > 0 && height > 0 => frame,
                _ => {
                    // Without dimensions there is nothing to capture yet;
                    // give the stream another full countdown cycle.
                    tracing::debug!(session = %live.id, width, height, "video not ready at capture, restarting countdown");
                    live.countdown = Some(Countdown::start(
                        self.config.countdown_start,
                        self.config.countdown_period,
                    ));
                    return;
                }
            }
        };

        let Phase::Live(live) = std::mem::replace(&mut self.phase, Phase::Idle) else {
            return;
        };
        let (id, sink) = live.into_sink();

        let quality = self.config.jpeg_quality;
        tracing::info!(session = %id, width = frame.width, height = frame.height, "countdown complete, capturing frame");
        let task = tokio::task::spawn_blocking(move || encode::encode_frame(&frame, quality));
        self.phase = Phase::Capturing(CaptureJob { id, sink, task });
    }

    fn on_encoded(&mut self, result: Result<CapturedImage, EncodeError>) {
        if !matches!(self.phase, Phase::Capturing(_)) {
            return;
        }
        let Phase::Capturing(mut job) = std::mem::replace(&mut self.phase, Phase::Idle) else {
            return;
        };
        job.sink.release();

        match result {
            Ok(image) => {
                tracing::info!(session = %job.id, bytes = image.bytes.len(), "selfie captured");
                self.emit(CaptureEvent::Captured(image));
            }
            Err(e) => {
                tracing::warn!(session = %job.id, error = %e, "failed to encode captured frame");
                self.emit(CaptureEvent::CaptureFailed(e.to_string()));
            }
        }
    }

    /// Close whatever session is open: stop and detach the stream, cancel
    /// the poll and countdown timers, abandon pending work.
    fn close_session(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {}
            Phase::Acquiring(acquisition) => {
                tracing::debug!(session = %acquisition.id, "abandoning pending camera request");
            }
            Phase::Live(live) => {
                let (id, mut sink) = live.into_sink();
                sink.release();
                tracing::debug!(session = %id, "live session closed");
            }
            Phase::Capturing(mut job) => {
                job.sink.release();
                tracing::debug!(session = %job.id, "capture abandoned");
            }
        }
    }

    fn publish(&self) {
        let next = self.phase.snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn emit(&self, event: CaptureEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("event receiver dropped");
        }
    }
}
