//! Continuous recognition: a cancellable capture loop on a dedicated thread.
//!
//! At most one loop owns the capture device at any time. `start` while a loop
//! is running cancels it, joins the worker (which releases the device) and only
//! then reopens the device for the new loop.

use crate::notify::deliver;
use crate::overlay::DisplayOverlay;
use crate::types::{AccessEvent, DenyReason, LabeledFace, VerificationOutcome};
use crate::verify::VerificationService;
use faceward_hw::{CaptureDevice, CaptureError, FrameStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Frames are shrunk by this factor before localization and embedding.
pub const DOWNSAMPLE_FACTOR: u32 = 4;

pub const DEFAULT_ALERT_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] CaptureError),
    #[error("failed to spawn recognition thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStatus {
    Stopped,
    /// Nothing was running; not an error.
    NotRunning,
}

pub type OverlayFactory = Arc<dyn Fn() -> Box<dyn DisplayOverlay> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Requester identity recorded on alert events.
    pub requester: String,
    /// Frames discarded after the device opens while auto-exposure settles.
    pub warmup_frames: usize,
    pub alert_cooldown: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            requester: "continuous-monitor".to_string(),
            warmup_frames: 0,
            alert_cooldown: DEFAULT_ALERT_COOLDOWN,
        }
    }
}

/// Single global rate limit for unknown-face alerts.
#[derive(Debug)]
pub struct AlertCooldown {
    window: Duration,
    last_fired: Mutex<Option<Instant>>,
}

impl AlertCooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_fired: Mutex::new(None),
        }
    }

    /// Claim the alert slot at `now`. Returns `false` while the window is still open.
    pub fn try_fire(&self, now: Instant) -> bool {
        let mut last = self
            .last_fired
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *last {
            Some(prev) if now.saturating_duration_since(prev) < self.window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

struct ActiveSession {
    cancel: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

impl ActiveSession {
    fn shutdown(self) {
        self.cancel.store(true, Ordering::Release);
        if self.worker.join().is_err() {
            tracing::error!("recognition thread panicked");
        }
    }
}

/// Controller for the continuous recognition loop.
pub struct RecognitionSession {
    device: Arc<dyn CaptureDevice>,
    service: Arc<VerificationService>,
    overlay: OverlayFactory,
    cooldown: Arc<AlertCooldown>,
    settings: SessionSettings,
    active: Mutex<Option<ActiveSession>>,
    /// Set while a loop owns the device. Read without `active` so status
    /// never waits on a start or stop that is joining a worker.
    running: Arc<AtomicBool>,
}

impl RecognitionSession {
    pub fn new(
        device: Arc<dyn CaptureDevice>,
        service: Arc<VerificationService>,
        overlay: OverlayFactory,
        settings: SessionSettings,
    ) -> Self {
        Self {
            device,
            service,
            overlay,
            cooldown: Arc::new(AlertCooldown::new(settings.alert_cooldown)),
            settings,
            active: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start a loop, replacing any running one.
    ///
    /// On `DeviceUnavailable` the session is left idle.
    pub fn start(&self) -> Result<(), SessionError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = active.take() {
            tracing::info!("restarting recognition session");
            previous.shutdown();
        }

        let stream = self.device.open()?;
        tracing::info!(device = %self.device.describe(), "recognition session started");

        let cancel = Arc::new(AtomicBool::new(false));
        self.running.store(true, Ordering::Release);
        let worker = RecognitionLoop {
            stream: Some(stream),
            overlay: (self.overlay)(),
            service: Arc::clone(&self.service),
            cooldown: Arc::clone(&self.cooldown),
            requester: self.settings.requester.clone(),
            warmup_frames: self.settings.warmup_frames,
            cancel: Arc::clone(&cancel),
            running: Arc::clone(&self.running),
        };

        let worker = std::thread::Builder::new()
            .name("faceward-recognition".into())
            .spawn(move || worker.run())
            .map_err(SessionError::Spawn)?;

        *active = Some(ActiveSession { cancel, worker });
        Ok(())
    }

    /// Stop the loop and wait for the device to be released. Safe to call when idle.
    pub fn stop(&self) -> StopStatus {
        // Held across the join so a concurrent start cannot open the device early.
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.take() {
            Some(session) => {
                let was_running = self.running.load(Ordering::Acquire);
                session.shutdown();
                if was_running {
                    tracing::info!("recognition session stopped");
                    StopStatus::Stopped
                } else {
                    StopStatus::NotRunning
                }
            }
            None => {
                tracing::warn!("stop requested but no recognition session is running");
                StopStatus::NotRunning
            }
        }
    }

    pub fn status(&self) -> SessionStatus {
        if self.running.load(Ordering::Acquire) {
            SessionStatus::Running
        } else {
            SessionStatus::Idle
        }
    }
}

impl Drop for RecognitionSession {
    fn drop(&mut self) {
        let active = self
            .active
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = active {
            session.shutdown();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Cancelled,
    Quit,
    EndOfStream,
    ReadError,
}

/// Everything the worker thread owns. Dropping it releases the device.
struct RecognitionLoop {
    stream: Option<Box<dyn FrameStream>>,
    overlay: Box<dyn DisplayOverlay>,
    service: Arc<VerificationService>,
    cooldown: Arc<AlertCooldown>,
    requester: String,
    warmup_frames: usize,
    cancel: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl RecognitionLoop {
    fn run(mut self) {
        let exit = self.capture();
        tracing::info!(reason = ?exit, "recognition loop exited");
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn read_frame(&mut self) -> Result<Option<faceward_hw::Frame>, CaptureError> {
        match self.stream.as_mut() {
            Some(stream) => stream.read_frame(),
            None => Ok(None),
        }
    }

    fn capture(&mut self) -> LoopExit {
        for _ in 0..self.warmup_frames {
            if self.cancelled() {
                return LoopExit::Cancelled;
            }
            match self.read_frame() {
                Ok(Some(_)) => {}
                Ok(None) => return LoopExit::EndOfStream,
                Err(e) => {
                    tracing::warn!(error = %e, "warmup frame failed");
                    return LoopExit::ReadError;
                }
            }
        }

        let mut process_this_frame = true;
        let mut faces: Vec<LabeledFace> = Vec::new();
        loop {
            if self.cancelled() {
                return LoopExit::Cancelled;
            }

            let frame = match self.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return LoopExit::EndOfStream,
                Err(e) => {
                    tracing::warn!(error = %e, "frame read failed");
                    return LoopExit::ReadError;
                }
            };

            // Odd frames reuse the previous detections.
            if process_this_frame {
                faces = self.process(&frame);
            }
            process_this_frame = !process_this_frame;

            self.overlay.render(&frame, &faces);
            if self.overlay.quit_requested() {
                return LoopExit::Quit;
            }
        }
    }

    /// Locate and match on a downsampled copy, assess liveness on the full frame.
    /// Boxes come back at full resolution.
    fn process(&self, frame: &faceward_hw::Frame) -> Vec<LabeledFace> {
        let small = frame.downsample(DOWNSAMPLE_FACTOR);
        let boxes = match self.service.locate(&small) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "face localization failed");
                return Vec::new();
            }
        };

        let labels = self.service.label_faces(frame, &small, &boxes);
        tracing::debug!(
            sequence = frame.sequence,
            faces = labels.faces.len(),
            spoof = labels.spoof,
            "frame processed"
        );

        if labels.has_unknown() && self.cooldown.try_fire(Instant::now()) {
            let reason = if labels.spoof {
                DenyReason::ScreenSpoof
            } else {
                DenyReason::NotRecognized
            };
            let event = AccessEvent::new(
                &self.requester,
                VerificationOutcome::denied(reason),
                Some(frame.clone()),
            );
            tracing::warn!(event_id = %event.id, %reason, "unknown face alert");
            deliver(self.service.notifier(), &event);
        }

        let scale = DOWNSAMPLE_FACTOR as f32;
        labels
            .faces
            .into_iter()
            .map(|face| LabeledFace {
                bbox: face.bbox.scaled(scale),
                ..face
            })
            .collect()
    }
}

impl Drop for RecognitionLoop {
    fn drop(&mut self) {
        // Device first: a session observed as idle must no longer hold it.
        drop(self.stream.take());
        self.overlay.close();
        self.running.store(false, Ordering::Release);
        tracing::debug!("recognition loop resources released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::fixtures::saturating_frame;
    use crate::liveness::{LivenessAnalyzer, SpectralAnalyzer};
    use crate::matcher::EuclideanMatcher;
    use crate::verify::tests::{alice_gallery, face_box, FixedLiveness, FixedProvider, RecordingNotifier};
    use faceward_hw::Frame;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct HandleCounter {
        opened: AtomicUsize,
        live: AtomicUsize,
        max_live: AtomicUsize,
    }

    /// Device whose streams yield `frames` frames (or forever) and track live handles.
    struct MockDevice {
        counter: Arc<HandleCounter>,
        frames: Option<usize>,
        available: bool,
        /// Served on every read; a flat 16×16 frame when unset.
        template: Option<Frame>,
        read_delay: Duration,
    }

    impl MockDevice {
        fn endless() -> Self {
            Self {
                counter: Arc::default(),
                frames: None,
                available: true,
                template: None,
                read_delay: Duration::from_millis(1),
            }
        }

        fn finite(frames: usize) -> Self {
            Self {
                frames: Some(frames),
                ..Self::endless()
            }
        }
    }

    struct MockStream {
        counter: Arc<HandleCounter>,
        remaining: Option<usize>,
        sequence: u32,
        template: Option<Frame>,
        read_delay: Duration,
    }

    impl FrameStream for MockStream {
        fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            if let Some(remaining) = self.remaining.as_mut() {
                if *remaining == 0 {
                    return Ok(None);
                }
                *remaining -= 1;
            }
            std::thread::sleep(self.read_delay);
            let mut frame = match &self.template {
                Some(t) => t.clone(),
                None => Frame::new(vec![128; 16 * 16], 16, 16).unwrap(),
            };
            frame.sequence = self.sequence;
            self.sequence += 1;
            Ok(Some(frame))
        }
    }

    impl Drop for MockStream {
        fn drop(&mut self) {
            self.counter.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl CaptureDevice for MockDevice {
        fn open(&self) -> Result<Box<dyn FrameStream>, CaptureError> {
            if !self.available {
                return Err(CaptureError::DeviceUnavailable("mock unplugged".into()));
            }
            self.counter.opened.fetch_add(1, Ordering::SeqCst);
            let live = self.counter.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.counter.max_live.fetch_max(live, Ordering::SeqCst);
            Ok(Box::new(MockStream {
                counter: Arc::clone(&self.counter),
                remaining: self.frames,
                sequence: 0,
                template: self.template.clone(),
                read_delay: self.read_delay,
            }))
        }

        fn describe(&self) -> String {
            "mock".into()
        }
    }

    #[derive(Default)]
    struct OverlayProbe {
        rendered: AtomicUsize,
        closed: AtomicUsize,
        boxes: Mutex<Vec<crate::types::BoundingBox>>,
        quit_after: Option<usize>,
    }

    struct ProbeOverlay(Arc<OverlayProbe>);

    impl DisplayOverlay for ProbeOverlay {
        fn render(&mut self, _frame: &Frame, faces: &[LabeledFace]) {
            self.0.rendered.fetch_add(1, Ordering::SeqCst);
            let mut boxes = self.0.boxes.lock().unwrap();
            boxes.extend(faces.iter().map(|f| f.bbox.clone()));
        }

        fn quit_requested(&mut self) -> bool {
            self.0
                .quit_after
                .is_some_and(|n| self.0.rendered.load(Ordering::SeqCst) >= n)
        }

        fn close(&mut self) {
            self.0.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        session: RecognitionSession,
        counter: Arc<HandleCounter>,
        probe: Arc<OverlayProbe>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness(device: MockDevice, embedding: Vec<f32>, probe: OverlayProbe) -> Harness {
        harness_with_liveness(device, embedding, probe, Arc::new(FixedLiveness(0.0)))
    }

    fn harness_with_liveness(
        device: MockDevice,
        embedding: Vec<f32>,
        probe: OverlayProbe,
        liveness: Arc<dyn LivenessAnalyzer>,
    ) -> Harness {
        let counter = Arc::clone(&device.counter);
        let notifier = Arc::new(RecordingNotifier::default());
        let service = Arc::new(VerificationService::new(
            Arc::new(FixedProvider {
                boxes: vec![face_box()],
                embedding: Some(embedding),
            }),
            liveness,
            Arc::new(EuclideanMatcher),
            alice_gallery(),
            notifier.clone(),
            0.6,
        ));
        let probe = Arc::new(probe);
        let overlay_probe = Arc::clone(&probe);
        let session = RecognitionSession::new(
            Arc::new(device),
            service,
            Arc::new(move || Box::new(ProbeOverlay(Arc::clone(&overlay_probe))) as Box<dyn DisplayOverlay>),
            SessionSettings::default(),
        );
        Harness {
            session,
            counter,
            probe,
            notifier,
        }
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(30);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    const STRANGER: [f32; 3] = [0.9, 0.9, 0.9];
    const ALICE: [f32; 3] = [0.1, 0.2, 0.3];

    #[test]
    fn test_cooldown_window() {
        let cooldown = AlertCooldown::new(Duration::from_secs(30));
        let t0 = Instant::now();
        assert!(cooldown.try_fire(t0));
        assert!(!cooldown.try_fire(t0 + Duration::from_secs(10)));
        assert!(!cooldown.try_fire(t0 + Duration::from_millis(29_999)));
        assert!(cooldown.try_fire(t0 + Duration::from_secs(30)));
        assert!(!cooldown.try_fire(t0 + Duration::from_secs(31)));
    }

    #[test]
    fn test_restart_never_holds_two_handles() {
        let h = harness(MockDevice::endless(), ALICE.to_vec(), OverlayProbe::default());

        h.session.start().unwrap();
        wait_until("first frames", || h.probe.rendered.load(Ordering::SeqCst) > 2);
        h.session.start().unwrap();
        assert_eq!(h.session.status(), SessionStatus::Running);

        assert_eq!(h.counter.opened.load(Ordering::SeqCst), 2);
        assert_eq!(h.counter.max_live.load(Ordering::SeqCst), 1);

        assert_eq!(h.session.stop(), StopStatus::Stopped);
        assert_eq!(h.session.stop(), StopStatus::NotRunning);
        assert_eq!(h.counter.live.load(Ordering::SeqCst), 0);
        assert_eq!(h.probe.closed.load(Ordering::SeqCst), 2);
        assert_eq!(h.session.status(), SessionStatus::Idle);
    }

    #[test]
    fn test_status_does_not_wait_for_a_stop_in_progress() {
        let device = MockDevice {
            read_delay: Duration::from_secs(1),
            ..MockDevice::endless()
        };
        let h = harness(device, ALICE.to_vec(), OverlayProbe::default());
        h.session.start().unwrap();

        std::thread::scope(|scope| {
            // The worker is inside a one-second read; stop holds the lock while joining it.
            let stopping = scope.spawn(|| h.session.stop());
            std::thread::sleep(Duration::from_millis(100));

            let asked = Instant::now();
            assert_eq!(h.session.status(), SessionStatus::Running);
            assert!(asked.elapsed() < Duration::from_millis(500));

            assert_eq!(stopping.join().unwrap(), StopStatus::Stopped);
        });
        assert_eq!(h.session.status(), SessionStatus::Idle);
        assert_eq!(h.counter.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_when_never_started() {
        let h = harness(MockDevice::endless(), ALICE.to_vec(), OverlayProbe::default());
        assert_eq!(h.session.stop(), StopStatus::NotRunning);
    }

    #[test]
    fn test_unavailable_device_stays_idle() {
        let device = MockDevice {
            available: false,
            ..MockDevice::endless()
        };
        let h = harness(device, ALICE.to_vec(), OverlayProbe::default());
        assert!(matches!(
            h.session.start(),
            Err(SessionError::Device(CaptureError::DeviceUnavailable(_)))
        ));
        assert_eq!(h.session.status(), SessionStatus::Idle);
    }

    #[test]
    fn test_unknown_alert_fires_once_per_window() {
        let h = harness(MockDevice::finite(40), STRANGER.to_vec(), OverlayProbe::default());
        h.session.start().unwrap();
        wait_until("end of stream", || h.session.status() == SessionStatus::Idle);

        assert_eq!(h.probe.rendered.load(Ordering::SeqCst), 40);
        assert_eq!(h.notifier.count(), 1);
        let events = h.notifier.events.lock().unwrap();
        assert_eq!(events[0].requester, "continuous-monitor");
        assert!(events[0].evidence.is_some());
        drop(events);

        // Cooldown survives a restart.
        h.session.start().unwrap();
        wait_until("second end of stream", || h.session.status() == SessionStatus::Idle);
        assert_eq!(h.notifier.count(), 1);
        assert_eq!(h.counter.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_known_face_raises_no_alert_and_boxes_are_rescaled() {
        let h = harness(MockDevice::finite(4), ALICE.to_vec(), OverlayProbe::default());
        h.session.start().unwrap();
        wait_until("end of stream", || h.session.status() == SessionStatus::Idle);

        assert_eq!(h.notifier.count(), 0);
        let boxes = h.probe.boxes.lock().unwrap();
        assert_eq!(boxes.len(), 4);
        // (1, 1, 2, 2) on the downsampled frame → ×4 at source resolution.
        assert!(boxes
            .iter()
            .all(|b| (b.x, b.y, b.width, b.height) == (4.0, 4.0, 8.0, 8.0)));
    }

    #[test]
    fn test_screen_frame_is_judged_at_full_resolution() {
        let device = MockDevice {
            template: Some(saturating_frame()),
            ..MockDevice::finite(2)
        };
        let h = harness_with_liveness(
            device,
            ALICE.to_vec(),
            OverlayProbe::default(),
            Arc::new(SpectralAnalyzer::new()),
        );
        h.session.start().unwrap();
        wait_until("end of stream", || h.session.status() == SessionStatus::Idle);

        // Alice's embedding would match, so the only way to an alert is the spoof gate.
        let events = h.notifier.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].outcome,
            VerificationOutcome::denied(DenyReason::ScreenSpoof)
        );
        drop(events);
        let boxes = h.probe.boxes.lock().unwrap();
        assert_eq!(boxes.len(), 2);
    }

    #[test]
    fn test_local_quit_releases_device_and_overlay() {
        let probe = OverlayProbe {
            quit_after: Some(3),
            ..OverlayProbe::default()
        };
        let h = harness(MockDevice::endless(), ALICE.to_vec(), probe);
        h.session.start().unwrap();
        wait_until("quit", || h.session.status() == SessionStatus::Idle);

        assert_eq!(h.probe.rendered.load(Ordering::SeqCst), 3);
        assert_eq!(h.probe.closed.load(Ordering::SeqCst), 1);
        assert_eq!(h.counter.live.load(Ordering::SeqCst), 0);
        assert_eq!(h.session.stop(), StopStatus::NotRunning);
    }
}
