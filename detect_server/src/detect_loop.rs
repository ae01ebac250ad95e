//! One detection-and-draw cycle per timer tick.
//!
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError, RwLock,
};

use cam_source::video::VideoSource;
use image::RgbImage;

use crate::{
    config::InFlightPolicy,
    detector::{DetectionError, Detector},
    meter::METER,
    overlay::{OverlayRenderer, OverlaySurface},
    state::AppState,
};

/// Samples the video source, runs the detector and draws the results.
///
/// Ticks never fail: a video source that is missing or not ready turns the tick into a no-op, a
/// failed detection is logged and leaves the previous overlay and results in place.
pub struct DetectionLoop {
    state: Arc<AppState>,
    video: RwLock<Option<Arc<dyn VideoSource>>>,
    overlay: Mutex<OverlaySurface>,
    renderer: OverlayRenderer,
    policy: InFlightPolicy,
    busy: AtomicBool,
    ticks_fired: AtomicU64,
}

impl DetectionLoop {
    pub fn new(state: Arc<AppState>, renderer: OverlayRenderer, policy: InFlightPolicy) -> Self {
        Self {
            state,
            video: RwLock::new(None),
            overlay: Mutex::new(OverlaySurface::default()),
            renderer,
            policy,
            busy: AtomicBool::new(false),
            ticks_fired: AtomicU64::new(0),
        }
    }

    pub fn attach(&self, video: Arc<dyn VideoSource>) {
        *self.video.write().unwrap_or_else(PoisonError::into_inner) = Some(video);
        self.state.set_video_error(None);
    }

    pub fn detach(&self) -> Option<Arc<dyn VideoSource>> {
        self.video
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn video(&self) -> Option<Arc<dyn VideoSource>> {
        self.video
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Number of ticks fired so far, including no-op ticks.
    pub fn ticks_fired(&self) -> u64 {
        self.ticks_fired.load(Ordering::Relaxed)
    }

    pub fn overlay(&self) -> MutexGuard<'_, OverlaySurface> {
        self.overlay.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current video frame with the overlay on top, if the video is ready.
    pub fn composited_frame(&self) -> Option<RgbImage> {
        let video = self.video()?;
        if !video.ready_state().is_ready() {
            return None;
        }
        let frame = video.capture().ok()?;
        Some(self.overlay().composite(&frame))
    }

    pub async fn tick(&self, detector: Arc<dyn Detector>) {
        self.ticks_fired.fetch_add(1, Ordering::Relaxed);

        let Some(video) = self.video() else {
            return;
        };
        if !video.ready_state().is_ready() {
            return;
        }

        let _busy = match self.policy {
            InFlightPolicy::Overlap => None,
            InFlightPolicy::SkipWhileBusy => match BusyGuard::acquire(&self.busy) {
                Some(guard) => Some(guard),
                None => {
                    log::trace!("Detection still in flight, skipping tick");
                    return;
                }
            },
        };

        let result = match video.capture() {
            Ok(frame) => {
                // Sized from the captured frame, the reported dimensions may already be stale
                let (width, height) = frame.dimensions();
                self.overlay().resize(width, height);
                detector.detect(frame).await
            }
            Err(err) => Err(DetectionError::Capture(err.to_string())),
        };

        match result {
            Ok(detections) => {
                METER.tick_detection();
                let detections = self.state.publish(detections);
                self.renderer.draw(&detections, &mut self.overlay());
            }
            Err(err) => {
                METER.tick_failed_detection();
                log::warn!("Failed to detect objects: {err}");
            }
        }
    }
}

/// Holds the busy flag until dropped.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod test {

    use std::{sync::Mutex as StdMutex, time::Duration};

    use async_trait::async_trait;
    use cam_source::video::{ReadyState, StillSource};
    use common::detection::Detection;

    use super::*;

    /// Answers each call with the next scripted result after the scripted delay.
    struct ScriptedDetector {
        script: StdMutex<Vec<(Duration, Result<Vec<Detection>, String>)>>,
        calls: AtomicU64,
    }

    impl ScriptedDetector {
        fn new(mut script: Vec<(Duration, Result<Vec<Detection>, String>)>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: StdMutex::new(script),
                calls: AtomicU64::new(0),
            })
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl Detector for ScriptedDetector {
        async fn detect(&self, _frame: RgbImage) -> Result<Vec<Detection>, DetectionError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let next = self.script.lock().unwrap().pop();
            match next {
                Some((delay, result)) => {
                    tokio::time::sleep(delay).await;
                    result.map_err(DetectionError::Inference)
                }
                None => Ok(vec![]),
            }
        }
    }

    fn detection(class: &str) -> Detection {
        Detection::new(class, 0.9, [10.0, 10.0, 20.0, 20.0])
    }

    fn detection_loop(policy: InFlightPolicy) -> Arc<DetectionLoop> {
        Arc::new(DetectionLoop::new(
            Arc::new(AppState::default()),
            OverlayRenderer::default(),
            policy,
        ))
    }

    fn still(width: u32, height: u32) -> Arc<StillSource> {
        Arc::new(StillSource::new(RgbImage::new(width, height)))
    }

    fn classes(detection_loop: &DetectionLoop) -> Vec<String> {
        detection_loop
            .state()
            .detections()
            .iter()
            .map(|d| d.class.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_overlay_follows_video_dimensions() {
        let detection_loop = detection_loop(InFlightPolicy::Overlap);
        let video = still(640, 480);
        detection_loop.attach(video.clone());
        let detector = ScriptedDetector::new(vec![]);

        for (width, height) in [(640, 480), (1280, 720), (1, 1), (320, 240)] {
            video.set_frame(RgbImage::new(width, height));
            detection_loop.tick(detector.clone()).await;
            assert_eq!(detection_loop.overlay().dimensions(), (width, height));
        }
    }

    /// Reports one size but delivers frames of another, like a camera switching resolution.
    struct ResizingSource;

    impl VideoSource for ResizingSource {
        fn ready_state(&self) -> ReadyState {
            ReadyState::HaveEnoughData
        }

        fn dimensions(&self) -> (u32, u32) {
            (640, 480)
        }

        fn capture(&self) -> Result<RgbImage, cam_source::video::CameraError> {
            Ok(RgbImage::new(1280, 720))
        }
    }

    #[tokio::test]
    async fn test_overlay_follows_captured_frame() {
        let detection_loop = detection_loop(InFlightPolicy::Overlap);
        detection_loop.attach(Arc::new(ResizingSource));
        let detector = ScriptedDetector::new(vec![]);

        detection_loop.tick(detector.clone()).await;

        assert_eq!(detection_loop.overlay().dimensions(), (1280, 720));
    }

    #[tokio::test]
    async fn test_tick_without_video_is_noop() {
        let detection_loop = detection_loop(InFlightPolicy::Overlap);
        let detector = ScriptedDetector::new(vec![]);

        detection_loop.tick(detector.clone()).await;

        assert_eq!(detector.calls(), 0);
        assert_eq!(detection_loop.ticks_fired(), 1);
        assert_eq!(detection_loop.overlay().dimensions(), (0, 0));
    }

    #[tokio::test]
    async fn test_tick_with_unready_video_leaves_overlay_unchanged() {
        let detection_loop = detection_loop(InFlightPolicy::Overlap);
        let video = still(640, 480);
        detection_loop.attach(video.clone());
        let detector = ScriptedDetector::new(vec![(
            Duration::ZERO,
            Ok(vec![detection("person")]),
        )]);
        detection_loop.tick(detector.clone()).await;
        let before = detection_loop.overlay().image().clone();

        video.set_ready_state(ReadyState::HaveCurrentData);
        video.set_frame(RgbImage::new(320, 240));
        detection_loop.tick(detector.clone()).await;

        assert_eq!(detector.calls(), 1);
        assert_eq!(*detection_loop.overlay().image(), before);
        assert_eq!(classes(&detection_loop), vec!["person"]);
    }

    #[tokio::test]
    async fn test_failed_detection_keeps_stale_results() {
        let detection_loop = detection_loop(InFlightPolicy::Overlap);
        detection_loop.attach(still(640, 480));
        let detector = ScriptedDetector::new(vec![
            (Duration::ZERO, Ok(vec![detection("person")])),
            (Duration::ZERO, Err("model crashed".into())),
        ]);

        detection_loop.tick(detector.clone()).await;
        let before = detection_loop.overlay().image().clone();
        detection_loop.tick(detector.clone()).await;

        assert_eq!(detector.calls(), 2);
        assert_eq!(*detection_loop.overlay().image(), before);
        assert_eq!(detection_loop.overlay().labels().len(), 1);
        assert_eq!(classes(&detection_loop), vec!["person"]);
    }

    #[tokio::test]
    async fn test_successful_detection_replaces_results() {
        let detection_loop = detection_loop(InFlightPolicy::Overlap);
        detection_loop.attach(still(640, 480));
        let detector = ScriptedDetector::new(vec![
            (Duration::ZERO, Ok(vec![detection("person"), detection("cup")])),
            (Duration::ZERO, Ok(vec![])),
        ]);

        detection_loop.tick(detector.clone()).await;
        assert_eq!(classes(&detection_loop), vec!["person", "cup"]);
        assert_eq!(detection_loop.overlay().labels().len(), 2);

        detection_loop.tick(detector.clone()).await;
        assert!(classes(&detection_loop).is_empty());
        assert!(detection_loop.overlay().labels().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_ticks_apply_in_completion_order() {
        let detection_loop = detection_loop(InFlightPolicy::Overlap);
        detection_loop.attach(still(640, 480));
        // The first tick is slow, the second one fast
        let detector = ScriptedDetector::new(vec![
            (Duration::from_millis(200), Ok(vec![detection("older")])),
            (Duration::from_millis(50), Ok(vec![detection("newer")])),
        ]);

        tokio::join!(
            detection_loop.tick(detector.clone()),
            detection_loop.tick(detector.clone())
        );

        assert_eq!(detector.calls(), 2);
        assert_eq!(classes(&detection_loop), vec!["older"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_while_busy_drops_overlapping_tick() {
        let detection_loop = detection_loop(InFlightPolicy::SkipWhileBusy);
        detection_loop.attach(still(640, 480));
        let detector = ScriptedDetector::new(vec![
            (Duration::from_millis(200), Ok(vec![detection("first")])),
            (Duration::from_millis(50), Ok(vec![detection("second")])),
        ]);

        tokio::join!(
            detection_loop.tick(detector.clone()),
            detection_loop.tick(detector.clone())
        );
        assert_eq!(detector.calls(), 1);
        assert_eq!(classes(&detection_loop), vec!["first"]);

        // Free again once the detection completed
        detection_loop.tick(detector.clone()).await;
        assert_eq!(detector.calls(), 2);
        assert_eq!(classes(&detection_loop), vec!["second"]);
    }

    #[tokio::test]
    async fn test_composited_frame_requires_ready_video() {
        let detection_loop = detection_loop(InFlightPolicy::Overlap);
        assert!(detection_loop.composited_frame().is_none());

        let video = still(64, 48);
        detection_loop.attach(video.clone());
        assert_eq!(
            detection_loop.composited_frame().map(|f| f.dimensions()),
            Some((64, 48))
        );

        video.set_ready_state(ReadyState::HaveMetadata);
        assert!(detection_loop.composited_frame().is_none());

        assert!(detection_loop.detach().is_some());
        assert!(detection_loop.video().is_none());
    }
}
