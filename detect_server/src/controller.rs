//! Detector and timer lifecycles.
//!
//! The detector is loaded once, the timer is (re)started whenever the detection frequency
//! changes. The two only meet when a load completes: the timer starts with the current
//! frequency.
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};

use crate::{
    config::{ConfigError, DetectionFrequency},
    detect_loop::DetectionLoop,
    detector::{Detector, DetectorLoader, ModelLoadError},
    state::{AppPhase, AppState, LoadState},
};

pub struct Controller {
    detection_loop: Arc<DetectionLoop>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    pub fn new(detection_loop: Arc<DetectionLoop>) -> Self {
        Self {
            detection_loop,
            timer: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        self.detection_loop.state()
    }

    pub fn detection_loop(&self) -> &Arc<DetectionLoop> {
        &self.detection_loop
    }

    /// Load the detector and start ticking.
    ///
    /// On failure the load state becomes failed and no timer is started. Calling this again
    /// retries, or swaps the detector when one is already running.
    pub async fn load(&self, loader: &dyn DetectorLoader) -> Result<(), ModelLoadError> {
        self.stop_timer();
        self.state().begin_loading();

        match loader.load().await {
            Ok(detector) => {
                log::info!("Detection model loaded");
                let mut timer = self.lock_timer();
                self.state().mark_ready(detector);
                self.restart_timer(&mut timer);
                Ok(())
            }
            Err(err) => {
                log::error!("Failed to load the detection model: {err}");
                self.state()
                    .mark_failed(format!("Failed to load the detection model: {err}"));
                Err(err)
            }
        }
    }

    /// Change the detection period. A running timer is replaced by one with the new period.
    ///
    /// The timer lock is held while storing the period and respawning, so the stored period is
    /// always the one the running timer ticks at.
    pub fn set_frequency(&self, frequency: DetectionFrequency) {
        let mut timer = self.lock_timer();
        log::info!("Detection frequency set to {} ms", frequency);
        self.state().set_frequency(frequency);
        self.restart_timer(&mut timer);
    }

    /// Validate and apply a detection period given as text.
    pub fn set_frequency_str(&self, millis: &str) -> Result<DetectionFrequency, ConfigError> {
        let frequency: DetectionFrequency = millis.parse()?;
        self.set_frequency(frequency);
        Ok(frequency)
    }

    pub fn is_running(&self) -> bool {
        self.lock_timer()
            .as_ref()
            .map_or(false, |timer| !timer.is_finished())
    }

    pub fn phase(&self) -> AppPhase {
        match self.state().load_state() {
            LoadState::Loading => AppPhase::Loading,
            LoadState::Failed(msg) => AppPhase::Failed(msg),
            LoadState::Ready(_) if self.is_running() => AppPhase::Running,
            LoadState::Ready(_) => AppPhase::Ready,
        }
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_timer(&self) {
        if let Some(timer) = self.lock_timer().take() {
            timer.abort();
        }
    }

    /// Replace the timer in `timer` with one ticking at the stored period. Without a loaded
    /// detector nothing is started.
    fn restart_timer(&self, timer: &mut Option<JoinHandle<()>>) {
        let Some(detector) = self.state().detector() else {
            return;
        };
        let period = self.state().frequency().period();

        if let Some(previous) = timer.take() {
            previous.abort();
        }

        log::debug!("Starting detection timer with period {:?}", period);
        *timer = Some(tokio::spawn(run_timer(
            Arc::clone(&self.detection_loop),
            detector,
            period,
        )));
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop_timer();
    }
}

/// Fire a tick every `period`, the first one `period` after start.
///
/// Every tick runs as its own task so a slow detection never delays the next tick. Aborting the
/// timer leaves ticks already in flight running.
async fn run_timer(
    detection_loop: Arc<DetectionLoop>,
    detector: Arc<dyn Detector>,
    period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let detection_loop = Arc::clone(&detection_loop);
        let detector = Arc::clone(&detector);
        tokio::spawn(async move { detection_loop.tick(detector).await });
    }
}

#[cfg(test)]
mod test {

    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use cam_source::video::StillSource;
    use common::detection::Detection;
    use image::RgbImage;
    use tokio::time::sleep;

    use super::*;
    use crate::{config::InFlightPolicy, detector::DetectionError, overlay::OverlayRenderer};

    /// Records when it is called.
    #[derive(Default)]
    struct StampingDetector {
        stamps: StdMutex<Vec<Instant>>,
    }

    impl StampingDetector {
        fn stamps(&self) -> Vec<Instant> {
            self.stamps.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Detector for StampingDetector {
        async fn detect(&self, _frame: RgbImage) -> Result<Vec<Detection>, DetectionError> {
            self.stamps.lock().unwrap().push(Instant::now());
            Ok(vec![Detection::new("person", 0.92, [1.0, 1.0, 5.0, 5.0])])
        }
    }

    struct Loader(Option<Arc<StampingDetector>>);

    #[async_trait]
    impl DetectorLoader for Loader {
        async fn load(&self) -> Result<Arc<dyn Detector>, ModelLoadError> {
            match &self.0 {
                Some(detector) => Ok(detector.clone()),
                None => Err(ModelLoadError::Model("corrupt weights".into())),
            }
        }
    }

    fn controller(millis: i64) -> Controller {
        let frequency = DetectionFrequency::from_millis(millis).unwrap();
        let detection_loop = Arc::new(DetectionLoop::new(
            Arc::new(AppState::new(frequency)),
            OverlayRenderer::default(),
            InFlightPolicy::Overlap,
        ));
        detection_loop.attach(Arc::new(StillSource::new(RgbImage::new(64, 48))));
        Controller::new(detection_loop)
    }

    fn millis_since(start: Instant, stamps: &[Instant]) -> Vec<u128> {
        stamps.iter().map(|s| (*s - start).as_millis()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_load_never_starts_timer() {
        let controller = controller(50);

        let result = controller.load(&Loader(None)).await;

        assert!(matches!(result, Err(ModelLoadError::Model(_))));
        assert!(!controller.is_running());
        assert_eq!(
            controller.phase(),
            AppPhase::Failed(
                "Failed to load the detection model: failed to initialize model: corrupt weights"
                    .into()
            )
        );

        sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.detection_loop().ticks_fired(), 0);

        // Changing the frequency does not start ticking either
        controller.set_frequency(DetectionFrequency::from_millis(20).unwrap());
        sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.detection_loop().ticks_fired(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_follow_period() {
        let controller = controller(100);
        let detector = Arc::new(StampingDetector::default());
        let start = Instant::now();

        controller.load(&Loader(Some(detector.clone()))).await.unwrap();
        assert_eq!(controller.phase(), AppPhase::Running);
        sleep(Duration::from_millis(350)).await;

        assert_eq!(
            millis_since(start, &detector.stamps()),
            vec![100, 200, 300]
        );
        let rows: Vec<String> = controller
            .state()
            .result_rows()
            .iter()
            .map(|r| r.to_string())
            .collect();
        assert_eq!(rows, vec!["person - 92%"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frequency_change_restarts_timer() {
        let controller = controller(100);
        let detector = Arc::new(StampingDetector::default());
        let start = Instant::now();
        controller.load(&Loader(Some(detector.clone()))).await.unwrap();
        sleep(Duration::from_millis(350)).await;

        controller.set_frequency_str("250").unwrap();
        sleep(Duration::from_millis(800)).await;

        assert_eq!(
            millis_since(start, &detector.stamps()),
            vec![100, 200, 300, 600, 850, 1100]
        );
        assert_eq!(controller.state().frequency().as_millis(), 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_frequency_keeps_timer() {
        let controller = controller(100);
        let detector = Arc::new(StampingDetector::default());
        let start = Instant::now();
        controller.load(&Loader(Some(detector.clone()))).await.unwrap();
        sleep(Duration::from_millis(150)).await;

        assert_eq!(
            controller.set_frequency_str("0"),
            Err(ConfigError::NonPositive(0))
        );
        assert!(controller.set_frequency_str("soon").is_err());
        sleep(Duration::from_millis(100)).await;

        assert_eq!(millis_since(start, &detector.stamps()), vec![100, 200]);
        assert_eq!(controller.state().frequency().as_millis(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frequency_set_while_loading_applies_after_load() {
        let controller = controller(100);
        controller.set_frequency(DetectionFrequency::from_millis(40).unwrap());
        assert!(!controller.is_running());
        assert_eq!(controller.phase(), AppPhase::Loading);

        let detector = Arc::new(StampingDetector::default());
        let start = Instant::now();
        controller.load(&Loader(Some(detector.clone()))).await.unwrap();
        sleep(Duration::from_millis(130)).await;

        assert_eq!(millis_since(start, &detector.stamps()), vec![40, 80, 120]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_frequency_changes_leave_matching_timer() {
        let controller = controller(100);
        let detector = Arc::new(StampingDetector::default());
        controller.load(&Loader(Some(detector.clone()))).await.unwrap();

        let handle = tokio::runtime::Handle::current();
        std::thread::scope(|scope| {
            for millis in [120, 170, 220, 270, 320, 370, 420, 470] {
                let (controller, handle) = (&controller, &handle);
                scope.spawn(move || {
                    let _runtime = handle.enter();
                    controller.set_frequency_str(&millis.to_string()).unwrap();
                });
            }
        });

        let period = controller.state().frequency().as_millis() as u128;
        let start = Instant::now();
        sleep(Duration::from_millis(period as u64 * 3 + 10)).await;

        let stamps: Vec<u128> = millis_since(start, &detector.stamps())
            .into_iter()
            .filter(|stamp| *stamp > 0)
            .collect();
        assert_eq!(stamps, vec![period, 2 * period, 3 * period]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_after_failure() {
        let controller = controller(100);
        assert!(controller.load(&Loader(None)).await.is_err());

        let detector = Arc::new(StampingDetector::default());
        controller.load(&Loader(Some(detector.clone()))).await.unwrap();
        sleep(Duration::from_millis(250)).await;

        assert_eq!(controller.phase(), AppPhase::Running);
        assert_eq!(detector.stamps().len(), 2);
    }
}
