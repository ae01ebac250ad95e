//! Application state container and its transitions.
//!
use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use common::detection::{result_rows, Detection, ResultRow};
use tokio::sync::watch;

use crate::{config::DetectionFrequency, detector::Detector};

pub type DetectionList = Arc<Vec<Detection>>;

/// Lifecycle of the detector.
#[derive(Clone)]
pub enum LoadState {
    Loading,
    Ready(Arc<dyn Detector>),
    Failed(String),
}

impl fmt::Debug for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadState::Loading => write!(f, "Loading"),
            LoadState::Ready(_) => write!(f, "Ready"),
            LoadState::Failed(msg) => f.debug_tuple("Failed").field(msg).finish(),
        }
    }
}

/// Phase of the whole application as shown to the user.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AppPhase {
    Loading,
    Ready,
    Running,
    Failed(String),
}

impl fmt::Display for AppPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppPhase::Loading => write!(f, "loading"),
            AppPhase::Ready => write!(f, "ready"),
            AppPhase::Running => write!(f, "running"),
            AppPhase::Failed(msg) => write!(f, "error: {msg}"),
        }
    }
}

/// Load state, detection period, video source error and the published detection list.
///
/// The detection list is published through a watch channel: readers always get a whole list, a
/// new publication replaces the previous list.
pub struct AppState {
    load_state: RwLock<LoadState>,
    frequency: RwLock<DetectionFrequency>,
    video_error: RwLock<Option<String>>,
    detections_tx: watch::Sender<DetectionList>,
}

impl AppState {
    pub fn new(frequency: DetectionFrequency) -> Self {
        let (detections_tx, _) = watch::channel(Arc::new(vec![]));
        Self {
            load_state: RwLock::new(LoadState::Loading),
            frequency: RwLock::new(frequency),
            video_error: RwLock::new(None),
            detections_tx,
        }
    }

    pub fn begin_loading(&self) {
        self.set_load_state(LoadState::Loading);
    }

    pub fn mark_ready(&self, detector: Arc<dyn Detector>) {
        self.set_load_state(LoadState::Ready(detector));
    }

    pub fn mark_failed(&self, message: impl Into<String>) {
        self.set_load_state(LoadState::Failed(message.into()));
    }

    fn set_load_state(&self, load_state: LoadState) {
        log::debug!("Load state: {:?}", &load_state);
        *self
            .load_state
            .write()
            .unwrap_or_else(PoisonError::into_inner) = load_state;
    }

    pub fn load_state(&self) -> LoadState {
        self.load_state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The detector, once loaded.
    pub fn detector(&self) -> Option<Arc<dyn Detector>> {
        match self.load_state() {
            LoadState::Ready(detector) => Some(detector),
            _ => None,
        }
    }

    pub fn frequency(&self) -> DetectionFrequency {
        *self.frequency.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_frequency(&self, frequency: DetectionFrequency) {
        *self
            .frequency
            .write()
            .unwrap_or_else(PoisonError::into_inner) = frequency;
    }

    /// Record why no video is available, `None` once a source works again.
    pub fn set_video_error(&self, error: Option<String>) {
        *self
            .video_error
            .write()
            .unwrap_or_else(PoisonError::into_inner) = error;
    }

    pub fn video_error(&self) -> Option<String> {
        self.video_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the published detections.
    pub fn publish(&self, detections: Vec<Detection>) -> DetectionList {
        let detections = Arc::new(detections);
        self.detections_tx.send_replace(Arc::clone(&detections));
        detections
    }

    pub fn detections(&self) -> DetectionList {
        Arc::clone(&self.detections_tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<DetectionList> {
        self.detections_tx.subscribe()
    }

    /// The published detections as result list rows.
    pub fn result_rows(&self) -> Vec<ResultRow> {
        result_rows(&self.detections())
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(DetectionFrequency::default())
    }
}
