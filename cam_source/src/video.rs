//! Video sources with a readiness flag, native dimensions and on-demand frame capture.
//!
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use image::RgbImage;
use thiserror::Error;

use crate::sensors::{get_capture_fn_linux, CameraConfig, CaptureFn};

/// Back-off after a failed capture before the device is polled again.
const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("failed to open camera: {0}")]
    Open(String),
    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(String),
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("no frame available")]
    NoFrame,
    #[error("failed to read image: {0}")]
    Image(#[from] image::ImageError),
}

/// Readiness of a video source, ordered like the media element ready states.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub enum ReadyState {
    #[default]
    HaveNothing = 0,
    HaveMetadata = 1,
    HaveCurrentData = 2,
    HaveFutureData = 3,
    HaveEnoughData = 4,
}

impl ReadyState {
    /// Whether a decoded frame can be captured right now.
    pub fn is_ready(self) -> bool {
        self == ReadyState::HaveEnoughData
    }
}

/// A source of decoded video frames.
pub trait VideoSource: Send + Sync {
    fn ready_state(&self) -> ReadyState;

    /// Native `(width, height)` of the stream as currently reported.
    fn dimensions(&self) -> (u32, u32);

    /// Capture the current frame.
    fn capture(&self) -> Result<RgbImage, CameraError>;
}

/// Pixel formats the camera worker can decode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameFormat {
    Mjpg,
    Rgb3,
}

impl FrameFormat {
    pub fn from_fourcc(fourcc: &str) -> Result<Self, CameraError> {
        match fourcc {
            "MJPG" => Ok(FrameFormat::Mjpg),
            "RGB3" => Ok(FrameFormat::Rgb3),
            other => Err(CameraError::UnsupportedFormat(other.to_owned())),
        }
    }

    /// Decode a raw frame buffer into an RGB image.
    pub fn decode(self, data: &[u8], resolution: (u32, u32)) -> Result<RgbImage, CameraError> {
        match self {
            FrameFormat::Mjpg => turbojpeg::decompress_image(data)
                .map_err(|err| CameraError::Decode(err.to_string())),
            FrameFormat::Rgb3 => RgbImage::from_raw(resolution.0, resolution.1, data.to_vec())
                .ok_or_else(|| {
                    CameraError::Decode(format!(
                        "{} bytes do not fit {}x{} RGB",
                        data.len(),
                        resolution.0,
                        resolution.1
                    ))
                }),
        }
    }
}

#[derive(Default)]
struct Latest {
    ready_state: ReadyState,
    dimensions: (u32, u32),
    frame: Option<RgbImage>,
}

#[derive(Default)]
struct Shared {
    latest: Mutex<Latest>,
    stop: AtomicBool,
}

impl Shared {
    fn publish(&self, frame: RgbImage) {
        if let Ok(mut latest) = self.latest.lock() {
            latest.dimensions = frame.dimensions();
            latest.frame = Some(frame);
            latest.ready_state = ReadyState::HaveEnoughData;
        }
    }

    fn set_ready_state(&self, ready_state: ReadyState) {
        if let Ok(mut latest) = self.latest.lock() {
            latest.ready_state = ready_state;
        }
    }
}

/// Camera attached through V4L2, decoded continuously on a worker thread.
///
/// The worker keeps the most recent frame. The source reports
/// [`ReadyState::HaveEnoughData`] once the first frame is decoded and drops back to
/// [`ReadyState::HaveMetadata`] while the device fails to deliver frames.
pub struct CameraSource {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl CameraSource {
    pub fn open(config: &CameraConfig) -> Result<Self, CameraError> {
        let format = FrameFormat::from_fourcc(&config.format)?;
        let (capture_fn, resolution) =
            get_capture_fn_linux(config).map_err(|err| CameraError::Open(err.to_string()))?;

        let shared = Arc::new(Shared::default());
        if let Ok(mut latest) = shared.latest.lock() {
            latest.dimensions = resolution;
            latest.ready_state = ReadyState::HaveMetadata;
        }

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("camera".into())
                .spawn(move || capture_loop(capture_fn, format, resolution, shared))
                .map_err(|err| CameraError::Open(err.to_string()))?
        };

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }
}

fn capture_loop(
    capture_fn: CaptureFn,
    format: FrameFormat,
    resolution: (u32, u32),
    shared: Arc<Shared>,
) {
    while !shared.stop.load(Ordering::Relaxed) {
        match capture_fn() {
            Ok(frame) => match format.decode(&frame[..], frame.resolution) {
                Ok(image) => shared.publish(image),
                Err(err) => log::warn!("Dropping frame: {err}"),
            },
            Err(err) => {
                log::error!("Error capturing frame at {:?}: {err}", resolution);
                shared.set_ready_state(ReadyState::HaveMetadata);
                std::thread::sleep(CAPTURE_RETRY_DELAY);
            }
        }
    }
    log::debug!("Camera worker stopped");
}

impl VideoSource for CameraSource {
    fn ready_state(&self) -> ReadyState {
        self.shared
            .latest
            .lock()
            .map(|latest| latest.ready_state)
            .unwrap_or_default()
    }

    fn dimensions(&self) -> (u32, u32) {
        self.shared
            .latest
            .lock()
            .map(|latest| latest.dimensions)
            .unwrap_or_default()
    }

    fn capture(&self) -> Result<RgbImage, CameraError> {
        let latest = self.shared.latest.lock().map_err(|_| CameraError::NoFrame)?;
        latest.frame.clone().ok_or(CameraError::NoFrame)
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("Camera worker panicked");
            }
        }
    }
}

/// A fixed image served as a video stream.
///
/// Useful to run the detection loop without a camera. The ready state can be changed to mimic a
/// stream that is still starting up.
pub struct StillSource {
    frame: Mutex<RgbImage>,
    ready_state: Mutex<ReadyState>,
}

impl StillSource {
    pub fn new(frame: RgbImage) -> Self {
        Self {
            frame: Mutex::new(frame),
            ready_state: Mutex::new(ReadyState::HaveEnoughData),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, CameraError> {
        let frame = image::open(path)?.to_rgb8();
        Ok(Self::new(frame))
    }

    pub fn set_ready_state(&self, ready_state: ReadyState) {
        if let Ok(mut current) = self.ready_state.lock() {
            *current = ready_state;
        }
    }

    /// Swap the served frame, e.g. to mimic a resolution change.
    pub fn set_frame(&self, frame: RgbImage) {
        if let Ok(mut current) = self.frame.lock() {
            *current = frame;
        }
    }
}

impl VideoSource for StillSource {
    fn ready_state(&self) -> ReadyState {
        self.ready_state.lock().map(|s| *s).unwrap_or_default()
    }

    fn dimensions(&self) -> (u32, u32) {
        self.frame
            .lock()
            .map(|frame| frame.dimensions())
            .unwrap_or_default()
    }

    fn capture(&self) -> Result<RgbImage, CameraError> {
        self.frame
            .lock()
            .map(|frame| frame.clone())
            .map_err(|_| CameraError::NoFrame)
    }
}
