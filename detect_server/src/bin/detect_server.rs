//! Detection server binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Result;
use cam_source::{
    sensors::CameraConfig,
    video::{CameraSource, StillSource, VideoSource},
};
use clap::Parser;
use detect_server::{
    config::{DetectionFrequency, InFlightPolicy},
    controller::Controller,
    detect_loop::DetectionLoop,
    endpoints::router,
    meter::spawn_meter_logger,
    nn::{YoloConfig, YoloLoader},
    overlay::OverlayRenderer,
    state::AppState,
    utils::default_model_path,
};
use env_logger::TimestampPrecision;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to serve the UI on
    #[clap(long, default_value = "127.0.0.1:3000")]
    server_address: String,

    /// Video device to capture from
    #[clap(long, default_value = "/dev/video0")]
    device: String,

    /// Pixel format of the camera, MJPG or RGB3
    #[clap(long, default_value = "MJPG")]
    format: String,

    /// Capture width, the largest supported resolution if unset
    #[clap(long, requires = "height")]
    width: Option<u32>,

    /// Capture height, the largest supported resolution if unset
    #[clap(long, requires = "width")]
    height: Option<u32>,

    /// Capture frame rate, the highest supported if unset
    #[clap(long)]
    fps: Option<u32>,

    /// Serve this image instead of a camera stream
    #[clap(long)]
    still_image: Option<PathBuf>,

    /// Milliseconds between two detections
    #[clap(long, default_value = "66")]
    detection_frequency: DetectionFrequency,

    /// What to do with ticks while a detection is running
    #[clap(long, value_enum, default_value_t = InFlightPolicy::Overlap)]
    in_flight: InFlightPolicy,

    /// YOLO model in ONNX format, defaults to the user cache directory
    #[clap(long)]
    model_path: Option<PathBuf>,

    /// URL to download the model from if it is not present yet
    #[clap(long)]
    model_url: Option<String>,

    /// Width of the model input
    #[clap(long, default_value = "640")]
    input_width: u32,

    /// Height of the model input
    #[clap(long, default_value = "640")]
    input_height: u32,

    /// Minimum confidence of reported detections
    #[clap(long, default_value = "0.5")]
    min_confidence: f32,

    /// Maximum overlap of two detections of the same class
    #[clap(long, default_value = "0.45")]
    max_iou: f32,

    /// TrueType font for the box labels
    #[clap(long, default_value = "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf")]
    font: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let font = match OverlayRenderer::load_font(&args.font) {
        Ok(font) => Some(font),
        Err(err) => {
            log::warn!("Drawing boxes without label text, no font: {err:#}");
            None
        }
    };

    let state = Arc::new(AppState::new(args.detection_frequency));
    let detection_loop = Arc::new(DetectionLoop::new(
        state,
        OverlayRenderer::new(font),
        args.in_flight,
    ));

    // Without a video source every tick is a no-op, the UI still reports the state
    match open_video(&args) {
        Ok(video) => detection_loop.attach(video),
        Err(err) => {
            log::error!("No video source: {err:#}");
            detection_loop.state().set_video_error(Some(format!("{err:#}")));
        }
    }

    let controller = Arc::new(Controller::new(detection_loop));

    // Load the detector once, in the background so the UI can report loading
    {
        let controller = Arc::clone(&controller);
        let loader = YoloLoader::new(YoloConfig {
            model_path: args.model_path.clone().unwrap_or_else(default_model_path),
            model_url: args.model_url.clone(),
            input_size: (args.input_width, args.input_height),
            min_confidence: args.min_confidence,
            max_iou: args.max_iou,
        });
        tokio::spawn(async move { controller.load(&loader).await });
    }

    spawn_meter_logger();

    // Serve HTTP server
    let addr: SocketAddr = args.server_address.parse()?;
    log::info!("Serving on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(router(controller).into_make_service())
        .await?;

    Ok(())
}

fn open_video(args: &Args) -> Result<Arc<dyn VideoSource>> {
    if let Some(path) = &args.still_image {
        log::info!("Serving still image {}", path.display());
        return Ok(Arc::new(StillSource::open(path)?));
    }

    let config = CameraConfig {
        device: args.device.clone(),
        format: args.format.clone(),
        resolution: args.width.zip(args.height),
        frame_rate: args.fps.map(|fps| (1, fps)),
    };
    Ok(Arc::new(CameraSource::open(&config)?))
}
