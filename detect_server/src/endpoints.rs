//! Endpoints of HTTP server.
//!
use std::{sync::Arc, time::Duration};

use axum::{
    body::StreamBody,
    extract::Query,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use bytes::Bytes;
use common::detection::Detection;
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::IntervalStream;

use crate::{controller::Controller, detect_loop::DetectionLoop, meter::METER};

/// Pace of the preview stream.
const PREVIEW_PERIOD: Duration = Duration::from_millis(33);

/// JPEG quality of the preview stream.
const PREVIEW_QUALITY: i32 = 80;

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>Object detection</title></head>
<body>
    <div class="container">
        <h3>Live detection</h3>
        <p id="status">loading</p>
        <img src="./stream" width="640">
        <aside>
            <h2>Detections</h2>
            <pre id="detections"></pre>
        </aside>
        <footer>
            <label>Detection Frequency (ms):
                <input id="frequency" type="number">
            </label>
            <span id="frequency-error"></span>
        </footer>
    </div>
    <script>
        const frequency = document.getElementById("frequency");
        fetch("./frequency").then(r => r.text()).then(ms => frequency.value = ms);
        frequency.addEventListener("change", async () => {
            const resp = await fetch("./frequency?ms=" + encodeURIComponent(frequency.value), { method: "POST" });
            document.getElementById("frequency-error").textContent = resp.ok ? "" : await resp.text();
        });
        setInterval(async () => {
            document.getElementById("status").textContent = await (await fetch("./status")).text();
            document.getElementById("detections").textContent = await (await fetch("./detections")).text();
        }, 250);
    </script>
</body>
</html>
"#;

/// Query parameters of the frequency endpoint.
#[derive(Debug, Deserialize)]
pub struct FrequencyParams {
    #[serde(default)]
    pub ms: Option<String>,
}

/// Build the router serving the UI.
pub fn router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthcheck", get(healthcheck))
        .route("/status", get(status))
        .route("/stream", get(stream))
        .route("/overlay.png", get(overlay_png))
        .route("/detections", get(detections))
        .route("/detections.json", get(detections_json))
        .route("/frequency", get(frequency).post(set_frequency))
        .layer(Extension(controller))
}

pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

/// Detector phase, followed by the webcam error if no video source could be opened.
pub async fn status(Extension(controller): Extension<Arc<Controller>>) -> String {
    let phase = controller.phase();
    match controller.state().video_error() {
        Some(err) => format!("{phase} (webcam error: {err})"),
        None => phase.to_string(),
    }
}

/// Result list, one `{class} - {confidence}%` row per line.
pub async fn detections(Extension(controller): Extension<Arc<Controller>>) -> String {
    controller
        .state()
        .result_rows()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

pub async fn detections_json(
    Extension(controller): Extension<Arc<Controller>>,
) -> Json<Vec<Detection>> {
    Json(controller.state().detections().as_ref().clone())
}

pub async fn frequency(Extension(controller): Extension<Arc<Controller>>) -> String {
    controller.state().frequency().to_string()
}

pub async fn set_frequency(
    Extension(controller): Extension<Arc<Controller>>,
    Query(params): Query<FrequencyParams>,
) -> (StatusCode, String) {
    let ms = params.ms.unwrap_or_default();
    match controller.set_frequency_str(&ms) {
        Ok(frequency) => (StatusCode::OK, frequency.to_string()),
        Err(err) => {
            log::warn!("Rejected detection frequency: {err}");
            (StatusCode::BAD_REQUEST, err.to_string())
        }
    }
}

pub async fn overlay_png(Extension(controller): Extension<Arc<Controller>>) -> Response {
    let png = controller.detection_loop().overlay().to_png();
    match png {
        Ok(buf) => ([(header::CONTENT_TYPE, "image/png")], buf).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// Video frames with the overlay composited on top, as multipart JPEG stream.
pub async fn stream(Extension(controller): Extension<Arc<Controller>>) -> impl IntoResponse {
    log::info!("Stream requested");

    let detection_loop = Arc::clone(controller.detection_loop());
    let stream = IntervalStream::new(tokio::time::interval(PREVIEW_PERIOD))
        .filter_map(move |_| futures::future::ready(preview_jpeg(&detection_loop)))
        .map(|jpeg| {
            METER.tick_streamed();
            Ok::<_, std::io::Error>(as_jpeg_stream_item(&jpeg))
        });

    // Set body and headers for multipart streaming
    let body = StreamBody::new(stream);
    let headers = [(
        header::CONTENT_TYPE,
        "multipart/x-mixed-replace; boundary=frame",
    )];

    (headers, body)
}

fn preview_jpeg(detection_loop: &DetectionLoop) -> Option<Vec<u8>> {
    let frame = detection_loop.composited_frame()?;
    match turbojpeg::compress_image(&frame, PREVIEW_QUALITY, turbojpeg::Subsamp::Sub2x2) {
        Ok(buf) => Some(buf.to_vec()),
        Err(err) => {
            log::warn!("Failed to compress preview frame: {err}");
            None
        }
    }
}

fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(
        &[
            "--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_bytes(),
            data,
            "\r\n\r\n".as_bytes(),
        ]
        .concat(),
    )
}
