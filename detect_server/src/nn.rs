//! YOLO object detector running on tract.
//!
use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use common::detection::Detection;
use image::RgbImage;
use ndarray::{s, ArrayView2, Ix2};
use reqwest::Client;
use tract_onnx::prelude::*;

use crate::{
    detector::{
        BlockingDetector, DetectionError, Detector, DetectorLoader, InferModel, ModelLoadError,
    },
    labels::class_name,
    utils::download_file,
};

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Number of box coordinates preceding the class scores in every prediction.
const BOX_COORDS: usize = 4;

/// Model settings.
#[derive(Clone, Debug)]
pub struct YoloConfig {
    pub model_path: PathBuf,
    /// Fetched into `model_path` when the file does not exist yet.
    pub model_url: Option<String>,
    /// `(width, height)` of the model input.
    pub input_size: (u32, u32),
    pub min_confidence: f32,
    pub max_iou: f32,
}

impl Default for YoloConfig {
    fn default() -> Self {
        Self {
            model_path: crate::utils::default_model_path(),
            model_url: None,
            input_size: (640, 640),
            min_confidence: 0.5,
            max_iou: 0.45,
        }
    }
}

/// Candidate box in model input coordinates.
#[derive(Clone, Debug, PartialEq)]
struct Candidate {
    class_id: usize,
    confidence: f32,
    /// `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`
    corners: [f32; 4],
}

pub struct YoloModel {
    model: NnModel,
    config: YoloConfig,
}

impl YoloModel {
    /// Build the runnable model from the ONNX file. Blocking.
    pub fn new(config: YoloConfig) -> Result<Self, ModelLoadError> {
        let model =
            get_yolo_model(&config).map_err(|e| ModelLoadError::Model(format!("{e:#}")))?;
        Ok(Self { model, config })
    }

    fn preproc(&self, input: &RgbImage) -> Tensor {
        let (width, height) = self.config.input_size;
        let resized: RgbImage = image::imageops::resize(
            input,
            width,
            height,
            image::imageops::FilterType::Triangle,
        );

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, height as usize, width as usize),
            |(_, c, y, x)| resized[(x as _, y as _)][c] as f32 / 255.0,
        )
        .into()
    }

    fn postproc(
        &self,
        raw_nn_out: &Tensor,
        frame_size: (u32, u32),
    ) -> TractResult<Vec<Detection>> {
        // Output is [1, 4 + num_classes, num_predictions], boxes as (cx, cy, w, h)
        let output = raw_nn_out.to_array_view::<f32>()?;
        let predictions = output.slice(s![0, .., ..]).into_dimensionality::<Ix2>()?;

        let candidates = decode_predictions(predictions, self.config.min_confidence);
        let selected = non_maximum_suppression(candidates, self.config.max_iou);

        Ok(selected
            .into_iter()
            .map(|candidate| to_detection(candidate, self.config.input_size, frame_size))
            .collect())
    }
}

impl InferModel for YoloModel {
    fn run(&self, frame: &RgbImage) -> Result<Vec<Detection>, DetectionError> {
        let input = self.preproc(frame);
        let raw_nn_out = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| DetectionError::Inference(format!("{e:#}")))?;
        let output: &Tensor = &raw_nn_out[0];

        self.postproc(output, frame.dimensions())
            .map_err(|e| DetectionError::Inference(format!("{e:#}")))
    }
}

fn get_yolo_model(config: &YoloConfig) -> TractResult<NnModel> {
    let (width, height) = config.input_size;
    let input_fact = InferenceFact::dt_shape(
        f32::datum_type(),
        tvec!(1, 3, height as usize, width as usize),
    );
    let model = tract_onnx::onnx()
        .model_for_path(&config.model_path)?
        .with_input_fact(0, input_fact)?
        .into_optimized()?
        .into_runnable()?;

    Ok(model)
}

/// Loads [`YoloModel`], downloading the ONNX file first if necessary.
pub struct YoloLoader {
    config: YoloConfig,
    client: Client,
}

impl YoloLoader {
    pub fn new(config: YoloConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    async fn ensure_model_file(&self) -> Result<(), ModelLoadError> {
        let path = &self.config.model_path;
        if path.exists() {
            return Ok(());
        }

        match &self.config.model_url {
            None => Err(ModelLoadError::MissingModel(path.display().to_string())),
            Some(url) => {
                log::info!("Downloading model from {} to {}", url, path.display());
                download_file(&self.client, url, path)
                    .await
                    .map_err(|e| ModelLoadError::Download {
                        url: url.clone(),
                        reason: format!("{e:#}"),
                    })
            }
        }
    }
}

#[async_trait]
impl DetectorLoader for YoloLoader {
    async fn load(&self) -> Result<Arc<dyn Detector>, ModelLoadError> {
        self.ensure_model_file().await?;

        let config = self.config.clone();
        log::info!("Loading model {}", config.model_path.display());
        let model = tokio::task::spawn_blocking(move || YoloModel::new(config)).await??;

        Ok(Arc::new(BlockingDetector::new(model)))
    }
}

/// Collect all predictions whose best class score exceeds `min_confidence`.
///
/// `predictions` has one row per output channel (`cx, cy, w, h, score_0, ..`) and one column per
/// prediction.
fn decode_predictions(predictions: ArrayView2<f32>, min_confidence: f32) -> Vec<Candidate> {
    if predictions.nrows() <= BOX_COORDS {
        return vec![];
    }

    predictions
        .columns()
        .into_iter()
        .filter_map(|prediction| {
            let (class_id, confidence) = prediction
                .iter()
                .skip(BOX_COORDS)
                .copied()
                .enumerate()
                .fold((0, f32::MIN), |best, (idx, score)| {
                    if score > best.1 {
                        (idx, score)
                    } else {
                        best
                    }
                });

            if confidence <= min_confidence {
                return None;
            }

            let (cx, cy, w, h) = (prediction[0], prediction[1], prediction[2], prediction[3]);
            Some(Candidate {
                class_id,
                confidence,
                corners: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
            })
        })
        .collect()
}

/// Scale a candidate from model input to frame coordinates and clamp it to the frame.
fn to_detection(
    candidate: Candidate,
    input_size: (u32, u32),
    frame_size: (u32, u32),
) -> Detection {
    let scale_x = frame_size.0 as f32 / input_size.0 as f32;
    let scale_y = frame_size.1 as f32 / input_size.1 as f32;
    let (max_x, max_y) = (frame_size.0 as f32, frame_size.1 as f32);

    let [x_tl, y_tl, x_br, y_br] = candidate.corners;
    let x_tl = (x_tl * scale_x).clamp(0.0, max_x);
    let y_tl = (y_tl * scale_y).clamp(0.0, max_y);
    let x_br = (x_br * scale_x).clamp(0.0, max_x);
    let y_br = (y_br * scale_y).clamp(0.0, max_y);

    Detection::new(
        class_name(candidate.class_id),
        f64::from(candidate.confidence),
        [x_tl, y_tl, x_br - x_tl, y_br - y_tl],
    )
}

/// Run non-maximum-suppression on candidate bounding boxes.
///
/// Start with the most confident bounding box and iterate over all other bounding boxes in the
/// order of sinking confidence. Grow the vector of selected bounding boxes by adding only those
/// candidates which do not overlap an already selected box of the same class by more than
/// `max_iou`. The result is ordered by descending confidence.
fn non_maximum_suppression(mut candidates: Vec<Candidate>, max_iou: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    let mut selected: Vec<Candidate> = vec![];
    'candidates: loop {
        // Get next most confident bbox from the back of ascending-sorted vector.
        match candidates.pop() {
            Some(candidate) => {
                for chosen in selected.iter() {
                    if chosen.class_id == candidate.class_id
                        && iou(&candidate.corners, &chosen.corners) > max_iou
                    {
                        continue 'candidates;
                    }
                }

                selected.push(candidate)
            }
            None => break 'candidates,
        }
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
fn iou(bbox_a: &[f32; 4], bbox_b: &[f32; 4]) -> f32 {
    // If the boxes do not overlap, the top left corner of the overlap box ends up below and to
    // the right of its bottom right corner and the area is zero.
    let overlap_box: [f32; 4] = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box.
///
/// The bounding box is passed as four-element array defining two points:
/// `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`
/// If the bottom-right point lies above/to the left of the top-left point, the area is zero.
fn bbox_area(bbox: &[f32; 4]) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}
