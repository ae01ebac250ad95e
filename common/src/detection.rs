//! Detection records and their textual projection.
//!
use std::fmt;

use serde::{Deserialize, Serialize};

/// One detected object in one frame.
///
/// Detections carry no identity across frames: every tick produces a fresh list which fully
/// replaces the previous one.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Detection {
    /// Class label, e.g. `person`.
    pub class: String,
    /// Confidence in `[0, 1]`.
    pub score: f64,
    /// `[x, y, width, height]` in pixels of the frame the detection was run on.
    pub bbox: [f32; 4],
}

impl Detection {
    pub fn new(class: impl Into<String>, score: f64, bbox: [f32; 4]) -> Self {
        Self {
            class: class.into(),
            score,
            bbox,
        }
    }

    /// Confidence as a rounded integer percentage.
    pub fn percent(&self) -> u32 {
        confidence_percent(self.score)
    }

    /// Top-left and bottom-right corner points `(x_tl, y_tl, x_br, y_br)`.
    pub fn corners(&self) -> (f32, f32, f32, f32) {
        let [x, y, width, height] = self.bbox;
        (x, y, x + width, y + height)
    }
}

/// Convert a confidence in `[0, 1]` to a percentage, rounding half up.
///
/// Out-of-range and NaN scores are clamped into `0..=100`.
pub fn confidence_percent(score: f64) -> u32 {
    let percent = (score * 100.0).round();
    if percent.is_nan() || percent <= 0.0 {
        0
    } else if percent >= 100.0 {
        100
    } else {
        percent as u32
    }
}

/// A row of the result list, rendered as `{class} - {confidence}%`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResultRow {
    pub class: String,
    pub percent: u32,
}

impl From<&Detection> for ResultRow {
    fn from(detection: &Detection) -> Self {
        Self {
            class: detection.class.clone(),
            percent: detection.percent(),
        }
    }
}

impl fmt::Display for ResultRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}%", self.class, self.percent)
    }
}

/// Project a detection list onto result rows, keeping the detector's order.
pub fn result_rows(detections: &[Detection]) -> Vec<ResultRow> {
    detections.iter().map(ResultRow::from).collect()
}

#[cfg(test)]
mod test {

    use super::*;
    use crate::Error;

    #[test]
    fn test_percent_rounds_instead_of_truncating() {
        assert_eq!(confidence_percent(0.8734), 87);
        assert_eq!(confidence_percent(0.005), 1);
        assert_eq!(confidence_percent(0.0), 0);
        assert_eq!(confidence_percent(0.92), 92);
        assert_eq!(confidence_percent(1.0), 100);
    }

    #[test]
    fn test_percent_clamps_out_of_range() {
        assert_eq!(confidence_percent(-0.3), 0);
        assert_eq!(confidence_percent(1.7), 100);
        assert_eq!(confidence_percent(f64::NAN), 0);
    }

    #[test]
    fn test_rows_keep_detector_order() {
        let detections = vec![
            Detection::new("cup", 0.41, [0.0, 0.0, 5.0, 5.0]),
            Detection::new("person", 0.92, [10.0, 20.0, 100.0, 200.0]),
            Detection::new("cup", 0.6, [3.0, 3.0, 5.0, 5.0]),
        ];

        let rows: Vec<String> = result_rows(&detections)
            .iter()
            .map(ToString::to_string)
            .collect();

        assert_eq!(rows, vec!["cup - 41%", "person - 92%", "cup - 60%"]);
    }

    #[test]
    fn test_corners() {
        let detection = Detection::new("person", 0.92, [10.0, 20.0, 100.0, 200.0]);
        assert_eq!(detection.corners(), (10.0, 20.0, 110.0, 220.0));
    }

    #[test]
    fn test_json_field_names() -> Result<(), Error> {
        let detection: Detection = serde_json::from_str(
            r#"{"class": "person", "score": 0.92, "bbox": [10, 20, 100, 200]}"#,
        )?;

        assert_eq!(
            detection,
            Detection::new("person", 0.92, [10.0, 20.0, 100.0, 200.0])
        );

        Ok(())
    }
}
