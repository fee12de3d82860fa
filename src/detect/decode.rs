//! Decoding raw model output rows into detections.
//!
//! Two row layouts are understood:
//! - 6 columns: `[x1, y1, x2, y2, confidence, class_id]` (exported with NMS head)
//! - more than 6: YOLOv5 `[cx, cy, w, h, objectness, class scores...]`,
//!   confidence = objectness x best class score

use crate::error::InferenceError;
use crate::frame::BoundingBox;

use super::{BackendDescriptor, OutputRows, RawDetection};

/// Rows scoring below this never reach the postprocessor.
const MIN_DECODE_CONFIDENCE: f32 = 0.01;

/// Decode output rows into detections in model input space, clamped to
/// the input bounds.
pub fn decode_rows(
    output: &OutputRows,
    descriptor: &BackendDescriptor,
) -> Result<Vec<RawDetection>, InferenceError> {
    let width = descriptor.input_width as f32;
    let height = descriptor.input_height as f32;
    let mut detections = Vec::new();

    match output.columns {
        0 if output.data.is_empty() => {}
        6 => {
            for row in output.rows() {
                let confidence = row[4];
                if below_floor(confidence) {
                    continue;
                }
                let class_id = class_index(row[5])?;
                let bbox = BoundingBox::from_corners(row[0], row[1], row[2], row[3])
                    .clamp_to(width, height);
                detections.push(RawDetection {
                    class_id,
                    label: descriptor.label_for(class_id),
                    confidence,
                    bbox,
                });
            }
        }
        columns if columns > 6 => {
            for row in output.rows() {
                let objectness = row[4];
                if below_floor(objectness) {
                    continue;
                }
                let (class_id, best) = row[5..]
                    .iter()
                    .copied()
                    .enumerate()
                    .fold((0usize, f32::NEG_INFINITY), |acc, (i, score)| {
                        if score > acc.1 {
                            (i, score)
                        } else {
                            acc
                        }
                    });
                let confidence = objectness * best;
                if below_floor(confidence) {
                    continue;
                }
                let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
                let bbox = BoundingBox::from_corners(
                    cx - w / 2.0,
                    cy - h / 2.0,
                    cx + w / 2.0,
                    cy + h / 2.0,
                )
                .clamp_to(width, height);
                detections.push(RawDetection {
                    class_id,
                    label: descriptor.label_for(class_id),
                    confidence,
                    bbox,
                });
            }
        }
        columns => {
            return Err(InferenceError::Runtime(format!(
                "unsupported model output layout with {} columns",
                columns
            )))
        }
    }
    Ok(detections)
}

fn below_floor(score: f32) -> bool {
    score.is_nan() || score < MIN_DECODE_CONFIDENCE
}

fn class_index(value: f32) -> Result<usize, InferenceError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value.round() as usize)
    } else {
        Err(InferenceError::Runtime(format!("invalid class id {}", value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::HardwareKind;

    fn descriptor() -> BackendDescriptor {
        let mut d = BackendDescriptor::new("m", HardwareKind::Cpu, "stub://m");
        d.input_width = 100;
        d.input_height = 100;
        d.labels = vec!["person".into(), "car".into()];
        d
    }

    #[test]
    fn corner_rows_decode() {
        let rows = OutputRows::new(
            vec![
                10.0, 20.0, 50.0, 80.0, 0.9, 0.0, //
                0.0, 0.0, 10.0, 10.0, 0.001, 1.0, //
                90.0, 90.0, 120.0, 130.0, 0.6, 5.0,
            ],
            6,
        );
        let out = decode_rows(&rows, &descriptor()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].label, "person");
        assert_eq!(out[0].bbox, BoundingBox::new(10.0, 20.0, 40.0, 60.0));
        assert_eq!(out[1].label, "class_5");
        assert_eq!(out[1].bbox, BoundingBox::new(90.0, 90.0, 10.0, 10.0));
    }

    #[test]
    fn yolo_rows_multiply_objectness() {
        let rows = OutputRows::new(vec![50.0, 50.0, 20.0, 10.0, 0.8, 0.25, 0.5], 7);
        let out = decode_rows(&rows, &descriptor()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].label, "car");
        assert!((out[0].confidence - 0.4).abs() < 1e-6);
        assert_eq!(out[0].bbox, BoundingBox::new(40.0, 45.0, 20.0, 10.0));
    }

    #[test]
    fn unknown_layout_is_an_error() {
        let rows = OutputRows::new(vec![1.0; 8], 4);
        assert!(decode_rows(&rows, &descriptor()).is_err());
    }
}
