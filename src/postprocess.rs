//! Detection postprocessing.
//!
//! `process` turns raw model output into frame-space detections:
//! 1. drop anything below its class threshold (override, else default)
//! 2. group by class
//! 3. greedy NMS within each class
//! 4. keep only detections whose center lies inside a configured region
//! 5. rescale boxes from model input space to source-frame pixels
//!
//! Within a class the output is ordered by descending confidence; the order
//! across classes is unspecified.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::detect::RawDetection;
use crate::frame::BoundingBox;

/// A detection in source-frame pixel space.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Confidence and overlap thresholds for one task.
#[derive(Clone, Debug, PartialEq)]
pub struct Thresholds {
    pub default: f32,
    pub per_class: HashMap<String, f32>,
    pub nms: f32,
}

impl Thresholds {
    pub fn new(default: f32, nms: f32) -> Self {
        Self {
            default,
            per_class: HashMap::new(),
            nms,
        }
    }

    pub fn with_class(mut self, label: impl Into<String>, threshold: f32) -> Self {
        self.per_class.insert(label.into(), threshold);
        self
    }

    pub fn for_class(&self, label: &str) -> f32 {
        self.per_class.get(label).copied().unwrap_or(self.default)
    }
}

/// Detection region in normalized image coordinates (0..1).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Region {
    Rect { x: f32, y: f32, w: f32, h: f32 },
    Polygon { points: Vec<[f32; 2]> },
}

impl Region {
    pub fn contains(&self, px: f32, py: f32) -> bool {
        match self {
            Region::Rect { x, y, w, h } => px >= *x && px <= x + w && py >= *y && py <= y + h,
            Region::Polygon { points } => point_in_polygon(points, px, py),
        }
    }

    /// Polygons need at least three points, rects a positive size.
    pub fn is_valid(&self) -> bool {
        match self {
            Region::Rect { w, h, .. } => *w > 0.0 && *h > 0.0,
            Region::Polygon { points } => points.len() >= 3,
        }
    }
}

/// Even-odd ray casting.
fn point_in_polygon(points: &[[f32; 2]], px: f32, py: f32) -> bool {
    if points.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = points.len() - 1;
    for i in 0..points.len() {
        let [xi, yi] = points[i];
        let [xj, yj] = points[j];
        if (yi > py) != (yj > py) && px < (xj - xi) * (py - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    a.iou(b)
}

/// Greedy non-maximum suppression over one class.
///
/// Keeps the most confident box and discards every remaining box whose IoU
/// with it exceeds `threshold`, then repeats on what is left.
pub fn nms(mut detections: Vec<RawDetection>, threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<RawDetection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        if kept
            .iter()
            .all(|k| iou(&k.bbox, &candidate.bbox) <= threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}

/// Full postprocessing pipeline; see the module docs.
pub fn process(
    raw: Vec<RawDetection>,
    thresholds: &Thresholds,
    regions: &[Region],
    input_size: (u32, u32),
    frame_size: (u32, u32),
) -> Vec<Detection> {
    let (in_w, in_h) = (input_size.0.max(1) as f32, input_size.1.max(1) as f32);
    let sx = frame_size.0 as f32 / in_w;
    let sy = frame_size.1 as f32 / in_h;

    let mut by_class: BTreeMap<String, Vec<RawDetection>> = BTreeMap::new();
    for detection in raw {
        if detection.confidence >= thresholds.for_class(&detection.label) {
            by_class
                .entry(detection.label.clone())
                .or_default()
                .push(detection);
        }
    }

    let mut out = Vec::new();
    for (_, group) in by_class {
        for detection in nms(group, thresholds.nms) {
            if !regions.is_empty() {
                let (cx, cy) = detection.bbox.center();
                let (nx, ny) = (cx / in_w, cy / in_h);
                if !regions.iter().any(|r| r.contains(nx, ny)) {
                    continue;
                }
            }
            out.push(Detection {
                class_id: detection.class_id,
                label: detection.label,
                confidence: detection.confidence,
                bbox: detection.bbox.scale(sx, sy),
            });
        }
    }
    out
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(label: &str, confidence: f32, bbox: BoundingBox) -> RawDetection {
        RawDetection {
            class_id: 0,
            label: label.to_string(),
            confidence,
            bbox,
        }
    }

    fn run(raw: Vec<RawDetection>, thresholds: &Thresholds) -> Vec<Detection> {
        process(raw, thresholds, &[], (100, 100), (100, 100))
    }

    #[test]
    fn below_threshold_is_dropped() {
        let out = run(
            vec![
                raw("person", 0.9, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
                raw("person", 0.4, BoundingBox::new(50.0, 50.0, 10.0, 10.0)),
            ],
            &Thresholds::new(0.5, 0.4),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, 0.9);
    }

    #[test]
    fn per_class_override_wins() {
        let thresholds = Thresholds::new(0.5, 0.4).with_class("car", 0.95);
        let out = run(
            vec![
                raw("car", 0.9, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
                raw("dog", 0.6, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
            ],
            &thresholds,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].label, "dog");
    }

    #[test]
    fn overlapping_same_class_keeps_most_confident() {
        // Two 40x10 boxes offset by 40/9 overlap with IoU 0.8.
        let a = BoundingBox::new(0.0, 0.0, 40.0, 10.0);
        let b = BoundingBox::new(40.0 / 9.0, 0.0, 40.0, 10.0);
        assert!((iou(&a, &b) - 0.8).abs() < 1e-3);
        let out = run(
            vec![raw("person", 0.7, b), raw("person", 0.9, a)],
            &Thresholds::new(0.5, 0.4),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, 0.9);
    }

    #[test]
    fn overlapping_different_classes_both_survive() {
        let a = BoundingBox::new(0.0, 0.0, 40.0, 40.0);
        let out = run(
            vec![raw("person", 0.9, a), raw("dog", 0.8, a)],
            &Thresholds::new(0.5, 0.4),
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn nms_keeps_disjoint_boxes_in_confidence_order() {
        let kept = nms(
            vec![
                raw("p", 0.6, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
                raw("p", 0.8, BoundingBox::new(50.0, 50.0, 10.0, 10.0)),
            ],
            0.4,
        );
        let confidences: Vec<f32> = kept.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, vec![0.8, 0.6]);
    }

    #[test]
    fn region_filters_by_center() {
        let regions = vec![Region::Rect {
            x: 0.0,
            y: 0.0,
            w: 0.5,
            h: 0.5,
        }];
        let out = process(
            vec![
                raw("p", 0.9, BoundingBox::new(10.0, 10.0, 10.0, 10.0)),
                raw("q", 0.9, BoundingBox::new(70.0, 70.0, 10.0, 10.0)),
            ],
            &Thresholds::new(0.5, 0.4),
            &regions,
            (100, 100),
            (100, 100),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].label, "p");
    }

    #[test]
    fn polygon_contains_uses_ray_casting() {
        let triangle = Region::Polygon {
            points: vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]],
        };
        assert!(triangle.contains(0.2, 0.2));
        assert!(!triangle.contains(0.8, 0.8));
    }

    #[test]
    fn boxes_rescale_to_frame_space() {
        let out = process(
            vec![raw("p", 0.9, BoundingBox::new(10.0, 20.0, 30.0, 40.0))],
            &Thresholds::new(0.5, 0.4),
            &[],
            (100, 100),
            (200, 50),
        );
        assert_eq!(out[0].bbox, BoundingBox::new(20.0, 10.0, 60.0, 20.0));
    }

    #[test]
    fn region_json_shape() {
        let region: Region =
            serde_json::from_str(r#"{"type":"polygon","points":[[0,0],[1,0],[1,1]]}"#).unwrap();
        assert!(region.is_valid());
    }
}
