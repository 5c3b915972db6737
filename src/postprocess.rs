//! Raw model outputs to labeled detections.
//!
//! Each box keeps its best-scoring class, greedy non-maximum suppression picks
//! the survivors, and survivors are reported in selection order.

use std::cmp::Ordering;

use ndarray::{ArrayView3, Axis, Ix3};
use tracing::debug;

use crate::error::{DroneAidError, Result};
use crate::types::{label_for, Detection, PostprocessOptions, RawOutputs};

/// Best score and class per box.
///
/// Classes are scanned in ascending order with a strict `>`, so the first of
/// several equal maxima wins. The scan starts at the smallest positive `f32`;
/// a box with no score above it keeps that score and gets class `-1`.
pub fn calculate_max_scores(
    scores: &[f32],
    num_boxes: usize,
    num_classes: usize,
) -> Result<(Vec<f32>, Vec<i32>)> {
    let expected = num_boxes.checked_mul(num_classes);
    if expected != Some(scores.len()) {
        return Err(DroneAidError::shape(
            "scores",
            format!("{} x {}", num_boxes, num_classes),
            scores.len(),
        ));
    }

    let mut maxes = Vec::with_capacity(num_boxes);
    let mut classes = Vec::with_capacity(num_boxes);
    for row in scores.chunks_exact(num_classes.max(1)).take(num_boxes) {
        let mut max = f32::from_bits(1);
        let mut index = -1i32;
        for (j, &score) in row.iter().enumerate() {
            if score > max {
                max = score;
                index = j as i32;
            }
        }
        maxes.push(max);
        classes.push(index);
    }
    // zero classes: every box is classless
    maxes.resize(num_boxes, f32::from_bits(1));
    classes.resize(num_boxes, -1);

    Ok((maxes, classes))
}

/// Intersection over union of two `[y1, x1, y2, x2]` boxes.
///
/// Corners may come in either order. A zero-area union gives `0.0`.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f64 {
    let [ay1, ax1, ay2, ax2] = a.map(f64::from);
    let [by1, bx1, by2, bx2] = b.map(f64::from);

    let (a_ymin, a_ymax) = (ay1.min(ay2), ay1.max(ay2));
    let (a_xmin, a_xmax) = (ax1.min(ax2), ax1.max(ax2));
    let (b_ymin, b_ymax) = (by1.min(by2), by1.max(by2));
    let (b_xmin, b_xmax) = (bx1.min(bx2), bx1.max(bx2));

    let area_a = (a_ymax - a_ymin) * (a_xmax - a_xmin);
    let area_b = (b_ymax - b_ymin) * (b_xmax - b_xmin);
    if area_a <= 0.0 || area_b <= 0.0 {
        return 0.0;
    }

    let inter_h = (a_ymax.min(b_ymax) - a_ymin.max(b_ymin)).max(0.0);
    let inter_w = (a_xmax.min(b_xmax) - a_xmin.max(b_xmin)).max(0.0);
    let intersection = inter_h * inter_w;

    intersection / (area_a + area_b - intersection)
}

/// Greedy non-maximum suppression.
///
/// Candidates are boxes scoring strictly above `score_threshold`, visited by
/// descending score; equal scores keep their original index order. A candidate
/// is dropped when its IoU with any already selected box exceeds
/// `iou_threshold`. Returns at most `max_output` indices, in selection order.
pub fn non_max_suppression(
    boxes: &[[f32; 4]],
    scores: &[f32],
    max_output: usize,
    iou_threshold: f64,
    score_threshold: f64,
) -> Vec<usize> {
    let mut candidates: Vec<usize> = (0..boxes.len().min(scores.len()))
        .filter(|&i| f64::from(scores[i]) > score_threshold)
        .collect();
    // stable: ties stay in index order
    candidates.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(Ordering::Equal)
    });

    let mut selected: Vec<usize> = Vec::with_capacity(max_output.min(candidates.len()));
    for candidate in candidates {
        if selected.len() >= max_output {
            break;
        }
        let suppressed = selected
            .iter()
            .any(|&kept| iou(&boxes[kept], &boxes[candidate]) > iou_threshold);
        if !suppressed {
            selected.push(candidate);
        }
    }
    selected
}

/// Rounds to 4 decimal places and clamps below at zero.
pub fn round_coord(coord: f32) -> f32 {
    let rounded = (f64::from(coord) * 10_000.0).round() / 10_000.0;
    if rounded > 0.0 {
        rounded as f32
    } else {
        0.0
    }
}

pub fn format_response(
    indexes: &[usize],
    boxes: &[[f32; 4]],
    classes: &[i32],
    max_scores: &[f32],
) -> Vec<Detection> {
    indexes
        .iter()
        .map(|&idx| Detection {
            class_index: classes[idx],
            label: label_for(classes[idx]).to_string(),
            score: max_scores[idx],
            bbox: boxes[idx].map(round_coord),
        })
        .collect()
}

/// Detections from flat row-major `scores` (`num_boxes * num_classes`) and
/// `boxes` shaped `[num_boxes, 1, 4]`.
pub fn postprocess(
    scores: &[f32],
    boxes: ArrayView3<'_, f32>,
    num_boxes: usize,
    num_classes: usize,
    options: &PostprocessOptions,
) -> Result<Vec<Detection>> {
    options.validate()?;

    if boxes.shape() != [num_boxes, 1, 4] {
        return Err(DroneAidError::shape(
            "boxes",
            format!("{:?}", [num_boxes, 1, 4]),
            format!("{:?}", boxes.shape()),
        ));
    }
    let (max_scores, classes) = calculate_max_scores(scores, num_boxes, num_classes)?;

    let box_list: Vec<[f32; 4]> = boxes
        .index_axis(Axis(1), 0)
        .rows()
        .into_iter()
        .map(|row| [row[0], row[1], row[2], row[3]])
        .collect();

    // classless boxes never enter suppression
    let nms_scores: Vec<f32> = max_scores
        .iter()
        .zip(&classes)
        .map(|(&score, &class)| if class < 0 { f32::NEG_INFINITY } else { score })
        .collect();

    let indexes = non_max_suppression(
        &box_list,
        &nms_scores,
        options.max_num_boxes,
        options.iou_threshold,
        options.score_threshold,
    );
    debug!(
        "nms kept {} of {} boxes (score > {}, iou <= {})",
        indexes.len(),
        num_boxes,
        options.score_threshold,
        options.iou_threshold
    );

    Ok(format_response(&indexes, &box_list, &classes, &max_scores))
}

/// Drops the batch axis of the model outputs and runs [`postprocess`].
pub fn process_raw_outputs(raw: &RawOutputs, options: &PostprocessOptions) -> Result<Vec<Detection>> {
    let score_shape = raw.scores.shape();
    if score_shape.len() != 3 || score_shape[0] != 1 {
        return Err(DroneAidError::shape(
            "scores tensor",
            "[1, num_boxes, num_classes]",
            format!("{:?}", score_shape),
        ));
    }
    let (num_boxes, num_classes) = (score_shape[1], score_shape[2]);

    let box_shape = raw.boxes.shape();
    if box_shape.len() != 4 || box_shape[0] != 1 {
        return Err(DroneAidError::shape(
            "boxes tensor",
            "[1, num_boxes, 1, 4]",
            format!("{:?}", box_shape),
        ));
    }
    let boxes = raw
        .boxes
        .index_axis(Axis(0), 0)
        .into_dimensionality::<Ix3>()
        .map_err(|e| DroneAidError::shape("boxes tensor", "[num_boxes, 1, 4]", e))?;

    let scores: Vec<f32> = raw.scores.iter().copied().collect();
    postprocess(&scores, boxes, num_boxes, num_classes, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, ArrayD, IxDyn};

    fn boxes3(list: &[[f32; 4]]) -> Array3<f32> {
        let flat: Vec<f32> = list.iter().flatten().copied().collect();
        Array3::from_shape_vec((list.len(), 1, 4), flat).unwrap()
    }

    /// One class per box, every other class at zero.
    fn one_hot(num_classes: usize, picks: &[(usize, f32)]) -> Vec<f32> {
        let mut scores = vec![0.0; picks.len() * num_classes];
        for (i, &(class, score)) in picks.iter().enumerate() {
            scores[i * num_classes + class] = score;
        }
        scores
    }

    #[test]
    fn test_max_scores_picks_best_class() {
        let (maxes, classes) = calculate_max_scores(&[0.1, 0.9, 0.2], 1, 3).unwrap();
        assert_eq!(maxes, vec![0.9]);
        assert_eq!(classes, vec![1]);
    }

    #[test]
    fn test_max_scores_first_maximum_wins() {
        let (maxes, classes) = calculate_max_scores(&[0.5, 0.5], 1, 2).unwrap();
        assert_eq!(maxes, vec![0.5]);
        assert_eq!(classes, vec![0]);
    }

    #[test]
    fn test_max_scores_without_positive_score_is_classless() {
        let (maxes, classes) =
            calculate_max_scores(&[0.0, 0.0, -1.0, -0.5, 0.2, 0.1], 3, 2).unwrap();
        assert_eq!(classes, vec![-1, -1, 0]);
        assert_eq!(maxes[0], f32::from_bits(1));
        assert_eq!(maxes[1], f32::from_bits(1));
        assert_eq!(maxes[2], 0.2);
    }

    #[test]
    fn test_max_scores_length_mismatch() {
        let err = calculate_max_scores(&[0.1, 0.2, 0.3], 2, 2).unwrap_err();
        assert!(matches!(err, DroneAidError::ShapeMismatch { what: "scores", .. }));
    }

    #[test]
    fn test_iou_values() {
        let a = [0.0, 0.0, 10.0, 10.0];
        let b = [5.0, 5.0, 15.0, 15.0];
        assert!((iou(&a, &b) - 25.0 / 175.0).abs() < 1e-9);
        assert_eq!(iou(&a, &a), 1.0);
        assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
        // flipped corners describe the same box
        assert_eq!(iou(&a, &[10.0, 10.0, 0.0, 0.0]), 1.0);
        // degenerate box
        assert_eq!(iou(&a, &[1.0, 1.0, 1.0, 5.0]), 0.0);
    }

    #[test]
    fn test_round_coord() {
        assert_eq!(round_coord(-0.00005), 0.0);
        assert_eq!(round_coord(0.123456), 0.1235);
        assert_eq!(round_coord(-0.3), 0.0);
        assert_eq!(round_coord(0.5), 0.5);
        assert!(round_coord(-0.00001).is_sign_positive());
    }

    #[test]
    fn test_overlapping_lower_score_suppressed() {
        let boxes = boxes3(&[[0.0, 0.0, 0.5, 0.5], [0.05, 0.05, 0.5, 0.5]]);
        let scores = one_hot(2, &[(0, 0.9), (0, 0.8)]);

        let dets = postprocess(&scores, boxes.view(), 2, 2, &PostprocessOptions::default()).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].score, 0.9);
    }

    #[test]
    fn test_overlap_at_threshold_is_kept() {
        // IoU exactly 0.5: a 2x1 box against its 1x1 half
        let boxes = [[0.0, 0.0, 1.0, 2.0], [0.0, 0.0, 1.0, 1.0]];
        assert_eq!(iou(&boxes[0], &boxes[1]), 0.5);
        let kept = non_max_suppression(&boxes, &[0.9, 0.8], 10, 0.5, 0.3);
        assert_eq!(kept, vec![0, 1]);
    }

    #[test]
    fn test_output_capped_at_max_num_boxes() {
        let list: Vec<[f32; 4]> = (0..20)
            .map(|i| {
                let y = i as f32 * 0.05;
                [y, 0.0, y + 0.04, 0.04]
            })
            .collect();
        let scores: Vec<f32> = (0..20).map(|i| 0.5 + i as f32 * 0.01).collect();

        let dets = postprocess(&scores, boxes3(&list).view(), 20, 1, &PostprocessOptions::default())
            .unwrap();
        assert_eq!(dets.len(), 10);
        assert_eq!(dets[0].score, scores[19]);
        assert!(dets.windows(2).all(|w| w[0].score > w[1].score));
    }

    #[test]
    fn test_zero_max_boxes_returns_nothing() {
        let boxes = boxes3(&[[0.0, 0.0, 0.5, 0.5]]);
        let opts = PostprocessOptions::default().with_max_num_boxes(0);
        let dets = postprocess(&[0.9], boxes.view(), 1, 1, &opts).unwrap();
        assert!(dets.is_empty());
    }

    #[test]
    fn test_equal_scores_prefer_lower_index() {
        let boxes = [
            [0.6, 0.6, 0.9, 0.9],
            [0.0, 0.0, 0.5, 0.5],
            [0.0, 0.0, 0.5, 0.5],
        ];
        let kept = non_max_suppression(&boxes, &[0.4, 0.7, 0.7], 10, 0.5, 0.3);
        assert_eq!(kept, vec![1, 0]);
    }

    #[test]
    fn test_classless_box_never_selected() {
        let boxes = boxes3(&[[0.0, 0.0, 0.5, 0.5], [0.6, 0.6, 0.9, 0.9]]);
        let scores = vec![0.0, 0.0, 0.0, 0.8];

        let dets = postprocess(&scores, boxes.view(), 2, 2, &PostprocessOptions::default()).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_index, 1);

        let permissive = PostprocessOptions::default().with_score_threshold(-1.0);
        let dets = postprocess(&scores, boxes.view(), 2, 2, &permissive).unwrap();
        assert!(dets.iter().all(|d| d.class_index >= 0));
    }

    #[test]
    fn test_two_disjoint_boxes_end_to_end() {
        let boxes = boxes3(&[[0.1, 0.1, 0.3, 0.3], [0.6, 0.6, 0.8, 0.8]]);
        let scores = one_hot(8, &[(0, 0.9), (1, 0.3)]);

        let dets = postprocess(&scores, boxes.view(), 2, 8, &PostprocessOptions::default()).unwrap();
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].label, "children");
        assert_eq!(dets[0].class_index, 0);
        assert_eq!(dets[0].score, 0.9);
        assert_eq!(dets[1].label, "ok");
        assert_eq!(dets[1].class_index, 1);
        assert_eq!(dets[1].bbox, [0.6, 0.6, 0.8, 0.8]);
    }

    #[test]
    fn test_bbox_rounded_and_clamped() {
        let boxes = boxes3(&[[-0.00005, 0.123456, 0.5, 0.6]]);
        let dets = postprocess(&[0.9], boxes.view(), 1, 1, &PostprocessOptions::default()).unwrap();
        assert_eq!(dets[0].bbox, [0.0, 0.1235, 0.5, 0.6]);
    }

    #[test]
    fn test_postprocess_is_deterministic() {
        let list: Vec<[f32; 4]> = (0..12)
            .map(|i| {
                let o = (i % 4) as f32 * 0.02;
                [o, o, 0.4 + o, 0.4 + o]
            })
            .collect();
        let scores: Vec<f32> = (0..12 * 3).map(|k| ((k * 37) % 100) as f32 / 100.0).collect();
        let boxes = boxes3(&list);

        let first = postprocess(&scores, boxes.view(), 12, 3, &PostprocessOptions::default()).unwrap();
        let second = postprocess(&scores, boxes.view(), 12, 3, &PostprocessOptions::default()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_box_shape_mismatch() {
        let boxes = boxes3(&[[0.0, 0.0, 0.5, 0.5]]);
        let err = postprocess(&[0.9, 0.8], boxes.view(), 2, 1, &PostprocessOptions::default())
            .unwrap_err();
        assert!(matches!(err, DroneAidError::ShapeMismatch { what: "boxes", .. }));
    }

    #[test]
    fn test_invalid_options_fail_before_work() {
        let boxes = boxes3(&[[0.0, 0.0, 0.5, 0.5]]);
        let opts = PostprocessOptions::default().with_iou_threshold(-0.1);
        let err = postprocess(&[0.9], boxes.view(), 1, 1, &opts).unwrap_err();
        assert!(matches!(err, DroneAidError::InvalidOption { .. }));
    }

    #[test]
    fn test_raw_outputs_drop_batch_axis() {
        let raw = RawOutputs {
            scores: ArrayD::from_shape_vec(IxDyn(&[1, 2, 2]), vec![0.9, 0.1, 0.2, 0.7]).unwrap(),
            boxes: ArrayD::from_shape_vec(
                IxDyn(&[1, 2, 1, 4]),
                vec![0.0, 0.0, 0.2, 0.2, 0.5, 0.5, 0.9, 0.9],
            )
            .unwrap(),
        };
        let dets = process_raw_outputs(&raw, &PostprocessOptions::default()).unwrap();
        assert_eq!(dets.len(), 2);
        assert_eq!((dets[0].label.as_str(), dets[1].label.as_str()), ("children", "ok"));
        assert_eq!(dets[1].bbox, [0.5, 0.5, 0.9, 0.9]);
    }

    #[test]
    fn test_raw_outputs_bad_rank() {
        let raw = RawOutputs {
            scores: ArrayD::zeros(IxDyn(&[2, 2])),
            boxes: ArrayD::zeros(IxDyn(&[1, 2, 1, 4])),
        };
        assert!(matches!(
            process_raw_outputs(&raw, &PostprocessOptions::default()),
            Err(DroneAidError::ShapeMismatch { what: "scores tensor", .. })
        ));

        let raw = RawOutputs {
            scores: ArrayD::zeros(IxDyn(&[1, 2, 2])),
            boxes: ArrayD::zeros(IxDyn(&[2, 2, 1, 4])),
        };
        assert!(matches!(
            process_raw_outputs(&raw, &PostprocessOptions::default()),
            Err(DroneAidError::ShapeMismatch { what: "boxes tensor", .. })
        ));
    }
}
