use std::cmp::Reverse;
use std::collections::BTreeMap;

use ndarray::{Array1, ArrayD, ArrayView1, Axis, Ix3};
use ordered_float::OrderedFloat;

/// Applies softmax to a 1D array and returns a new Array1<f32>.
pub fn softmax(slice: ArrayView1<f32>) -> Array1<f32> {
    let max_val = slice.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Array1<f32> = slice.mapv(|x| (x - max_val).exp());
    let sum_exp: f32 = exp_vals.sum();
    exp_vals.mapv(|v| v / sum_exp)
}

/// Index and value of the largest element; the first one wins ties.
pub fn argmax_and_max(values: ArrayView1<f32>) -> (usize, f32) {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(max_idx, max_val), (i, &val)| {
            if val > max_val { (i, val) } else { (max_idx, max_val) }
        })
}

/// True when every score already reads as a probability. The sum is not
/// checked: exported probabilities are reported as they are.
pub fn is_probability_vector(values: ArrayView1<f32>) -> bool {
    values.iter().all(|v| (0.0..=1.0).contains(v))
}

/// A detector box before labels are attached, in `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub class_index: usize,
}

/// Decodes a raw YOLO head, `[1, 4 + nc, anchors]` or `[1, anchors, 4 + nc]`,
/// into candidates whose best class score clears `threshold`.
pub fn decode_yolo(output: &ArrayD<f32>, threshold: f32) -> Result<Vec<Candidate>, String> {
    let output = output
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|_| format!("expected a 3D detector output, got shape {:?}", output.shape()))?;
    let prediction = output.index_axis(Axis(0), 0);

    // The anchor axis is the long one
    let rows = if prediction.shape()[0] < prediction.shape()[1] {
        prediction.reversed_axes()
    } else {
        prediction
    };
    if rows.shape()[1] <= 4 {
        return Err(format!("detector output has no class scores, shape {:?}", output.shape()));
    }

    let mut candidates = Vec::new();
    for row in rows.axis_iter(Axis(0)) {
        let scores = row.slice(ndarray::s![4..]);
        let (class_index, confidence) = argmax_and_max(scores);
        if !(confidence >= threshold) {
            continue;
        }
        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        candidates.push(Candidate {
            bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
            confidence,
            class_index,
        });
    }
    Ok(candidates)
}

/// Compute the Intersection over Union (IoU) of two boxes in corner format.
pub fn compute_iou(b1: &[f32; 4], b2: &[f32; 4]) -> f32 {
    let (x1_1, y1_1, x2_1, y2_1) = (b1[0], b1[1], b1[2], b1[3]);
    let (x1_2, y1_2, x2_2, y2_2) = (b2[0], b2[1], b2[2], b2[3]);

    let inter_x1 = x1_1.max(x1_2);
    let inter_y1 = y1_1.max(y1_2);
    let inter_x2 = x2_1.min(x2_2);
    let inter_y2 = y2_1.min(y2_2);

    let inter_area = ((inter_x2 - inter_x1).max(0.0)) * ((inter_y2 - inter_y1).max(0.0));
    let area1 = (x2_1 - x1_1).max(0.0) * (y2_1 - y1_1).max(0.0);
    let area2 = (x2_2 - x1_2).max(0.0) * (y2_2 - y1_2).max(0.0);
    let union_area = area1 + area2 - inter_area;
    if union_area <= 0.0 { 0.0 } else { inter_area / union_area }
}

/// Orders candidates by descending confidence, then ascending class index.
pub fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by_key(|c| (Reverse(OrderedFloat(c.confidence)), c.class_index));
}

/// Per-class non-maximum suppression. The survivors come back in
/// `sort_candidates` order.
pub fn non_maximum_suppression(candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    // Group indices by class id.
    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, candidate) in candidates.iter().enumerate() {
        by_class.entry(candidate.class_index).or_default().push(i);
    }

    let mut keep_indices: Vec<usize> = Vec::new();

    for indices in by_class.values_mut() {
        indices.sort_by_key(|&i| Reverse(OrderedFloat(candidates[i].confidence)));

        let mut suppressed = vec![false; indices.len()];
        for i in 0..indices.len() {
            if suppressed[i] {
                continue;
            }
            let idx_i = indices[i];
            keep_indices.push(idx_i);
            for j in (i + 1)..indices.len() {
                if suppressed[j] {
                    continue;
                }
                let iou = compute_iou(&candidates[idx_i].bbox, &candidates[indices[j]].bbox);
                if iou > iou_threshold {
                    suppressed[j] = true;
                }
            }
        }
    }

    keep_indices.sort_unstable();
    let mut kept: Vec<Candidate> = keep_indices.into_iter().map(|i| candidates[i].clone()).collect();
    sort_candidates(&mut kept);
    kept
}
