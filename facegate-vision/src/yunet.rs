//! YuNet output decoding.
//!
//! The 2023mar model emits twelve tensors, four kinds for each of the strides
//! 8, 16 and 32, in the order `cls_*`, `obj_*`, `bbox_*`, `kps_*`. Every row of
//! a tensor belongs to one grid cell of the `input / stride` square grid.
//!
//! Decoding per cell `(row, col)` at `stride`:
//! - score = sqrt(clamp(cls) * clamp(obj))
//! - center = (col + dx, row + dy) * stride
//! - size = (exp(dw), exp(dh)) * stride
//! - landmark k = (col + lx_k, row + ly_k) * stride

use anyhow::Result;
use ndarray::{Array2, ArrayView2};

pub const STRIDES: [usize; 3] = [8, 16, 32];

#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub bbox: [f32; 4], // x, y, w, h in input-canvas pixels
    pub score: f32,
    pub landmarks: [f32; 10],
}

/// Per-stride tensors, one row per grid cell.
#[derive(Debug)]
pub struct ScaleOutputs {
    pub stride: usize,
    pub scores: Array2<f32>,
    pub boxes: Array2<f32>,
    pub landmarks: Array2<f32>,
}

/// Group the flat model outputs by stride, checking every shape on the way.
pub fn parse_outputs(outputs: &[(&[i64], &[f32])], input_size: usize) -> Result<Vec<ScaleOutputs>> {
    if outputs.len() < 12 {
        anyhow::bail!("expected 12 YuNet outputs, got {}", outputs.len());
    }
    let mut scales = Vec::with_capacity(STRIDES.len());
    for (i, &stride) in STRIDES.iter().enumerate() {
        let cells = (input_size / stride) * (input_size / stride);
        let cls = tensor(outputs[i], cells, 1, "cls")?;
        let obj = tensor(outputs[i + 3], cells, 1, "obj")?;
        let scores = (&cls.mapv(unit) * &obj.mapv(unit)).mapv(f32::sqrt);
        scales.push(ScaleOutputs {
            stride,
            scores,
            boxes: tensor(outputs[i + 6], cells, 4, "bbox")?,
            landmarks: tensor(outputs[i + 9], cells, 10, "kps")?,
        });
    }
    Ok(scales)
}

fn tensor(output: (&[i64], &[f32]), rows: usize, cols: usize, kind: &str) -> Result<Array2<f32>> {
    let (shape, data) = output;
    if shape != [1, rows as i64, cols as i64] {
        anyhow::bail!("unexpected {kind} shape {shape:?}, expected [1, {rows}, {cols}]");
    }
    Ok(ArrayView2::from_shape((rows, cols), data)?.to_owned())
}

fn unit(v: f32) -> f32 {
    v.clamp(0.0, 1.0)
}

/// Turn grid predictions above `score_threshold` into boxes on the input canvas.
pub fn decode(scales: &[ScaleOutputs], score_threshold: f32, input_size: usize) -> Vec<RawDetection> {
    let mut detections = Vec::new();
    for scale in scales {
        let grid = input_size / scale.stride;
        let stride = scale.stride as f32;
        for (idx, &score) in scale.scores.column(0).iter().enumerate() {
            if score < score_threshold {
                continue;
            }
            let row = (idx / grid) as f32;
            let col = (idx % grid) as f32;
            let b = scale.boxes.row(idx);
            let cx = (col + b[0]) * stride;
            let cy = (row + b[1]) * stride;
            let w = b[2].exp() * stride;
            let h = b[3].exp() * stride;

            let lm = scale.landmarks.row(idx);
            let mut landmarks = [0.0f32; 10];
            for k in 0..5 {
                landmarks[k * 2] = (col + lm[k * 2]) * stride;
                landmarks[k * 2 + 1] = (row + lm[k * 2 + 1]) * stride;
            }

            detections.push(RawDetection {
                bbox: [cx - w / 2.0, cy - h / 2.0, w, h],
                score,
                landmarks,
            });
        }
    }
    detections
}
