use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage, GenericImageView, RgbImage};
use ndarray::Array4;
use ort::{session::Session, value::Tensor};

use crate::encoder::{Encoding, FaceDetector, FaceRecognizer};
use crate::yunet;

/// Canvas side the YuNet model was exported with.
pub const DETECTOR_INPUT: u32 = 640;
/// SFace input side.
pub const RECOGNIZER_INPUT: u32 = 112;

/// A face found by the detector, in the pixel space of the image it ran on.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: [f32; 4], // x, y, w, h
    pub score: f32,
    pub landmarks: [f32; 10], // eyes, nose tip, mouth corners
}

impl Detection {
    /// Map coordinates found on a resized image back by `factor`.
    /// Map into an image `fx` times as wide and `fy` times as tall. Box and
    /// landmarks both alternate x and y.
    pub fn rescaled(&self, fx: f32, fy: f32) -> Self {
        let mut scaled = self.clone();
        let axes = scaled.bbox.iter_mut().chain(scaled.landmarks.iter_mut());
        for (i, v) in axes.enumerate() {
            *v *= if i % 2 == 0 { fx } else { fy };
        }
        scaled
    }

    pub fn width(&self) -> f32 {
        self.bbox[2]
    }

    pub fn height(&self) -> f32 {
        self.bbox[3]
    }
}

/// Greedy non-maximum suppression, highest score first.
pub fn nms(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
    let mut sorted = detections.to_vec();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Detection> = Vec::new();
    for candidate in sorted {
        if keep
            .iter()
            .all(|kept| compute_iou(&kept.bbox, &candidate.bbox) <= iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

pub fn compute_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = (a[0] + a[2]).min(b[0] + b[2]);
    let y2 = (a[1] + a[3]).min(b[1] + b[3]);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let inter = (x2 - x1) * (y2 - y1);
    inter / (a[2] * a[3] + b[2] * b[3] - inter)
}

/// Planar BGR float tensor `[1, 3, h, w]`, the layout both OpenCV zoo models take.
fn bgr_tensor(img: &RgbImage) -> Result<Tensor<f32>> {
    let (w, h) = img.dimensions();
    let plane = (w * h) as usize;
    let mut data = vec![0.0f32; 3 * plane];
    for (i, px) in img.pixels().enumerate() {
        data[i] = px[2] as f32;
        data[plane + i] = px[1] as f32;
        data[2 * plane + i] = px[0] as f32;
    }
    let array = Array4::from_shape_vec((1, 3, h as usize, w as usize), data)?;
    Ok(Tensor::from_array(array)?)
}

/// YuNet detector running on a letterboxed square canvas.
pub struct OnnxDetector {
    session: Session,
    score_threshold: f32,
    nms_threshold: f32,
}

impl OnnxDetector {
    pub fn new(session: Session, score_threshold: f32, nms_threshold: f32) -> Self {
        Self {
            session,
            score_threshold,
            nms_threshold,
        }
    }
}

impl FaceDetector for OnnxDetector {
    fn detect(&mut self, img: &DynamicImage) -> Result<Vec<Detection>> {
        let (width, height) = img.dimensions();
        let scale = DETECTOR_INPUT as f32 / width.max(height) as f32;
        let new_w = ((width as f32 * scale) as u32).max(1);
        let new_h = ((height as f32 * scale) as u32).max(1);
        let offset_x = (DETECTOR_INPUT - new_w.min(DETECTOR_INPUT)) / 2;
        let offset_y = (DETECTOR_INPUT - new_h.min(DETECTOR_INPUT)) / 2;

        let resized = img.resize_exact(new_w, new_h, FilterType::Triangle);
        let mut canvas = DynamicImage::new_rgb8(DETECTOR_INPUT, DETECTOR_INPUT);
        image::imageops::overlay(&mut canvas, &resized, offset_x as i64, offset_y as i64);

        let input = bgr_tensor(&canvas.to_rgb8())?;
        let outputs = self.session.run(ort::inputs![input])?;

        let mut owned: Vec<(Vec<i64>, Vec<f32>)> = Vec::new();
        for (_name, output) in outputs.iter() {
            let (shape, data) = output.try_extract_tensor::<f32>()?;
            owned.push((shape.iter().copied().collect(), data.to_vec()));
        }
        let refs: Vec<(&[i64], &[f32])> = owned
            .iter()
            .map(|(s, d)| (s.as_slice(), d.as_slice()))
            .collect();

        let scales = yunet::parse_outputs(&refs, DETECTOR_INPUT as usize)
            .context("parsing detector outputs")?;
        let unletterbox = |v: f32, offset: u32| (v - offset as f32) / scale;

        let detections: Vec<Detection> =
            yunet::decode(&scales, self.score_threshold, DETECTOR_INPUT as usize)
                .into_iter()
                .map(|raw| {
                    let mut landmarks = raw.landmarks;
                    for point in landmarks.chunks_exact_mut(2) {
                        point[0] = unletterbox(point[0], offset_x);
                        point[1] = unletterbox(point[1], offset_y);
                    }
                    Detection {
                        bbox: [
                            unletterbox(raw.bbox[0], offset_x),
                            unletterbox(raw.bbox[1], offset_y),
                            raw.bbox[2] / scale,
                            raw.bbox[3] / scale,
                        ],
                        score: raw.score,
                        landmarks,
                    }
                })
                .collect();

        Ok(nms(&detections, self.nms_threshold))
    }
}

/// Warp the face so both eyes land on the ArcFace reference positions.
pub fn align_face(img: &DynamicImage, detection: &Detection, size: u32) -> RgbImage {
    const REF_LEFT_EYE: (f32, f32) = (38.2946, 51.6963);
    const REF_RIGHT_EYE: (f32, f32) = (73.5318, 51.5014);

    let unit = size as f32 / 112.0;
    let left = (detection.landmarks[0], detection.landmarks[1]);
    let right = (detection.landmarks[2], detection.landmarks[3]);

    let (dx, dy) = (right.0 - left.0, right.1 - left.1);
    let ref_dist = (REF_RIGHT_EYE.0 - REF_LEFT_EYE.0).hypot(REF_RIGHT_EYE.1 - REF_LEFT_EYE.1);
    let eye_dist = dx.hypot(dy).max(f32::EPSILON);
    let scale = unit * ref_dist / eye_dist;
    let (sin, cos) = dy.atan2(dx).sin_cos();

    // Forward map: out = R(scale, -angle) * in + t
    let (a, b, c, d) = (scale * cos, scale * sin, -scale * sin, scale * cos);
    let center = ((left.0 + right.0) / 2.0, (left.1 + right.1) / 2.0);
    let ref_center = (
        (REF_LEFT_EYE.0 + REF_RIGHT_EYE.0) / 2.0 * unit,
        (REF_LEFT_EYE.1 + REF_RIGHT_EYE.1) / 2.0 * unit,
    );
    let tx = ref_center.0 - (a * center.0 + b * center.1);
    let ty = ref_center.1 - (c * center.0 + d * center.1);
    let det = a * d - b * c;

    let src = img.to_rgb8();
    let (w, h) = src.dimensions();
    let mut out = RgbImage::new(size, size);
    for (ox, oy, px) in out.enumerate_pixels_mut() {
        let (px_x, px_y) = (ox as f32 - tx, oy as f32 - ty);
        let sx = (d * px_x - b * px_y) / det;
        let sy = (-c * px_x + a * px_y) / det;
        if sx < 0.0 || sy < 0.0 || sx >= (w - 1) as f32 || sy >= (h - 1) as f32 {
            continue;
        }
        let (x0, y0) = (sx.floor() as u32, sy.floor() as u32);
        let (fx, fy) = (sx - x0 as f32, sy - y0 as f32);
        let p = |x, y| src.get_pixel(x, y).0;
        let (p00, p10, p01, p11) = (p(x0, y0), p(x0 + 1, y0), p(x0, y0 + 1), p(x0 + 1, y0 + 1));
        for ch in 0..3 {
            let top = p00[ch] as f32 * (1.0 - fx) + p10[ch] as f32 * fx;
            let bottom = p01[ch] as f32 * (1.0 - fx) + p11[ch] as f32 * fx;
            px.0[ch] = (top * (1.0 - fy) + bottom * fy).round() as u8;
        }
    }
    out
}

/// SFace recognizer producing L2-normalized encodings.
pub struct OnnxRecognizer {
    session: Session,
}

impl OnnxRecognizer {
    pub fn new(session: Session) -> Self {
        Self { session }
    }
}

impl FaceRecognizer for OnnxRecognizer {
    fn encode(&mut self, img: &DynamicImage, face: &Detection) -> Result<Encoding> {
        let aligned = align_face(img, face, RECOGNIZER_INPUT);
        let input = bgr_tensor(&aligned)?;
        let outputs = self.session.run(ort::inputs![input])?;
        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;

        let len = if shape.len() == 2 {
            shape[1] as usize
        } else {
            data.len()
        };
        if len == 0 || len > data.len() {
            anyhow::bail!("recognizer returned shape {:?}", shape.iter().collect::<Vec<_>>());
        }
        Ok(Encoding::new(data[..len].to_vec()).normalized())
    }
}
