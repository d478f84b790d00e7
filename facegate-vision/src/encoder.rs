use std::path::Path;

use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::face::{Detection, OnnxDetector, OnnxRecognizer};
use crate::frame::Frame;
use crate::model;

/// Length of an SFace encoding.
pub const ENCODING_DIM: usize = 128;

/// Fixed-length face descriptor compared instead of raw images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encoding(Array1<f32>);

impl Encoding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(Array1::from(values))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &Array1<f32> {
        &self.0
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }

    /// Scale to unit L2 norm; the zero vector is returned unchanged.
    pub fn normalized(self) -> Self {
        let norm = self.0.dot(&self.0).sqrt();
        if norm > 0.0 {
            Self(self.0 / norm)
        } else {
            self
        }
    }
}

/// What one frame yielded.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeOutcome {
    Found(Encoding),
    /// Also reported when the only face is smaller than the configured
    /// minimum at full resolution (subject too far away).
    NoFaceDetected,
    MultipleFacesDetected,
    EncodingFailed,
}

/// Frame in, face encoding (or the reason there is none) out.
///
/// Implementations must be deterministic for a given frame.
pub trait FaceEncoder: Send {
    fn detect_and_encode(&mut self, frame: &Frame) -> EncodeOutcome;
}

/// First pass: locate faces. Coordinates are in the pixel space of `img`.
pub trait FaceDetector: Send {
    fn detect(&mut self, img: &DynamicImage) -> Result<Vec<Detection>>;
}

/// Second pass: encode the face at `face` inside the full-resolution `img`.
pub trait FaceRecognizer: Send {
    fn encode(&mut self, img: &DynamicImage, face: &Detection) -> Result<Encoding>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderSettings {
    /// Factor applied to the frame before detection, in `(0, 1]`.
    pub detection_scale: f32,
    pub score_threshold: f32,
    pub nms_threshold: f32,
    /// Minimum face width and height in full-resolution pixels.
    pub min_face_size: u32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            detection_scale: 0.5,
            score_threshold: 0.6,
            nms_threshold: 0.3,
            min_face_size: 60,
        }
    }
}

/// Cheap detection on a downscaled copy, expensive encoding only when exactly
/// one face was found.
pub struct TwoPassEncoder<D, R> {
    detector: D,
    recognizer: R,
    settings: EncoderSettings,
}

pub type OnnxFaceEncoder = TwoPassEncoder<OnnxDetector, OnnxRecognizer>;

impl<D: FaceDetector, R: FaceRecognizer> TwoPassEncoder<D, R> {
    pub fn new(detector: D, recognizer: R, settings: EncoderSettings) -> Self {
        Self {
            detector,
            recognizer,
            settings,
        }
    }

    fn locate(&mut self, full: &DynamicImage) -> Result<Vec<Detection>> {
        let scale = self.settings.detection_scale;
        if scale >= 1.0 {
            return self.detector.detect(full);
        }
        let w = ((full.width() as f32 * scale).round() as u32).max(1);
        let h = ((full.height() as f32 * scale).round() as u32).max(1);
        let small = full.resize_exact(w, h, FilterType::Triangle);
        // Rounding can differ per axis, so map each one back on its own
        let back_x = full.width() as f32 / w as f32;
        let back_y = full.height() as f32 / h as f32;
        Ok(self
            .detector
            .detect(&small)?
            .into_iter()
            .map(|d| d.rescaled(back_x, back_y))
            .collect())
    }
}

impl OnnxFaceEncoder {
    pub fn from_models(detector: &Path, recognizer: &Path, settings: EncoderSettings) -> Result<Self> {
        let detector = OnnxDetector::new(
            model::detector_session(detector)?,
            settings.score_threshold,
            settings.nms_threshold,
        );
        let recognizer = OnnxRecognizer::new(model::recognizer_session(recognizer)?);
        Ok(Self::new(detector, recognizer, settings))
    }
}

impl<D: FaceDetector, R: FaceRecognizer> FaceEncoder for TwoPassEncoder<D, R> {
    fn detect_and_encode(&mut self, frame: &Frame) -> EncodeOutcome {
        let full = frame.to_dynamic();
        let faces = match self.locate(&full).context("detection pass") {
            Ok(faces) => faces,
            Err(e) => {
                log::warn!("frame {}: {:#}", frame.sequence, e);
                return EncodeOutcome::EncodingFailed;
            }
        };

        let face = match faces.as_slice() {
            [] => return EncodeOutcome::NoFaceDetected,
            [face] => face,
            many => {
                log::debug!("frame {}: {} faces in view", frame.sequence, many.len());
                return EncodeOutcome::MultipleFacesDetected;
            }
        };

        let min = self.settings.min_face_size as f32;
        if face.width() < min || face.height() < min {
            log::debug!(
                "frame {}: face {:.0}x{:.0} below minimum {}",
                frame.sequence,
                face.width(),
                face.height(),
                min
            );
            return EncodeOutcome::NoFaceDetected;
        }

        match self.recognizer.encode(&full, face) {
            Ok(encoding) if encoding.is_finite() && !encoding.is_empty() => {
                EncodeOutcome::Found(encoding)
            }
            Ok(_) => EncodeOutcome::EncodingFailed,
            Err(e) => {
                log::warn!("frame {}: encoding pass: {:#}", frame.sequence, e);
                EncodeOutcome::EncodingFailed
            }
        }
    }
}
