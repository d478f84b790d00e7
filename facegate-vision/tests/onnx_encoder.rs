use std::path::PathBuf;

use anyhow::Result;
use facegate_vision::{EncodeOutcome, EncoderSettings, FaceEncoder, Frame, OnnxFaceEncoder};

/// Model paths from the environment. Tests needing the real models are
/// skipped when these are unset.
fn model_paths() -> Option<(PathBuf, PathBuf)> {
    let detector = std::env::var_os("FACEGATE_DETECTOR_MODEL")?;
    let recognizer = std::env::var_os("FACEGATE_RECOGNIZER_MODEL")?;
    Some((detector.into(), recognizer.into()))
}

#[test]
fn missing_model_files_fail_to_load() {
    let dir = missing_model_dir();
    let result = OnnxFaceEncoder::from_models(
        &dir.join("yunet.onnx"),
        &dir.join("sface.onnx"),
        EncoderSettings::default(),
    );
    let err = result.err().map(|e| format!("{e:#}")).unwrap_or_default();
    assert!(err.contains("not found"), "{err}");
}

#[test]
fn blank_frame_has_no_face() -> Result<()> {
    env_logger::try_init().ok();
    let Some((detector, recognizer)) = model_paths() else {
        println!("FACEGATE_DETECTOR_MODEL/FACEGATE_RECOGNIZER_MODEL unset, skipping");
        return Ok(());
    };
    let mut encoder = OnnxFaceEncoder::from_models(&detector, &recognizer, EncoderSettings::default())?;
    let frame = Frame::new(image::RgbImage::new(640, 480), 1);
    assert_eq!(encoder.detect_and_encode(&frame), EncodeOutcome::NoFaceDetected);
    // Same frame, same answer
    assert_eq!(encoder.detect_and_encode(&frame), EncodeOutcome::NoFaceDetected);
    Ok(())
}

#[test]
fn face_image_encodes_deterministically() -> Result<()> {
    let Some((detector, recognizer)) = model_paths() else {
        return Ok(());
    };
    let Some(face) = std::env::var_os("FACEGATE_FACE_IMAGE") else {
        println!("FACEGATE_FACE_IMAGE unset, skipping");
        return Ok(());
    };
    let mut encoder = OnnxFaceEncoder::from_models(&detector, &recognizer, EncoderSettings::default())?;
    let frame = Frame::new(image::open(face)?.to_rgb8(), 1);

    let first = encoder.detect_and_encode(&frame);
    let EncodeOutcome::Found(encoding) = &first else {
        panic!("expected a face, got {first:?}");
    };
    assert_eq!(encoding.len(), facegate_vision::ENCODING_DIM);
    assert_eq!(encoder.detect_and_encode(&frame), first);
    Ok(())
}

fn missing_model_dir() -> PathBuf {
    std::env::temp_dir().join(format!("facegate-vision-missing-{}", std::process::id()))
}
