use anyhow::Result;
use facegate_vision::face::{nms, Detection};
use facegate_vision::yunet::{decode, parse_outputs, STRIDES};

const INPUT: usize = 640;

/// Flat model outputs in the order YuNet emits them, all zero.
fn blank_outputs() -> Vec<(Vec<i64>, Vec<f32>)> {
    let mut outputs = Vec::new();
    for cols in [1usize, 1, 4, 10] {
        for stride in STRIDES {
            let cells = (INPUT / stride) * (INPUT / stride);
            outputs.push((
                vec![1, cells as i64, cols as i64],
                vec![0.0; cells * cols],
            ));
        }
    }
    outputs
}

fn borrowed(outputs: &[(Vec<i64>, Vec<f32>)]) -> Vec<(&[i64], &[f32])> {
    outputs
        .iter()
        .map(|(shape, data)| (shape.as_slice(), data.as_slice()))
        .collect()
}

/// Light up cell `idx` of the stride-16 grid with a `size`-pixel box.
fn set_face(outputs: &mut [(Vec<i64>, Vec<f32>)], idx: usize, score: f32, size: f32) {
    // cls, obj, bbox for stride 16 sit at 1, 4 and 7
    outputs[1].1[idx] = score;
    outputs[4].1[idx] = score;
    let bbox = &mut outputs[7].1[idx * 4..idx * 4 + 4];
    bbox[2] = (size / 16.0).ln();
    bbox[3] = (size / 16.0).ln();
}

fn to_detections(raw: Vec<facegate_vision::yunet::RawDetection>) -> Vec<Detection> {
    raw.into_iter()
        .map(|r| Detection {
            bbox: r.bbox,
            score: r.score,
            landmarks: r.landmarks,
        })
        .collect()
}

#[test]
fn blank_outputs_decode_to_nothing() -> Result<()> {
    env_logger::try_init().ok();
    let outputs = blank_outputs();
    let scales = parse_outputs(&borrowed(&outputs), INPUT)?;
    assert_eq!(scales.len(), 3);
    assert!(decode(&scales, 0.6, INPUT).is_empty());
    Ok(())
}

#[test]
fn neighbouring_cells_collapse_to_one_face() -> Result<()> {
    let mut outputs = blank_outputs();
    // 40x40 grid at stride 16: two adjacent cells describing the same face
    set_face(&mut outputs, 20 * 40 + 20, 0.9, 128.0);
    set_face(&mut outputs, 20 * 40 + 21, 0.8, 128.0);
    // and one far away
    set_face(&mut outputs, 5 * 40 + 5, 0.7, 64.0);

    let scales = parse_outputs(&borrowed(&outputs), INPUT)?;
    let faces = nms(&to_detections(decode(&scales, 0.6, INPUT)), 0.3);
    assert_eq!(faces.len(), 2);
    assert!((faces[0].score - 0.9).abs() < 1e-6);
    assert!((faces[0].width() - 128.0).abs() < 1e-2);
    // center of cell (20, 20) is (320, 320)
    assert!((faces[0].bbox[0] - 256.0).abs() < 1e-2);
    assert!((faces[1].width() - 64.0).abs() < 1e-2);
    Ok(())
}

#[test]
fn missing_outputs_are_rejected() {
    let outputs = blank_outputs();
    let short = borrowed(&outputs[..11]);
    assert!(parse_outputs(&short, INPUT).is_err());
}

#[test]
fn wrong_input_size_is_rejected() {
    let outputs = blank_outputs();
    assert!(parse_outputs(&borrowed(&outputs), 320).is_err());
}
