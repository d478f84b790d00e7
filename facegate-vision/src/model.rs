use std::path::Path;

use anyhow::{Context, Result};
#[allow(unused_imports)]
use ort::{
    ep::{self, ExecutionProvider},
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
};

pub fn session_builder() -> Result<SessionBuilder> {
    #[allow(unused_mut)]
    let mut builder =
        Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    #[cfg(feature = "openvino")]
    {
        let ep = ep::OpenVINO::default();
        if ep.is_available()? {
            ep.register(&mut builder)?;
        } else {
            log::warn!("openvino feature is enabled, onnx runtime not compiled with openvino")
        }
    }

    #[cfg(feature = "cuda")]
    {
        let ep = ep::CUDA::default();
        if ep.is_available()? {
            ep.register(&mut builder)?;
        } else {
            log::warn!("cuda feature is enabled, onnx runtime not compiled with cuda")
        }
    }

    Ok(builder)
}

/// YuNet face detector.
pub fn detector_session(path: &Path) -> Result<Session> {
    load(path).context("load detector model")
}

/// SFace recognizer producing 128-d embeddings.
pub fn recognizer_session(path: &Path) -> Result<Session> {
    load(path).context("load recognition model")
}

fn load(path: &Path) -> Result<Session> {
    if !path.exists() {
        anyhow::bail!("model file {} not found", path.display());
    }
    session_builder()?
        .commit_from_file(path)
        .with_context(|| format!("committing session from {}", path.display()))
}
