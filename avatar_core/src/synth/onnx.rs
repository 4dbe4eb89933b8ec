//! ONNX Runtime backend.

use std::path::Path;

use anyhow::Context;
use ndarray::{ArrayD, ArrayView4};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tracing::info;

use super::model::InferenceBackend;

pub struct OnnxBackend {
    session: Session,
    input_names: [String; 2],
    output_name: String,
}

impl OnnxBackend {
    pub fn load(path: &Path, intra_threads: usize) -> anyhow::Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads.max(1))?
            .commit_from_file(path)
            .with_context(|| format!("failed to load onnx model from {}", path.display()))?;

        if session.inputs.len() != 2 {
            anyhow::bail!(
                "expected a two-input graph, {} declares {}",
                path.display(),
                session.inputs.len()
            );
        }
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .context("graph declares no outputs")?;
        let input_names = [session.inputs[0].name.clone(), session.inputs[1].name.clone()];

        info!(
            path = %path.display(),
            inputs = ?input_names,
            output = %output_name,
            "loaded onnx model"
        );
        Ok(Self { session, input_names, output_name })
    }
}

impl InferenceBackend for OnnxBackend {
    fn name(&self) -> &str {
        "onnx"
    }

    fn run(
        &self,
        first: ArrayView4<'_, f32>,
        second: ArrayView4<'_, f32>,
    ) -> anyhow::Result<ArrayD<f32>> {
        let first = Tensor::from_array(first.to_owned())?;
        let second = Tensor::from_array(second.to_owned())?;
        let outputs = self.session.run(ort::inputs![
            self.input_names[0].as_str() => first,
            self.input_names[1].as_str() => second,
        ]?)?;
        let patch = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .context("failed extracting f32 output tensor")?;
        Ok(patch.to_owned())
    }
}
