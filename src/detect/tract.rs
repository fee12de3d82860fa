#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{Context, Result};
use tract_onnx::prelude::*;

use crate::error::InferenceError;

use super::backend::{ModelRuntime, OutputRows};
use super::preprocess::InputTensor;

/// ONNX kernel on tract. Loads a local model file; no network I/O.
pub struct TractRuntime {
    model: TypedRunnableModel<TypedModel>,
    width: u32,
    height: u32,
}

impl TractRuntime {
    pub fn load(model_path: &Path, width: u32, height: u32) -> Result<Self> {
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        Ok(Self {
            model,
            width,
            height,
        })
    }
}

impl ModelRuntime for TractRuntime {
    fn run(&self, input: &InputTensor) -> Result<OutputRows, InferenceError> {
        if input.width != self.width || input.height != self.height {
            return Err(InferenceError::BadInput(format!(
                "tensor {}x{} does not match model input {}x{}",
                input.width, input.height, self.width, self.height
            )));
        }
        let array = tract_ndarray::Array4::from_shape_vec(
            (1, 3, self.height as usize, self.width as usize),
            input.data.clone(),
        )
        .map_err(|e| InferenceError::BadInput(e.to_string()))?;

        let outputs = self
            .model
            .run(tvec!(array.into_tensor().into()))
            .map_err(|e| InferenceError::Runtime(format!("ONNX inference failed: {}", e)))?;
        let output = outputs
            .first()
            .ok_or_else(|| InferenceError::Runtime("model produced no outputs".into()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| InferenceError::Runtime(format!("output tensor was not f32: {}", e)))?;
        let columns = view.shape().last().copied().unwrap_or(0);
        Ok(OutputRows::new(view.iter().copied().collect(), columns))
    }
}
