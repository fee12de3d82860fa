use image::imageops::FilterType;
use image::RgbImage;

use crate::error::InferenceError;
use crate::frame::Frame;

/// Normalized CHW float tensor, batch size 1.
#[derive(Clone, Debug, PartialEq)]
pub struct InputTensor {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

impl InputTensor {
    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            data: vec![0.0; 3 * width as usize * height as usize],
            width,
            height,
        }
    }

    pub fn at(&self, channel: usize, y: usize, x: usize) -> f32 {
        let plane = self.width as usize * self.height as usize;
        self.data[channel * plane + y * self.width as usize + x]
    }
}

/// Resize (bilinear, no letterboxing) and normalize as
/// `(pixel / 255 - mean[c]) / std[c]`.
pub fn preprocess(
    frame: &Frame,
    width: u32,
    height: u32,
    mean: [f32; 3],
    std: [f32; 3],
) -> Result<InputTensor, InferenceError> {
    if width == 0 || height == 0 {
        return Err(InferenceError::BadInput(format!(
            "model input size {}x{} is empty",
            width, height
        )));
    }
    if std.iter().any(|s| *s == 0.0) {
        return Err(InferenceError::BadInput("normalization std contains zero".into()));
    }

    let source = RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
        .ok_or_else(|| InferenceError::BadInput("frame buffer does not match size".into()))?;
    let resized = if frame.width == width && frame.height == height {
        source
    } else {
        image::imageops::resize(&source, width, height, FilterType::Triangle)
    };

    let plane = width as usize * height as usize;
    let mut data = vec![0.0f32; 3 * plane];
    for (i, pixel) in resized.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = (pixel.0[c] as f32 / 255.0 - mean[c]) / std[c];
        }
    }
    Ok(InputTensor {
        data,
        width,
        height,
    })
}
