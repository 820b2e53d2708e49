#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{nms, BBox, Detection, InferenceParams};
use crate::frame::Frame;

/// Number of box coordinates preceding the class scores in a YOLOv8 head.
const BOX_ROWS: usize = 4;

/// Tract-based YOLOv8 backend.
///
/// Loads a local ONNX export with a fixed square input and decodes the
/// `[1, 4 + classes, proposals]` head into class-tagged boxes. Boxes are in
/// the coordinate space of the frame passed to `detect`, which must already be
/// resized to the model's input resolution.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    resolution: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, resolution: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = resolution as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!(
            "tract backend loaded {} at {}x{}",
            model_path.display(),
            resolution,
            resolution
        );

        Ok(Self { model, resolution })
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        if frame.width != self.resolution || frame.height != self.resolution {
            return Err(anyhow!(
                "frame size {}x{} does not match model input {}x{}",
                frame.width,
                frame.height,
                self.resolution,
                self.resolution
            ));
        }

        let pixels = frame.pixels();
        let width = frame.width as usize;
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, frame.height as usize, width),
            |(_, channel, y, x)| {
                let idx = (y * width + x) * 3 + channel;
                pixels[idx] as f32 / 255.0
            },
        );

        Ok(input.into_tensor())
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame, params: &InferenceParams) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        let data: Vec<f32> = view.iter().copied().collect();
        let candidates = decode_yolov8(&data, &shape, params.confidence_threshold, frame)?;
        Ok(nms(candidates, params.overlap_threshold))
    }
}

/// Decode a YOLOv8 head laid out as `[1, 4 + classes, proposals]`.
///
/// Each proposal keeps only its best-scoring class; proposals below
/// `conf_thresh` are dropped. Boxes arrive as `(cx, cy, w, h)` in input pixels.
fn decode_yolov8(
    data: &[f32],
    shape: &[usize],
    conf_thresh: f32,
    frame: &Frame,
) -> Result<Vec<Detection>> {
    let (rows, proposals) = match shape {
        [1, rows, proposals] => (*rows, *proposals),
        [rows, proposals] => (*rows, *proposals),
        other => return Err(anyhow!("unexpected YOLO output shape {:?}", other)),
    };
    if rows <= BOX_ROWS {
        return Err(anyhow!("YOLO output has no class rows (shape {:?})", shape));
    }
    if data.len() < rows * proposals {
        return Err(anyhow!("YOLO output shorter than its shape {:?}", shape));
    }
    let num_classes = rows - BOX_ROWS;

    let mut candidates = Vec::new();
    for i in 0..proposals {
        let mut best_class = 0usize;
        let mut best_score = f32::MIN;
        for c in 0..num_classes {
            let s = data[(BOX_ROWS + c) * proposals + i];
            if s > best_score {
                best_score = s;
                best_class = c;
            }
        }
        if best_score < conf_thresh {
            continue;
        }

        let cx = data[i];
        let cy = data[proposals + i];
        let w = data[2 * proposals + i];
        let h = data[3 * proposals + i];
        let bbox = BBox::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
            .clamp_to(frame.width, frame.height);

        candidates.push(Detection::new(best_class as u32, best_score, bbox));
    }

    Ok(candidates)
}
