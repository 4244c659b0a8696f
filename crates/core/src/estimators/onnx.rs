//! ONNX Runtime estimators for the flow-computation and arbitrary-time
//! flow-interpolation networks.
//!
//! Both networks are fully convolutional with five down-sampling stages, so
//! inputs are reflection-padded up to a multiple of 32 and outputs are cropped
//! back. Input/output names and FP16 precision are detected from the session.

use anyhow::{ensure, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{concatenate, s, Array4, ArrayView4, Axis, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::debug;

use super::backend::{build_session, SessionConfig};
use super::{FlowEstimator, Refinement, RefinementEstimator, RefinementInputs};
use crate::types::FlowPair;

const PAD_ALIGN: usize = 32;

/// Channels produced by the flow network: `F_0_1 (2) + F_1_0 (2)`.
const FLOW_OUTPUT_CHANNELS: usize = 4;
/// Channels produced by the refinement network: two residuals and one logit.
const REFINEMENT_OUTPUT_CHANNELS: usize = 5;

struct OnnxModel {
    session: Session,
    input_name: String,
    output_name: String,
    is_fp16: bool,
}

impl OnnxModel {
    fn load(config: &SessionConfig<'_>) -> Result<Self> {
        let session = build_session(config)?;

        let input = session
            .inputs()
            .first()
            .context("ONNX model declares no inputs")?;
        let output = session
            .outputs()
            .first()
            .context("ONNX model declares no outputs")?;
        let input_name = input.name().to_string();
        let output_name = output.name().to_string();
        let is_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        debug!(
            model = %config.model_path.display(),
            %input_name, %output_name, is_fp16,
            "Detected model IO"
        );

        Ok(Self {
            session,
            input_name,
            output_name,
            is_fp16,
        })
    }

    fn run(&mut self, input: Array4<f32>) -> Result<Array4<f32>> {
        let output = if self.is_fp16 {
            self.run_fp16(input)?
        } else {
            let tensor = Tensor::from_array(input)?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => &tensor])?;
            let view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
            view.to_owned()
        };
        Ok(output.into_dimensionality::<Ix4>()?)
    }

    fn run_fp16(&mut self, input: Array4<f32>) -> Result<ndarray::ArrayD<f32>> {
        let shape = input.shape().to_vec();
        let contiguous = input.as_standard_layout();
        let f32_slice = contiguous
            .as_slice()
            .context("input must be contiguous for f16 conversion")?;
        let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
        fp16_data.convert_from_f32_slice(f32_slice);

        let tensor = Tensor::from_array(ndarray::ArrayD::from_shape_vec(shape, fp16_data)?)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &tensor])?;
        let view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;
        let standard = view.as_standard_layout();
        let fp16_slice = standard
            .as_slice()
            .context("output must be contiguous for f16 conversion")?;
        let mut f32_data = vec![0.0f32; fp16_slice.len()];
        fp16_slice.convert_to_f32_slice(&mut f32_data);

        Ok(ndarray::ArrayD::from_shape_vec(view.shape().to_vec(), f32_data)?)
    }
}

/// Flow-computation network: `[I0 ‖ I1]` in, `[F_0_1 ‖ F_1_0]` out.
pub struct OnnxFlowEstimator {
    model: OnnxModel,
}

impl OnnxFlowEstimator {
    pub fn load(config: &SessionConfig<'_>) -> Result<Self> {
        Ok(Self {
            model: OnnxModel::load(config)?,
        })
    }
}

impl FlowEstimator for OnnxFlowEstimator {
    fn name(&self) -> &str {
        "OnnxFlowEstimator"
    }

    fn estimate(
        &mut self,
        frame0: ArrayView4<'_, f32>,
        frame1: ArrayView4<'_, f32>,
    ) -> Result<FlowPair> {
        let (_, _, h, w) = frame0.dim();
        let input = concatenate(Axis(1), &[frame0, frame1])?;
        let output = self.model.run(pad_to_multiple(input.view(), PAD_ALIGN))?;
        ensure!(
            output.shape()[1] == FLOW_OUTPUT_CHANNELS,
            "flow model returned {} channels, expected {FLOW_OUTPUT_CHANNELS}",
            output.shape()[1]
        );
        let output = crop(output.view(), h, w);
        FlowPair::new(
            output.slice(s![.., 0..2, .., ..]).to_owned(),
            output.slice(s![.., 2..4, .., ..]).to_owned(),
        )
    }
}

/// Arbitrary-time flow interpolation network:
/// `[I0 ‖ I1 ‖ F_0_1 ‖ F_1_0 ‖ F_t_1 ‖ F_t_0 ‖ g(I1, F_t_1) ‖ g(I0, F_t_0)]` in,
/// `[ΔF_t_0 ‖ ΔF_t_1 ‖ V_t_0 logit]` out.
pub struct OnnxRefinementEstimator {
    model: OnnxModel,
}

impl OnnxRefinementEstimator {
    pub fn load(config: &SessionConfig<'_>) -> Result<Self> {
        Ok(Self {
            model: OnnxModel::load(config)?,
        })
    }
}

impl RefinementEstimator for OnnxRefinementEstimator {
    fn name(&self) -> &str {
        "OnnxRefinementEstimator"
    }

    fn refine(&mut self, inputs: &RefinementInputs<'_>) -> Result<Refinement> {
        let (_, _, h, w) = inputs.frame0.dim();
        let input = concatenate(
            Axis(1),
            &[
                inputs.frame0,
                inputs.frame1,
                inputs.flow_0_1,
                inputs.flow_1_0,
                inputs.flow_t_1,
                inputs.flow_t_0,
                inputs.warped_1,
                inputs.warped_0,
            ],
        )?;
        let output = self.model.run(pad_to_multiple(input.view(), PAD_ALIGN))?;
        ensure!(
            output.shape()[1] == REFINEMENT_OUTPUT_CHANNELS,
            "refinement model returned {} channels, expected {REFINEMENT_OUTPUT_CHANNELS}",
            output.shape()[1]
        );
        let output = crop(output.view(), h, w);
        Ok(Refinement {
            residual_0: output.slice(s![.., 0..2, .., ..]).to_owned(),
            residual_1: output.slice(s![.., 2..4, .., ..]).to_owned(),
            visibility_logit: output.slice(s![.., 4..5, .., ..]).to_owned(),
        })
    }
}

fn pad_amount(dim: usize, align: usize) -> usize {
    (align - (dim % align)) % align
}

/// Mirror index `i` into `[0, n)` without repeating the edge sample.
fn reflect_index(i: usize, n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    let period = 2 * (n - 1);
    let r = i % period;
    if r < n {
        r
    } else {
        period - r
    }
}

/// Reflection-pad the spatial dims of an NCHW tensor up to a multiple of `align`.
fn pad_to_multiple(input: ArrayView4<'_, f32>, align: usize) -> Array4<f32> {
    let (b, c, h, w) = input.dim();
    let padded_h = h + pad_amount(h, align);
    let padded_w = w + pad_amount(w, align);
    if padded_h == h && padded_w == w {
        return input.to_owned();
    }
    Array4::from_shape_fn((b, c, padded_h, padded_w), |(n, ch, y, x)| {
        input[[n, ch, reflect_index(y, h), reflect_index(x, w)]]
    })
}

fn crop(output: ArrayView4<'_, f32>, h: usize, w: usize) -> Array4<f32> {
    output.slice(s![.., .., ..h, ..w]).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_amount() {
        assert_eq!(pad_amount(32, 32), 0);
        assert_eq!(pad_amount(1080, 32), 8);
        assert_eq!(pad_amount(720, 32), 16);
        assert_eq!(pad_amount(1, 32), 31);
        assert_eq!(pad_amount(33, 32), 31);
    }

    #[test]
    fn test_reflect_index_mirrors_without_edge_repeat() {
        let mirrored: Vec<usize> = (0..9).map(|i| reflect_index(i, 4)).collect();
        assert_eq!(mirrored, vec![0, 1, 2, 3, 2, 1, 0, 1, 2]);
        assert_eq!(reflect_index(17, 1), 0);
    }

    #[test]
    fn test_pad_to_multiple_aligned_is_unchanged() {
        let input = Array4::<f32>::ones((1, 3, 32, 64));
        let padded = pad_to_multiple(input.view(), 32);
        assert_eq!(padded, input);
    }

    #[test]
    fn test_pad_to_multiple_reflects_bottom_and_right() {
        let input = Array4::from_shape_fn((1, 2, 30, 50), |(_, c, y, x)| {
            (c * 10_000 + y * 100 + x) as f32
        });
        let padded = pad_to_multiple(input.view(), 32);
        assert_eq!(padded.shape(), &[1, 2, 32, 64]);
        assert_eq!(padded[[0, 1, 29, 49]], input[[0, 1, 29, 49]]);
        assert_eq!(padded[[0, 0, 30, 0]], input[[0, 0, 28, 0]]);
        assert_eq!(padded[[0, 0, 31, 0]], input[[0, 0, 27, 0]]);
        assert_eq!(padded[[0, 1, 0, 50]], input[[0, 1, 0, 48]]);
    }

    #[test]
    fn test_pad_tiny_frame_does_not_overflow() {
        let input = Array4::from_shape_fn((1, 1, 2, 2), |(_, _, y, x)| (y * 2 + x) as f32);
        let padded = pad_to_multiple(input.view(), 32);
        assert_eq!(padded.shape(), &[1, 1, 32, 32]);
        assert_eq!(padded[[0, 0, 2, 2]], input[[0, 0, 0, 0]]);
        assert_eq!(padded[[0, 0, 3, 3]], input[[0, 0, 1, 1]]);
    }

    #[test]
    fn test_crop_restores_original_extent() {
        let input = Array4::from_shape_fn((1, 4, 30, 50), |(_, c, y, x)| (c + y + x) as f32);
        let padded = pad_to_multiple(input.view(), 32);
        assert_eq!(crop(padded.view(), 30, 50), input);
    }
}
