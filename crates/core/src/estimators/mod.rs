//! Estimator seams consumed by the scheduler.
//!
//! The scheduler only sees these traits. [`onnx`] provides ONNX Runtime
//! implementations; plain functions with matching signatures implement the
//! traits too.

pub mod backend;
pub mod onnx;

use anyhow::Result;
use ndarray::{Array4, ArrayView4};

use crate::types::FlowPair;

/// Estimates bidirectional optical flow between two frames.
pub trait FlowEstimator {
    fn name(&self) -> &str {
        "FlowEstimator"
    }

    /// `frame0`/`frame1` are `[B, C, H, W]`; both returned flows are `[B, 2, H, W]`.
    fn estimate(&mut self, frame0: ArrayView4<'_, f32>, frame1: ArrayView4<'_, f32>)
        -> Result<FlowPair>;
}

impl<F> FlowEstimator for F
where
    F: FnMut(ArrayView4<'_, f32>, ArrayView4<'_, f32>) -> Result<FlowPair>,
{
    fn estimate(
        &mut self,
        frame0: ArrayView4<'_, f32>,
        frame1: ArrayView4<'_, f32>,
    ) -> Result<FlowPair> {
        self(frame0, frame1)
    }
}

/// Everything the refinement network looks at for one intermediate time.
pub struct RefinementInputs<'a> {
    pub frame0: ArrayView4<'a, f32>,
    pub frame1: ArrayView4<'a, f32>,
    pub flow_0_1: ArrayView4<'a, f32>,
    pub flow_1_0: ArrayView4<'a, f32>,
    pub flow_t_1: ArrayView4<'a, f32>,
    pub flow_t_0: ArrayView4<'a, f32>,
    pub warped_1: ArrayView4<'a, f32>,
    pub warped_0: ArrayView4<'a, f32>,
}

/// Flow corrections and the raw (pre-sigmoid) visibility of the frame-0 side.
#[derive(Debug, Clone)]
pub struct Refinement {
    pub residual_0: Array4<f32>,
    pub residual_1: Array4<f32>,
    pub visibility_logit: Array4<f32>,
}

/// Refines intermediate flows and predicts per-pixel visibility.
pub trait RefinementEstimator {
    fn name(&self) -> &str {
        "RefinementEstimator"
    }

    fn refine(&mut self, inputs: &RefinementInputs<'_>) -> Result<Refinement>;
}

impl<F> RefinementEstimator for F
where
    F: FnMut(&RefinementInputs<'_>) -> Result<Refinement>,
{
    fn refine(&mut self, inputs: &RefinementInputs<'_>) -> Result<Refinement> {
        self(inputs)
    }
}
