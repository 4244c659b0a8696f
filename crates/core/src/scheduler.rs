//! Motion-adaptive interpolation scheduler.
//!
//! For each frame pair the number of synthesized frames follows the largest
//! optical-flow displacement: a pair whose fastest pixel moves `m` pixels gets
//! `N = ceil(m)` sub-intervals, i.e. `N - 1` intermediate frames at
//! `t = i / N`. Each intermediate frame is built in two warp passes around the
//! refinement estimator and blended with visibility-weighted temporal weights.

use std::time::Instant;

use anyhow::{bail, ensure, Result};
use ndarray::{s, Array3, Array4, ArrayView4, Zip};
use tracing::debug;

use crate::estimators::{RefinementEstimator, RefinementInputs};
use crate::types::{FlowPair, FramePair, OutputFrame};
use crate::warp::{WarpOperator, WarpResourceCache};

/// Lower bound applied to the blend denominator `w0·V0 + w1·V1`.
pub const DEFAULT_BLEND_EPSILON: f32 = 1e-6;

/// Largest flow magnitude, in pixels, accepted from the flow estimator.
pub const MAX_FLOW_MAGNITUDE: f32 = u32::MAX as f32;

/// Synthesis parameters for one intermediate position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepCoefficients {
    /// Fractional position strictly inside `(0, 1)`.
    pub t: f64,
    /// `[temp, t², (1 - t)², temp]` with `temp = -t(1 - t)`:
    /// `F_t_0 = flow[0]·F_0_1 + flow[1]·F_1_0`, `F_t_1 = flow[2]·F_0_1 + flow[3]·F_1_0`.
    pub flow: [f32; 4],
    /// Temporal weights `[1 - t, t]` for the frame-0 and frame-1 sides.
    pub blend: [f32; 2],
}

impl StepCoefficients {
    pub fn at(index: usize, count: usize) -> Self {
        let t = index as f64 / count as f64;
        let tf = t as f32;
        let temp = -tf * (1.0 - tf);
        Self {
            t,
            flow: [temp, tf * tf, (1.0 - tf) * (1.0 - tf), temp],
            blend: [1.0 - tf, tf],
        }
    }
}

/// Per-sample maximum flow magnitude over both directions.
pub fn max_flow_magnitudes(flows: &FlowPair) -> Vec<f32> {
    let batch = flows.forward.shape()[0];
    (0..batch)
        .map(|b| {
            max_magnitude(&flows.forward.view(), b).max(max_magnitude(&flows.backward.view(), b))
        })
        .collect()
}

fn max_magnitude(flow: &ArrayView4<'_, f32>, b: usize) -> f32 {
    let u = flow.slice(s![b, 0, .., ..]);
    let v = flow.slice(s![b, 1, .., ..]);
    u.iter()
        .zip(v.iter())
        .map(|(&x, &y)| (x * x + y * y).sqrt())
        .fold(0.0f32, f32::max)
}

/// Number of sub-intervals `N = ceil(magnitude)` per sample.
///
/// A sample yields `N - 1` intermediate frames; `N <= 1` means none.
pub fn required_frame_counts(flows: &FlowPair) -> Result<Vec<usize>> {
    max_flow_magnitudes(flows)
        .into_iter()
        .enumerate()
        .map(|(b, mag)| {
            if !mag.is_finite() {
                bail!("flow magnitude for sample {b} is not finite");
            }
            if mag > MAX_FLOW_MAGNITUDE {
                bail!("flow magnitude {mag} for sample {b} exceeds {MAX_FLOW_MAGNITUDE}");
            }
            Ok(mag.ceil() as usize)
        })
        .collect()
}

/// Drives warping, refinement and blending for one frame pair.
///
/// Borrows the refinement estimator and the warp resource cache from the
/// pipeline driver for the duration of the pair.
pub struct AdaptiveScheduler<'a> {
    refiner: &'a mut dyn RefinementEstimator,
    warps: &'a mut WarpResourceCache,
    blend_epsilon: f32,
}

impl<'a> AdaptiveScheduler<'a> {
    pub fn new(refiner: &'a mut dyn RefinementEstimator, warps: &'a mut WarpResourceCache) -> Self {
        Self {
            refiner,
            warps,
            blend_epsilon: DEFAULT_BLEND_EPSILON,
        }
    }

    pub fn with_blend_epsilon(mut self, epsilon: f32) -> Self {
        self.blend_epsilon = epsilon;
        self
    }

    /// Intermediate frames of a single-sample pair, ascending by timestamp.
    pub fn interpolate(&mut self, pair: &FramePair, flows: &FlowPair) -> Result<Vec<OutputFrame>> {
        ensure!(
            pair.batch() == 1,
            "interpolate expects a single-sample pair, got batch {}",
            pair.batch()
        );
        let mut per_sample = self.interpolate_batch(pair, flows)?;
        Ok(per_sample.pop().unwrap_or_default())
    }

    /// Intermediate frames for every batch sample; each sample gets its own
    /// frame count and is processed independently.
    pub fn interpolate_batch(
        &mut self,
        pair: &FramePair,
        flows: &FlowPair,
    ) -> Result<Vec<Vec<OutputFrame>>> {
        flows.ensure_matches(pair)?;
        let counts = required_frame_counts(flows)?;

        counts
            .iter()
            .enumerate()
            .map(|(b, &count)| self.interpolate_sample(pair, flows, b, count))
            .collect()
    }

    fn interpolate_sample(
        &mut self,
        pair: &FramePair,
        flows: &FlowPair,
        b: usize,
        count: usize,
    ) -> Result<Vec<OutputFrame>> {
        let started = Instant::now();
        let mut frames = Vec::new();

        for index in 1..count {
            let coeffs = StepCoefficients::at(index, count);
            let pixels = self.synthesize(pair, flows, b, &coeffs)?;
            frames.push(OutputFrame {
                pixels,
                timestamp: pair.times.at(coeffs.t),
            });
        }

        debug!(
            sample = b,
            sub_intervals = count,
            intermediates = frames.len(),
            elapsed_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            "Adaptive interpolation"
        );
        Ok(frames)
    }

    fn synthesize(
        &mut self,
        pair: &FramePair,
        flows: &FlowPair,
        b: usize,
        coeffs: &StepCoefficients,
    ) -> Result<Array3<f32>> {
        let (frame0, frame1) = pair.sample(b);
        let (flow_0_1, flow_1_0) = flows.sample(b);
        let [c00, c01, c10, c11] = coeffs.flow;

        let flow_t_0 = &flow_0_1 * c00 + &(&flow_1_0 * c01);
        let flow_t_1 = &flow_0_1 * c10 + &(&flow_1_0 * c11);

        let warp = self.warps.get(pair.width(), pair.height());
        let warped_0 = warp.warp(frame0, flow_t_0.view())?;
        let warped_1 = warp.warp(frame1, flow_t_1.view())?;

        let refinement = self.refiner.refine(&RefinementInputs {
            frame0,
            frame1,
            flow_0_1,
            flow_1_0,
            flow_t_1: flow_t_1.view(),
            flow_t_0: flow_t_0.view(),
            warped_1: warped_1.view(),
            warped_0: warped_0.view(),
        })?;
        ensure!(
            refinement.residual_0.shape() == flow_t_0.shape()
                && refinement.residual_1.shape() == flow_t_1.shape(),
            "{}: flow residual shapes {:?}/{:?} do not match flow shape {:?}",
            self.refiner.name(),
            refinement.residual_0.shape(),
            refinement.residual_1.shape(),
            flow_t_0.shape()
        );
        let (_, _, h, w) = frame0.dim();
        ensure!(
            refinement.visibility_logit.dim() == (1, 1, h, w),
            "{}: visibility shape {:?} does not match [1, 1, {h}, {w}]",
            self.refiner.name(),
            refinement.visibility_logit.shape()
        );

        let flow_t_0_refined = flow_t_0 + &refinement.residual_0;
        let flow_t_1_refined = flow_t_1 + &refinement.residual_1;
        let visibility_0 = refinement.visibility_logit.mapv(sigmoid);

        let refined_0 = warp.warp(frame0, flow_t_0_refined.view())?;
        let refined_1 = warp.warp(frame1, flow_t_1_refined.view())?;

        Ok(blend(
            &refined_0,
            &refined_1,
            &visibility_0,
            coeffs.blend,
            self.blend_epsilon,
        ))
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// `(w0·V0·g0 + w1·V1·g1) / max(w0·V0 + w1·V1, ε)` with `V1 = 1 - V0`.
fn blend(
    warped_0: &Array4<f32>,
    warped_1: &Array4<f32>,
    visibility_0: &Array4<f32>,
    [w0, w1]: [f32; 2],
    epsilon: f32,
) -> Array3<f32> {
    let (_, channels, h, w) = warped_0.dim();
    let visibility = visibility_0.slice(s![0, 0, .., ..]);
    let mut out = Array3::<f32>::zeros((channels, h, w));

    for c in 0..channels {
        Zip::from(out.slice_mut(s![c, .., ..]))
            .and(warped_0.slice(s![0, c, .., ..]))
            .and(warped_1.slice(s![0, c, .., ..]))
            .and(visibility)
            .for_each(|o, &g0, &g1, &v0| {
                let a = w0 * v0;
                let b = w1 * (1.0 - v0);
                *o = (a * g0 + b * g1) / (a + b).max(epsilon);
            });
    }
    out
}
