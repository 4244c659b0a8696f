use anyhow::{ensure, Result};
use ndarray::{s, Array3, Array4, ArrayView4};

/// Two consecutive frames of a sequence and their timestamps.
///
/// Frames are NCHW `f32` tensors in the estimators' normalized space
/// (pixel / 255 minus the per-channel mean). Both frames share one shape.
#[derive(Debug, Clone)]
pub struct FramePair {
    pub frame0: Array4<f32>,
    pub frame1: Array4<f32>,
    pub times: TimePair,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimePair {
    pub t0: f64,
    pub t1: f64,
}

impl TimePair {
    pub fn new(t0: f64, t1: f64) -> Self {
        Self { t0, t1 }
    }

    /// Absolute time of the fractional position `t` inside `[t0, t1]`.
    pub fn at(&self, t: f64) -> f64 {
        self.t0 + t * (self.t1 - self.t0)
    }
}

impl FramePair {
    pub fn new(frame0: Array4<f32>, frame1: Array4<f32>, times: TimePair) -> Result<Self> {
        ensure!(
            frame0.shape() == frame1.shape(),
            "frame shape mismatch: {:?} vs {:?}",
            frame0.shape(),
            frame1.shape()
        );
        ensure!(
            times.t0 < times.t1,
            "timestamps must be strictly increasing, got t0={} t1={}",
            times.t0,
            times.t1
        );
        Ok(Self {
            frame0,
            frame1,
            times,
        })
    }

    pub fn batch(&self) -> usize {
        self.frame0.shape()[0]
    }

    pub fn height(&self) -> usize {
        self.frame0.shape()[2]
    }

    pub fn width(&self) -> usize {
        self.frame0.shape()[3]
    }

    /// The pair restricted to batch sample `b`, still 4-D with batch 1.
    pub fn sample(&self, b: usize) -> (ArrayView4<'_, f32>, ArrayView4<'_, f32>) {
        (
            self.frame0.slice(s![b..b + 1, .., .., ..]),
            self.frame1.slice(s![b..b + 1, .., .., ..]),
        )
    }

    /// Boundary (start) frame of sample `b` as a CHW tensor.
    pub fn boundary(&self, b: usize) -> Array3<f32> {
        self.frame0.slice(s![b, .., .., ..]).to_owned()
    }
}

/// Bidirectional dense optical flow, each field shaped `[B, 2, H, W]`.
/// Channel 0 is the horizontal displacement, channel 1 the vertical one.
#[derive(Debug, Clone)]
pub struct FlowPair {
    pub forward: Array4<f32>,
    pub backward: Array4<f32>,
}

impl FlowPair {
    pub fn new(forward: Array4<f32>, backward: Array4<f32>) -> Result<Self> {
        ensure!(
            forward.shape() == backward.shape(),
            "flow shape mismatch: {:?} vs {:?}",
            forward.shape(),
            backward.shape()
        );
        ensure!(
            forward.shape()[1] == 2,
            "flow fields must have 2 channels, got {}",
            forward.shape()[1]
        );
        Ok(Self { forward, backward })
    }

    /// Checks that the flows cover the same batch and spatial extent as `pair`.
    pub fn ensure_matches(&self, pair: &FramePair) -> Result<()> {
        let f = self.forward.shape();
        ensure!(
            f[0] == pair.batch() && f[2] == pair.height() && f[3] == pair.width(),
            "flow shape {:?} does not match frames [{}, _, {}, {}]",
            f,
            pair.batch(),
            pair.height(),
            pair.width()
        );
        Ok(())
    }

    pub fn sample(&self, b: usize) -> (ArrayView4<'_, f32>, ArrayView4<'_, f32>) {
        (
            self.forward.slice(s![b..b + 1, .., .., ..]),
            self.backward.slice(s![b..b + 1, .., .., ..]),
        )
    }
}

/// Per-channel mean subtracted from `[0, 1]` pixels before inference.
pub const DEFAULT_MEAN: [f32; 3] = [0.429, 0.431, 0.397];

/// Mapping between `[0, 1]` pixel values and the estimators' input space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: [f32; 3],
}

impl Default for Normalization {
    fn default() -> Self {
        Self { mean: DEFAULT_MEAN }
    }
}

impl Normalization {
    pub fn new(mean: [f32; 3]) -> Self {
        Self { mean }
    }

    /// Mean for channel `c`; single-channel data uses the first entry.
    pub fn channel_mean(&self, c: usize) -> f32 {
        self.mean.get(c).copied().unwrap_or(self.mean[0])
    }
}

/// A synthesized frame (CHW, normalized space) and its absolute timestamp.
#[derive(Debug, Clone)]
pub struct OutputFrame {
    pub pixels: Array3<f32>,
    pub timestamp: f64,
}
