//! Flow-based backward warping and the per-resolution warp resource cache.
//!
//! A [`BackWarp`] owns the identity sampling grid for one `(width, height)`.
//! Warping image `I` by flow `F` samples `I` at `(x + F_x, y + F_y)` with
//! bilinear interpolation; samples falling outside the image read zero.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{ensure, Result};
use ndarray::{s, Array2, Array4, ArrayView2, ArrayView4};
use tracing::debug;

/// Resamples an image according to a dense flow field.
pub trait WarpOperator {
    /// `image` is `[B, C, H, W]`, `flow` is `[B, 2, H, W]`; returns `[B, C, H, W]`.
    fn warp(&self, image: ArrayView4<'_, f32>, flow: ArrayView4<'_, f32>) -> Result<Array4<f32>>;
}

/// Backward warp resource for a fixed resolution.
#[derive(Debug)]
pub struct BackWarp {
    width: usize,
    height: usize,
    grid_x: Array2<f32>,
    grid_y: Array2<f32>,
}

impl BackWarp {
    pub fn new(width: usize, height: usize) -> Self {
        let grid_x = Array2::from_shape_fn((height, width), |(_, x)| x as f32);
        let grid_y = Array2::from_shape_fn((height, width), |(y, _)| y as f32);
        Self {
            width,
            height,
            grid_x,
            grid_y,
        }
    }
}

impl WarpOperator for BackWarp {
    fn warp(&self, image: ArrayView4<'_, f32>, flow: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let (batch, channels, h, w) = image.dim();
        ensure!(
            h == self.height && w == self.width,
            "warp resource is {}x{}, image is {}x{}",
            self.width,
            self.height,
            w,
            h
        );
        ensure!(
            flow.dim() == (batch, 2, h, w),
            "flow shape {:?} does not match image shape {:?}",
            flow.shape(),
            image.shape()
        );

        let mut output = Array4::<f32>::zeros((batch, channels, h, w));
        for b in 0..batch {
            for c in 0..channels {
                let plane = image.slice(s![b, c, .., ..]);
                for y in 0..h {
                    for x in 0..w {
                        let sample_x = self.grid_x[[y, x]] + flow[[b, 0, y, x]];
                        let sample_y = self.grid_y[[y, x]] + flow[[b, 1, y, x]];
                        output[[b, c, y, x]] = bilinear_sample(&plane, sample_y, sample_x);
                    }
                }
            }
        }
        Ok(output)
    }
}

fn bilinear_sample(plane: &ArrayView2<'_, f32>, y: f32, x: f32) -> f32 {
    if !x.is_finite() || !y.is_finite() {
        return 0.0;
    }
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let v00 = texel(plane, y0, x0);
    let v01 = texel(plane, y0, x0 + 1);
    let v10 = texel(plane, y0 + 1, x0);
    let v11 = texel(plane, y0 + 1, x0 + 1);

    v00 * (1.0 - fx) * (1.0 - fy) + v01 * fx * (1.0 - fy) + v10 * (1.0 - fx) * fy + v11 * fx * fy
}

fn texel(plane: &ArrayView2<'_, f32>, y: i64, x: i64) -> f32 {
    let (h, w) = plane.dim();
    if y < 0 || x < 0 || y >= h as i64 || x >= w as i64 {
        0.0
    } else {
        plane[[y as usize, x as usize]]
    }
}

/// Memoizes one [`BackWarp`] per `(width, height)`.
///
/// Owned by the pipeline driver and lent to the scheduler; mutation goes
/// through `&mut self`, so sharing across threads needs one cache per worker.
#[derive(Debug, Default)]
pub struct WarpResourceCache {
    resources: HashMap<(usize, usize), Arc<BackWarp>>,
}

impl WarpResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, width: usize, height: usize) -> Arc<BackWarp> {
        self.resources
            .entry((width, height))
            .or_insert_with(|| {
                debug!(width, height, "Building warp resource");
                Arc::new(BackWarp::new(width, height))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn clear(&mut self) {
        self.resources.clear();
    }
}
