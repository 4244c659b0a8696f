//! Reassembly of per-pair outputs into one indexed, time-ordered stream.

use anyhow::{bail, ensure, Result};
use image::{GrayImage, Luma};
use ndarray::Array3;

use crate::types::{Normalization, OutputFrame};

/// A frame ready to be persisted under its global index.
#[derive(Debug, Clone)]
pub struct AssembledFrame {
    pub index: usize,
    pub timestamp: f64,
    pub image: GrayImage,
}

/// Assigns global frame indices and keeps the timestamp log of one sequence.
///
/// Create one assembler per sequence; indices and the log never reset while
/// it lives.
#[derive(Debug)]
pub struct FrameAssembler {
    normalization: Normalization,
    next_index: usize,
    timestamps: Vec<f64>,
}

impl FrameAssembler {
    pub fn new(normalization: Normalization) -> Self {
        Self {
            normalization,
            next_index: 0,
            timestamps: Vec::new(),
        }
    }

    /// Number of frames assembled so far.
    pub fn frame_count(&self) -> usize {
        self.next_index
    }

    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    /// Prepends the boundary frame to the pair's intermediates, orders the
    /// window by timestamp and converts every frame to its persisted form.
    pub fn assemble(
        &mut self,
        boundary: Array3<f32>,
        boundary_timestamp: f64,
        intermediates: Vec<OutputFrame>,
    ) -> Result<Vec<AssembledFrame>> {
        let mut window = Vec::with_capacity(intermediates.len() + 1);
        window.push(OutputFrame {
            pixels: boundary,
            timestamp: boundary_timestamp,
        });
        window.extend(intermediates);
        window.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

        if let (Some(last), Some(first)) = (self.timestamps.last(), window.first()) {
            ensure!(
                first.timestamp >= *last,
                "timestamp {} precedes previously assembled timestamp {}",
                first.timestamp,
                last
            );
        }

        let mut assembled = Vec::with_capacity(window.len());
        for frame in window {
            let image = to_luma8(&frame.pixels, &self.normalization)?;
            assembled.push(AssembledFrame {
                index: self.next_index,
                timestamp: frame.timestamp,
                image,
            });
            self.timestamps.push(frame.timestamp);
            self.next_index += 1;
        }
        Ok(assembled)
    }

    /// Consumes the assembler and returns the timestamp log in index order.
    pub fn finish(self) -> Vec<f64> {
        self.timestamps
    }
}

/// Denormalizes a CHW frame and reduces it to 8-bit luma (BT.601).
pub fn to_luma8(pixels: &Array3<f32>, normalization: &Normalization) -> Result<GrayImage> {
    let (channels, h, w) = pixels.dim();
    let to_u8 = |value: f32, c: usize| -> f32 {
        ((value + normalization.channel_mean(c)) * 255.0).clamp(0.0, 255.0)
    };

    let image = match channels {
        1 => GrayImage::from_fn(w as u32, h as u32, |x, y| {
            let (x, y) = (x as usize, y as usize);
            Luma([to_u8(pixels[[0, y, x]], 0).round() as u8])
        }),
        3 => GrayImage::from_fn(w as u32, h as u32, |x, y| {
            let (x, y) = (x as usize, y as usize);
            let r = to_u8(pixels[[0, y, x]], 0);
            let g = to_u8(pixels[[1, y, x]], 1);
            let b = to_u8(pixels[[2, y, x]], 2);
            Luma([(r * 0.299 + g * 0.587 + b * 0.114).round().clamp(0.0, 255.0) as u8])
        }),
        other => bail!("cannot convert a {other}-channel frame to luma"),
    };
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm_zero() -> Normalization {
        Normalization::new([0.0, 0.0, 0.0])
    }

    fn frame(value: f32, timestamp: f64) -> OutputFrame {
        OutputFrame {
            pixels: Array3::from_elem((1, 2, 2), value),
            timestamp,
        }
    }

    #[test]
    fn boundary_only_window() {
        let mut assembler = FrameAssembler::new(norm_zero());
        let out = assembler
            .assemble(Array3::from_elem((1, 2, 2), 0.5), 0.0, Vec::new())
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].index, 0);
        assert_eq!(out[0].image.get_pixel(1, 1)[0], 128);
        assert_eq!(assembler.finish(), vec![0.0]);
    }

    #[test]
    fn window_is_sorted_by_timestamp() {
        let mut assembler = FrameAssembler::new(norm_zero());
        let out = assembler
            .assemble(
                Array3::zeros((1, 2, 2)),
                1.0,
                vec![frame(0.8, 1.5), frame(0.2, 1.25)],
            )
            .unwrap();
        let times: Vec<f64> = out.iter().map(|f| f.timestamp).collect();
        assert_eq!(times, vec![1.0, 1.25, 1.5]);
        assert_eq!(out[1].image.get_pixel(0, 0)[0], 51);
        assert_eq!(out[2].image.get_pixel(0, 0)[0], 204);
    }

    #[test]
    fn boundary_stays_first_on_equal_timestamps() {
        let mut assembler = FrameAssembler::new(norm_zero());
        let out = assembler
            .assemble(
                Array3::from_elem((1, 2, 2), 1.0),
                2.0,
                vec![frame(0.0, 2.0), frame(0.4, 2.5)],
            )
            .unwrap();
        assert_eq!(out[0].index, 0);
        assert_eq!(out[0].timestamp, 2.0);
        assert_eq!(out[0].image.get_pixel(0, 0)[0], 255);
        assert_eq!(out[1].timestamp, 2.0);
        assert_eq!(out[1].image.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn indices_continue_across_pairs() {
        let mut assembler = FrameAssembler::new(norm_zero());
        let first = assembler
            .assemble(Array3::zeros((1, 2, 2)), 0.0, vec![frame(0.0, 0.5)])
            .unwrap();
        let second = assembler
            .assemble(
                Array3::zeros((1, 2, 2)),
                1.0,
                vec![frame(0.0, 1.25), frame(0.0, 1.5), frame(0.0, 1.75)],
            )
            .unwrap();
        let indices: Vec<usize> = first.iter().chain(&second).map(|f| f.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(assembler.frame_count(), 6);
        assert_eq!(assembler.timestamps(), &[0.0, 0.5, 1.0, 1.25, 1.5, 1.75]);
    }

    #[test]
    fn rejects_time_going_backwards() {
        let mut assembler = FrameAssembler::new(norm_zero());
        assembler
            .assemble(Array3::zeros((1, 2, 2)), 2.0, Vec::new())
            .unwrap();
        assert!(assembler
            .assemble(Array3::zeros((1, 2, 2)), 1.0, Vec::new())
            .is_err());
    }

    #[test]
    fn luma_uses_bt601_weights_after_denormalizing() {
        let norm = Normalization::default();
        let mut pixels = Array3::<f32>::zeros((3, 1, 1));
        pixels[[0, 0, 0]] = 1.0 - norm.mean[0];
        pixels[[1, 0, 0]] = -norm.mean[1];
        pixels[[2, 0, 0]] = -norm.mean[2];
        let image = to_luma8(&pixels, &norm).unwrap();
        assert_eq!(image.get_pixel(0, 0)[0], 76);
    }

    #[test]
    fn luma_clamps_out_of_range_values() {
        let pixels = Array3::from_shape_vec((1, 1, 2), vec![-3.0, 7.0]).unwrap();
        let image = to_luma8(&pixels, &norm_zero()).unwrap();
        assert_eq!(image.get_pixel(0, 0)[0], 0);
        assert_eq!(image.get_pixel(1, 0)[0], 255);
    }

    #[test]
    fn rejects_unsupported_channel_count() {
        let pixels = Array3::<f32>::zeros((2, 1, 1));
        assert!(to_luma8(&pixels, &norm_zero()).is_err());
    }
}
