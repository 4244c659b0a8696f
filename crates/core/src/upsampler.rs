//! End-to-end driver: discovers sequences, runs every frame pair through the
//! flow estimator and the adaptive scheduler, and persists the result.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use tracing::{debug, info};

use crate::assembler::FrameAssembler;
use crate::config::UpsamplerConfig;
use crate::estimators::backend::SessionConfig;
use crate::estimators::onnx::{OnnxFlowEstimator, OnnxRefinementEstimator};
use crate::estimators::{FlowEstimator, RefinementEstimator};
use crate::scheduler::{AdaptiveScheduler, DEFAULT_BLEND_EPSILON};
use crate::sequence::{discover_sequences, mirror_directory_tree, ImageSequence};
use crate::types::Normalization;
use crate::warp::WarpResourceCache;
use crate::writer::{FrameSink, SequenceWriter, DEFAULT_IMAGES_DIR, DEFAULT_TIMESTAMPS_FILE};

#[derive(Debug, Clone, PartialEq)]
pub struct UpsamplerOptions {
    pub normalization: Normalization,
    pub blend_epsilon: f32,
    pub images_dir: String,
    pub timestamps_file: String,
}

impl Default for UpsamplerOptions {
    fn default() -> Self {
        Self {
            normalization: Normalization::default(),
            blend_epsilon: DEFAULT_BLEND_EPSILON,
            images_dir: DEFAULT_IMAGES_DIR.to_string(),
            timestamps_file: DEFAULT_TIMESTAMPS_FILE.to_string(),
        }
    }
}

impl From<&UpsamplerConfig> for UpsamplerOptions {
    fn from(config: &UpsamplerConfig) -> Self {
        Self {
            normalization: config.normalization(),
            blend_epsilon: config.interpolation.blend_epsilon,
            images_dir: config.output.images_dir.clone(),
            timestamps_file: config.output.timestamps_file.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceSummary {
    pub pairs: usize,
    pub frames: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub sequences: usize,
    pub pairs: usize,
    pub frames: usize,
}

pub struct Upsampler {
    input_dir: PathBuf,
    output_dir: PathBuf,
    flow: Box<dyn FlowEstimator>,
    refiner: Box<dyn RefinementEstimator>,
    warps: WarpResourceCache,
    options: UpsamplerOptions,
}

/// The input tree must exist and the output location must not.
pub fn check_directories(input_dir: &Path, output_dir: &Path) -> Result<()> {
    ensure!(
        input_dir.is_dir(),
        "The input directory must exist: {}",
        input_dir.display()
    );
    ensure!(
        !output_dir.exists(),
        "The output directory must not exist: {}",
        output_dir.display()
    );
    Ok(())
}

fn session_config<'a>(config: &'a UpsamplerConfig, model_path: &'a Path) -> SessionConfig<'a> {
    SessionConfig {
        model_path,
        backend: config.inference.backend,
        device_id: config.inference.device_id,
        trt_cache_dir: Some(config.inference.trt_cache_dir.as_path()),
        intra_threads: config.inference.intra_threads,
    }
}

impl Upsampler {
    /// Validates the directories and mirrors the input tree into `output_dir`.
    pub fn new(
        input_dir: &Path,
        output_dir: &Path,
        flow: Box<dyn FlowEstimator>,
        refiner: Box<dyn RefinementEstimator>,
        options: UpsamplerOptions,
    ) -> Result<Self> {
        check_directories(input_dir, output_dir)?;
        mirror_directory_tree(input_dir, output_dir).with_context(|| {
            format!(
                "Failed to mirror {} into {}",
                input_dir.display(),
                output_dir.display()
            )
        })?;

        Ok(Self {
            input_dir: input_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            flow,
            refiner,
            warps: WarpResourceCache::new(),
            options,
        })
    }

    /// Builds the ONNX estimators described by `config`.
    ///
    /// Directory preconditions are checked before any model is loaded.
    pub fn from_config(input_dir: &Path, output_dir: &Path, config: &UpsamplerConfig) -> Result<Self> {
        check_directories(input_dir, output_dir)?;

        let flow = OnnxFlowEstimator::load(&session_config(config, &config.models.flow))
            .context("Failed to load flow-computation model")?;
        let refiner =
            OnnxRefinementEstimator::load(&session_config(config, &config.models.refinement))
                .context("Failed to load flow-interpolation model")?;

        Self::new(
            input_dir,
            output_dir,
            Box::new(flow),
            Box::new(refiner),
            UpsamplerOptions::from(config),
        )
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn warp_cache(&self) -> &WarpResourceCache {
        &self.warps
    }

    pub fn run(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        let sequences = discover_sequences(&self.input_dir, &self.options.images_dir)?;
        let mut summary = RunSummary::default();

        for (number, sequence) in sequences.iter().enumerate() {
            let dest = self.output_dir.join(sequence.relative_dir());
            info!(
                sequence = number + 1,
                total = sequences.len(),
                dir = %sequence.dir().display(),
                fps = sequence.fps(),
                pairs = sequence.len(),
                "Processing sequence"
            );
            let done = self
                .upsample_sequence(sequence, &dest)
                .with_context(|| format!("Failed to upsample {}", sequence.dir().display()))?;
            summary.sequences += 1;
            summary.pairs += done.pairs;
            summary.frames += done.frames;
        }

        info!(
            sequences = summary.sequences,
            pairs = summary.pairs,
            frames = summary.frames,
            elapsed_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            "Upsampling finished"
        );
        Ok(summary)
    }

    pub fn upsample_sequence(
        &mut self,
        sequence: &ImageSequence,
        dest: &Path,
    ) -> Result<SequenceSummary> {
        let normalization = self.options.normalization;
        let mut writer =
            SequenceWriter::create(dest, &self.options.images_dir, &self.options.timestamps_file)?;
        let mut assembler = FrameAssembler::new(normalization);
        let mut pairs = 0;

        for (k, pair) in sequence.walker(normalization).enumerate() {
            let pair = pair?;
            let started = Instant::now();

            let flows = self
                .flow
                .estimate(pair.frame0.view(), pair.frame1.view())
                .with_context(|| format!("{} failed on pair {k}", self.flow.name()))?;
            let intermediates = AdaptiveScheduler::new(self.refiner.as_mut(), &mut self.warps)
                .with_blend_epsilon(self.options.blend_epsilon)
                .interpolate(&pair, &flows)
                .with_context(|| format!("Interpolation failed on pair {k}"))?;

            let frames = assembler.assemble(pair.boundary(0), pair.times.t0, intermediates)?;
            for frame in &frames {
                writer.write_frame(frame)?;
            }
            pairs += 1;

            debug!(
                pair = k,
                frames = frames.len(),
                elapsed_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
                "Pair upsampled"
            );
        }

        let frames = assembler.frame_count();
        writer.finish(&assembler.finish())?;
        info!(
            dest = %dest.display(),
            pairs,
            frames_written = writer.frames_written(),
            "Sequence written"
        );
        Ok(SequenceSummary { pairs, frames })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_follow_config() {
        let mut config = UpsamplerConfig::default();
        config.interpolation.blend_epsilon = 0.5;
        config.output.images_dir = "frames".to_string();
        let options = UpsamplerOptions::from(&config);
        assert_eq!(options.blend_epsilon, 0.5);
        assert_eq!(options.images_dir, "frames");
        assert_eq!(options.normalization, Normalization::default());
    }

    #[test]
    fn missing_input_dir_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = check_directories(&tmp.path().join("nope"), &tmp.path().join("out")).unwrap_err();
        assert!(err.to_string().contains("input directory must exist"));
    }

    #[test]
    fn existing_output_dir_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = check_directories(tmp.path(), tmp.path()).unwrap_err();
        assert!(err.to_string().contains("output directory must not exist"));
    }

    #[test]
    fn from_config_checks_directories_before_loading_models() {
        let tmp = tempfile::tempdir().unwrap();
        let config = UpsamplerConfig::default();
        let result = Upsampler::from_config(&tmp.path().join("missing"), &tmp.path().join("out"), &config);
        assert!(result.is_err());
        assert!(!tmp.path().join("out").exists());
    }
}
