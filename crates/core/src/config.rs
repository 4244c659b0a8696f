use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::estimators::backend::InferenceBackend;
use crate::scheduler::DEFAULT_BLEND_EPSILON;
use crate::types::{Normalization, DEFAULT_MEAN};
use crate::writer::{DEFAULT_IMAGES_DIR, DEFAULT_TIMESTAMPS_FILE};

pub const ENV_CONFIG_PATH: &str = "UPSAMPLER_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpsamplerConfig {
    pub models: ModelsConfig,
    pub inference: InferenceConfig,
    pub normalization: NormalizationConfig,
    pub interpolation: InterpolationConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelsConfig {
    pub flow: PathBuf,
    pub refinement: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    pub backend: InferenceBackend,
    pub device_id: i32,
    pub trt_cache_dir: PathBuf,
    /// Intra-op thread count; `None` lets ONNX Runtime decide.
    pub intra_threads: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NormalizationConfig {
    pub mean: [f32; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InterpolationConfig {
    pub blend_epsilon: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    pub images_dir: String,
    pub timestamps_file: String,
}

impl Default for UpsamplerConfig {
    fn default() -> Self {
        Self {
            models: ModelsConfig::default(),
            inference: InferenceConfig::default(),
            normalization: NormalizationConfig::default(),
            interpolation: InterpolationConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            flow: PathBuf::from("models/flow_comp.onnx"),
            refinement: PathBuf::from("models/arb_time_flow_intrp.onnx"),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            backend: InferenceBackend::Cpu,
            device_id: 0,
            trt_cache_dir: PathBuf::from("trt_cache"),
            intra_threads: None,
        }
    }
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self { mean: DEFAULT_MEAN }
    }
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            blend_epsilon: DEFAULT_BLEND_EPSILON,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            images_dir: DEFAULT_IMAGES_DIR.to_string(),
            timestamps_file: DEFAULT_TIMESTAMPS_FILE.to_string(),
        }
    }
}

impl UpsamplerConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let mut config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Anchor relative model and cache paths at `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        self.models.flow = resolve_relative_to(base, &self.models.flow);
        self.models.refinement = resolve_relative_to(base, &self.models.refinement);
        self.inference.trt_cache_dir = resolve_relative_to(base, &self.inference.trt_cache_dir);
    }

    pub fn normalization(&self) -> Normalization {
        Normalization::new(self.normalization.mean)
    }
}

/// Resolve the config file path:
/// 1. CLI override if provided
/// 2. UPSAMPLER_CONFIG environment variable
/// 3. None (built-in defaults)
pub fn config_path(cli_override: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_override {
        return Some(path.to_path_buf());
    }

    env::var_os(ENV_CONFIG_PATH).map(PathBuf::from)
}

/// Resolve a path relative to a base directory.
/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = UpsamplerConfig::default();

        assert_eq!(cfg.models.flow, PathBuf::from("models/flow_comp.onnx"));
        assert_eq!(cfg.inference.backend, InferenceBackend::Cpu);
        assert_eq!(cfg.inference.trt_cache_dir, PathBuf::from("trt_cache"));
        assert_eq!(cfg.normalization.mean, [0.429, 0.431, 0.397]);
        assert_eq!(cfg.interpolation.blend_epsilon, 1e-6);
        assert_eq!(cfg.output.images_dir, "imgs");
        assert_eq!(cfg.output.timestamps_file, "timestamps.txt");
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = UpsamplerConfig::default();
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: UpsamplerConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let loaded = UpsamplerConfig::load_from_path(&tmp.path().join("missing.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, UpsamplerConfig::default());
    }

    #[test]
    fn load_partial_file_fills_defaults_and_resolves_models() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("upsampler.toml");
        fs::write(
            &path,
            "[models]\nflow = \"nets/fc.onnx\"\nrefinement = \"/abs/at.onnx\"\n\n\
             [inference]\nbackend = \"cuda\"\n\n[interpolation]\nblend_epsilon = 0.001\n",
        )
        .unwrap();

        let cfg = UpsamplerConfig::load_from_path(&path).unwrap();
        assert_eq!(cfg.models.flow, tmp.path().join("nets/fc.onnx"));
        assert_eq!(cfg.models.refinement, PathBuf::from("/abs/at.onnx"));
        assert_eq!(cfg.inference.backend, InferenceBackend::Cuda);
        assert_eq!(cfg.interpolation.blend_epsilon, 0.001);
        assert_eq!(cfg.normalization.mean, DEFAULT_MEAN);
        assert_eq!(cfg.output, OutputConfig::default());
    }

    #[test]
    fn load_rejects_malformed_toml() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.toml");
        fs::write(&path, "[models\nflow = 3").unwrap();
        let err = UpsamplerConfig::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config TOML"));
    }

    #[test]
    fn save_then_load_keeps_custom_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("cfg.toml");
        let mut cfg = UpsamplerConfig::default();
        cfg.models.flow = tmp.path().join("fc.onnx");
        cfg.models.refinement = tmp.path().join("at.onnx");
        cfg.inference.trt_cache_dir = tmp.path().join("trt");
        cfg.normalization.mean = [0.5, 0.5, 0.5];
        cfg.save_to_path(&path).unwrap();

        assert_eq!(UpsamplerConfig::load_from_path(&path).unwrap(), cfg);
    }

    #[test]
    fn config_path_prefers_cli_then_env() {
        assert_eq!(
            config_path(Some(Path::new("/cli.toml"))),
            Some(PathBuf::from("/cli.toml"))
        );

        env::set_var(ENV_CONFIG_PATH, "/env.toml");
        let from_env = config_path(None);
        env::remove_var(ENV_CONFIG_PATH);
        assert_eq!(from_env, Some(PathBuf::from("/env.toml")));
        assert_eq!(config_path(None), None);
    }

    #[test]
    fn resolve_relative_to_absolute_path_unchanged() {
        let result = resolve_relative_to(Path::new("/base"), Path::new("/abs/path"));
        assert_eq!(result, PathBuf::from("/abs/path"));
    }

    #[test]
    fn resolve_relative_to_joins_relative_path() {
        let result = resolve_relative_to(Path::new("/base"), Path::new("sub"));
        assert_eq!(result, PathBuf::from("/base/sub"));
    }
}
