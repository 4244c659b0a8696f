//! Execution placement for the ONNX estimators.
//!
//! Placement is a closed set ([`InferenceBackend`]). Asking for an accelerator
//! that the runtime cannot provide is not fatal: the session is built on the
//! CPU execution provider and a warning is logged.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cpu,
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cpu` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Self::Cuda,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cpu,
        }
    }

    pub fn is_accelerated(&self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub device_id: i32,
    pub trt_cache_dir: Option<&'a Path>,
    pub intra_threads: Option<usize>,
}

/// Resolve the backend that will actually run, warning when the requested
/// accelerator is unavailable.
pub fn effective_backend(requested: InferenceBackend) -> InferenceBackend {
    if !requested.is_accelerated() {
        return requested;
    }
    let cuda_available = CUDAExecutionProvider::default()
        .is_available()
        .unwrap_or(false);
    if cuda_available {
        requested
    } else {
        warn!(
            requested = %requested,
            "CUDA execution provider not available; estimators will run on CPU"
        );
        InferenceBackend::Cpu
    }
}

pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let mut builder =
        Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    if let Some(threads) = config.intra_threads {
        builder = builder.with_intra_threads(threads)?;
    }

    let backend = effective_backend(config.backend);
    let started = Instant::now();

    let session = match backend {
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session on CPU");
            builder.commit_from_file(config.model_path)
        }
        InferenceBackend::Cuda => {
            debug!(backend = "cuda", device_id = config.device_id, "Building session with CUDA EP");
            builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .with_device_id(config.device_id)
                    .build()])?
                .commit_from_file(config.model_path)
        }
        InferenceBackend::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));
            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }
            info!(
                cache_dir = %cache_dir.display(),
                "Initializing TensorRT session (first run may take several minutes)"
            );
            builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(cache_dir.to_string_lossy().to_string())
                        .with_device_id(config.device_id)
                        .build(),
                    CUDAExecutionProvider::default()
                        .with_device_id(config.device_id)
                        .build(),
                ])?
                .commit_from_file(config.model_path)
        }
    }
    .with_context(|| format!("Failed to load ONNX model: {}", config.model_path.display()))?;

    info!(
        model = %config.model_path.display(),
        backend = %backend,
        elapsed_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
        "ONNX session ready"
    );
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_str_lossy() {
        assert_eq!(InferenceBackend::from_str_lossy("cpu"), InferenceBackend::Cpu);
        assert_eq!(InferenceBackend::from_str_lossy("CUDA"), InferenceBackend::Cuda);
        assert_eq!(InferenceBackend::from_str_lossy("gpu"), InferenceBackend::Cuda);
        assert_eq!(
            InferenceBackend::from_str_lossy(" TensorRT "),
            InferenceBackend::Tensorrt
        );
        assert_eq!(InferenceBackend::from_str_lossy("trt"), InferenceBackend::Tensorrt);
        assert_eq!(InferenceBackend::from_str_lossy("cuda:0x"), InferenceBackend::Cpu);
        assert_eq!(InferenceBackend::from_str_lossy(""), InferenceBackend::Cpu);
    }

    #[test]
    fn test_backend_display_round_trips() {
        for backend in [
            InferenceBackend::Cpu,
            InferenceBackend::Cuda,
            InferenceBackend::Tensorrt,
        ] {
            assert_eq!(InferenceBackend::from_str_lossy(&backend.to_string()), backend);
        }
    }

    #[test]
    fn test_cpu_is_not_accelerated() {
        assert!(!InferenceBackend::Cpu.is_accelerated());
        assert!(InferenceBackend::Cuda.is_accelerated());
        assert!(InferenceBackend::Tensorrt.is_accelerated());
        assert_eq!(effective_backend(InferenceBackend::Cpu), InferenceBackend::Cpu);
    }

    #[test]
    fn test_backend_serde_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            backend: InferenceBackend,
        }
        let parsed: Wrapper = toml::from_str("backend = \"tensorrt\"").unwrap();
        assert_eq!(parsed.backend, InferenceBackend::Tensorrt);
    }
}
