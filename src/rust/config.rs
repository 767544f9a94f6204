use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::BackendKind;
use crate::error::{EngineError, Result};

/// How the runner feeds batches to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Host batch, one device round trip per sample (`Engine::run`).
    #[default]
    PerSample,
    /// Device batch in strides of the max batch size (`Engine::run_on_device`).
    Device,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::PerSample => f.write_str("per-sample"),
            RunMode::Device => f.write_str("device"),
        }
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "per-sample" | "sample" => Ok(RunMode::PerSample),
            "device" | "batched" => Ok(RunMode::Device),
            other => Err(format!("unknown run mode '{}'", other)),
        }
    }
}

/// Runner settings, usually read from a JSON file next to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub engine: Option<PathBuf>,
    pub backend: BackendKind,
    pub device: i32,
    pub batch: usize,
    pub iterations: usize,
    pub mode: RunMode,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            engine: None,
            backend: BackendKind::default(),
            device: 0,
            batch: 8,
            iterations: 1,
            mode: RunMode::default(),
            base_dir: PathBuf::from("."),
        }
    }
}

impl RunnerConfig {
    /// Reads a JSON config. Relative paths inside it resolve against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: RunnerConfig = serde_json::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        info!("Loaded runner config from {}", path.display());
        Ok(config)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Engine path resolved against the config directory.
    pub fn engine_path(&self) -> Option<PathBuf> {
        self.engine.as_deref().map(|p| self.resolve_path(p))
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch == 0 {
            return Err(EngineError::Config("batch must be at least 1".to_string()));
        }
        if self.iterations == 0 {
            return Err(EngineError::Config("iterations must be at least 1".to_string()));
        }
        if self.device < 0 {
            return Err(EngineError::Config(format!("invalid device ordinal {}", self.device)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: RunnerConfig = serde_json::from_str(r#"{"batch": 32}"#).unwrap();
        assert_eq!(config.batch, 32);
        assert_eq!(config.iterations, 1);
        assert_eq!(config.backend, BackendKind::Reference);
        assert_eq!(config.mode, RunMode::PerSample);
    }

    #[test]
    fn modes_parse_from_json_and_cli() {
        let config: RunnerConfig = serde_json::from_str(r#"{"mode": "device", "backend": "tensorrt"}"#).unwrap();
        assert_eq!(config.mode, RunMode::Device);
        assert_eq!(config.backend, BackendKind::TensorRt);
        assert_eq!("per-sample".parse::<RunMode>(), Ok(RunMode::PerSample));
        assert!("parallel".parse::<RunMode>().is_err());
    }

    #[test]
    fn validate_rejects_zero_batch() {
        let config = RunnerConfig {
            batch: 0,
            ..RunnerConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn load_resolves_engine_relative_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.json");
        fs::write(&path, r#"{"engine": "models/resnet.trt", "iterations": 3}"#).unwrap();

        let config = RunnerConfig::load(&path).unwrap();
        assert_eq!(config.iterations, 3);
        assert_eq!(config.base_dir(), dir.path());
        assert_eq!(
            config.engine_path().unwrap(),
            dir.path().join("models/resnet.trt")
        );
    }

    #[test]
    fn load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.json");
        fs::write(&path, "{ batch: }").unwrap();
        assert!(matches!(RunnerConfig::load(&path), Err(EngineError::Config(_))));
    }
}
