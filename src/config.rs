//! Optional YAML configuration file.

use crate::capture::DEFAULT_BITRATE;
use crate::error::ConfigError;
use crate::render::DEFAULT_MAX_SETUP_ATTEMPTS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DEBOUNCE_MS: u64 = 750;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ShaderpunkConfig {
    /// Fragment shader to load at startup; the passthrough shader when unset.
    pub shader: Option<PathBuf>,
    /// Directory recordings are written to.
    pub output_dir: PathBuf,
    /// Encoder bitrate in bits per second.
    pub bitrate: u32,
    pub debounce_ms: u64,
    pub max_setup_attempts: u32,
    pub preview_title: String,
}

impl Default for ShaderpunkConfig {
    fn default() -> Self {
        Self {
            shader: None,
            output_dir: PathBuf::from("."),
            bitrate: DEFAULT_BITRATE,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            max_setup_attempts: DEFAULT_MAX_SETUP_ATTEMPTS,
            preview_title: "Shaderpunk".to_string(),
        }
    }
}

impl ShaderpunkConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        // Relative shader paths are resolved against the config file.
        if let (Some(shader), Some(dir)) = (&config.shader, path.parent()) {
            if shader.is_relative() {
                config.shader = Some(dir.join(shader));
            }
        }
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
