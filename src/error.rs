//! Error taxonomy shared by the render and capture pipelines.

use crate::render::SessionState;
use crate::shader::ShaderStage;
use std::path::PathBuf;
use thiserror::Error;

/// An input the fixed pipeline expects is absent from a linked program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MissingInterface {
    #[error("Couldn't find attribute [{0}] location.")]
    Attribute(String),
    #[error("Couldn't find sampler [{0}] location.")]
    Sampler(String),
}

impl MissingInterface {
    /// Name of the missing attribute or sampler.
    pub fn name(&self) -> &str {
        match self {
            MissingInterface::Attribute(name) | MissingInterface::Sampler(name) => name,
        }
    }
}

/// Shader text rejected by the compiler or the linker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShaderError {
    #[error("{stage} shader failed to compile:\n{log}")]
    Compile { stage: ShaderStage, log: String },
    #[error("Program could not be linked:\n{log}")]
    Link { log: String },
    #[error(transparent)]
    MissingInterface(#[from] MissingInterface),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error("GPU context lost. Choose your video again.")]
    ContextLost,
    #[error("render session is not drawable (state: {0:?})")]
    NotReady(SessionState),
    #[error("GPU backend error: {0}")]
    Backend(String),
}

impl RenderError {
    /// `true` when the surface must be discarded and rebuilt.
    pub fn is_context_lost(&self) -> bool {
        matches!(self, RenderError::ContextLost)
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no video is attached")]
    NoSource,
    #[error("a recording is already in progress")]
    AlreadyRecording,
    #[error("encoder fault: {0}")]
    EncoderFault(String),
    #[error("container error: {0}")]
    Mux(String),
    #[error("recording session is still capturing frames")]
    StillRecording,
}

#[derive(Debug, Error)]
pub enum VideoError {
    #[error("File `{}` is not a video.", .0.display())]
    UnsupportedFormat(PathBuf),
    #[error("failed to probe `{path}`: {reason}")]
    Probe { path: PathBuf, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}
