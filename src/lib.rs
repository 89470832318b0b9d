//! Shaderpunk: real-time fragment shader effects for video files.
//!
//! Plays a video through a user GLSL shader on the GPU and can record the
//! rendered output to a VP9 WebM file.

pub mod capture;
pub mod config;
pub mod error;
pub mod frame;
pub mod logging;
pub mod render;
pub mod shader;
pub mod utils;
pub mod video;
pub mod watch;
