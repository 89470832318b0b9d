//! Shader sources, compilation and runtime uniforms.
//!
//! The vertex stage is fixed. User fragment shaders are Vulkan-flavoured
//! GLSL 450 and must follow the interface of [`DEFAULT_FRAGMENT_SHADER`]:
//! read `aTextureCoord`, sample `uFrame` through `uSampler`, optionally read
//! the `Runtime` uniform block, and write `oColor`.

pub mod compiler;
pub mod uniforms;

pub use compiler::{CompiledStage, LinkedProgram, ProgramHandle, ProgramInterface, ShaderCompiler};
pub use uniforms::{UniformBinder, UniformLayout, UniformSlot, Uniforms};

use std::fmt;

/// Vertex attribute fed by the quad geometry.
pub const POSITION_ATTRIBUTE: &str = "aVertexPosition";
/// Texture holding the current video frame.
pub const FRAME_SAMPLER: &str = "uFrame";
/// Playback time in seconds.
pub const TIME_UNIFORM: &str = "uTime";
/// Source size in pixels.
pub const RESOLUTION_UNIFORM: &str = "uResolution";

/// Fixed vertex stage; maps clip space to texture space.
pub const VERTEX_SHADER: &str = r#"#version 450

layout(location = 0) in vec2 aVertexPosition;

layout(location = 0) out vec2 aTextureCoord;

void main() {
    aTextureCoord = (aVertexPosition + 1.0) / 2.0;
    gl_Position = vec4(aVertexPosition, 0.0, 1.0);
}
"#;

/// Passthrough effect used when no shader is given.
pub const DEFAULT_FRAGMENT_SHADER: &str = r#"#version 450

// in from pipeline
layout(location = 0) in vec2 aTextureCoord; // <x, y> (normalized)

// current video frame
layout(set = 0, binding = 0) uniform texture2D uFrame;
layout(set = 0, binding = 1) uniform sampler uSampler;

// runtime uniforms
layout(set = 0, binding = 2) uniform Runtime {
    float uTime;      // current video time
    vec2 uResolution; // <width, height>
} runtime;

layout(location = 0) out vec4 oColor;

void main() {
    oColor = texture(sampler2D(uFrame, uSampler), aTextureCoord);
}
"#;

/// Pipeline stage of a shader source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub(crate) fn to_naga(self) -> naga::ShaderStage {
        match self {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
        }
    }
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderStage::Vertex => write!(f, "Vertex"),
            ShaderStage::Fragment => write!(f, "Fragment"),
        }
    }
}
