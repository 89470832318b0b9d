//! The seam between the render session and the GPU.

use crate::error::{RenderError, ShaderError};
use crate::frame::{QuadVertex, VideoFrame};
use crate::shader::LinkedProgram;

/// Backend-owned program identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u64);

/// Surface attributes the context was requested with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextAttributes {
    /// Present with minimal queuing.
    pub low_latency: bool,
    /// Rendered frames can be read back.
    pub read_back: bool,
    /// The drawn image survives presentation.
    pub preserve_buffer: bool,
}

impl Default for ContextAttributes {
    fn default() -> Self {
        Self {
            low_latency: true,
            read_back: true,
            preserve_buffer: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterInfo {
    pub renderer: String,
    pub vendor: String,
}

impl AdapterInfo {
    /// Human readable `"<renderer> (<vendor>)"`.
    pub fn describe(&self) -> String {
        if self.vendor.is_empty() {
            self.renderer.clone()
        } else {
            format!("{} ({})", self.renderer, self.vendor)
        }
    }
}

/// Sampling and orientation of the frame texture. Set once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureParams {
    pub width: u32,
    pub height: u32,
    /// Rows are uploaded bottom-up.
    pub flip_y: bool,
    /// Minification filter is linear; otherwise nearest.
    pub linear_min_filter: bool,
}

/// Operations the render session needs from a GPU.
pub trait GpuBackend {
    /// Attributes the context was actually created with.
    fn attributes(&self) -> ContextAttributes;

    fn adapter_info(&self) -> AdapterInfo;

    /// Sizes the drawing buffer and viewport.
    fn resize(&mut self, width: u32, height: u32);

    fn clear(&mut self, rgba: [f32; 4]) -> Result<(), RenderError>;

    /// Builds a pipeline for an already linked program.
    fn create_program(&mut self, program: &LinkedProgram) -> Result<ProgramId, ShaderError>;

    fn use_program(&mut self, id: ProgramId);

    fn release_program(&mut self, id: ProgramId);

    fn upload_vertices(&mut self, vertices: &[QuadVertex]);

    /// Allocates the frame texture, replacing any previous one.
    fn create_texture(&mut self, params: TextureParams);

    /// Writes the packed runtime uniform block.
    fn write_uniforms(&mut self, block: &[u8]);

    fn upload_texture(&mut self, frame: &VideoFrame) -> Result<(), RenderError>;

    /// Draws `vertex_count` strip vertices with the active program.
    fn draw_strip(&mut self, vertex_count: u32) -> Result<(), RenderError>;

    /// Reads back the last drawn image as top-down RGBA.
    fn read_pixels(&mut self) -> Result<VideoFrame, RenderError>;

    /// Shows the last drawn image, if the backend has a visible surface.
    fn present(&mut self) -> Result<(), RenderError> {
        Ok(())
    }

    fn is_context_lost(&self) -> bool;

    /// Stops reporting context loss for this backend.
    fn detach_lost_listener(&mut self);
}
