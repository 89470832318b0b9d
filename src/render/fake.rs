//! Recording backend for tests.

use super::backend::{AdapterInfo, ContextAttributes, GpuBackend, ProgramId, TextureParams};
use crate::error::{RenderError, ShaderError};
use crate::frame::{PixelFormat, QuadVertex, VideoFrame};
use crate::shader::LinkedProgram;

/// A vertex stage that builds the quad from the vertex index, without an
/// `aVertexPosition` input.
pub const NO_POSITION_VERTEX_SHADER: &str = r#"#version 450
layout(location = 0) out vec2 aTextureCoord;
void main() {
    int index = int(gl_VertexIndex);
    vec2 corner = vec2(float(index & 1), float(index >> 1));
    aTextureCoord = corner;
    gl_Position = vec4(corner * 2.0 - 1.0, 0.0, 1.0);
}
"#;

#[derive(Debug, Default)]
pub struct FakeBackend {
    pub attributes: ContextAttributes,
    pub size: (u32, u32),
    pub clears: Vec<[f32; 4]>,
    pub programs: Vec<ProgramId>,
    pub active: Option<ProgramId>,
    pub released: Vec<ProgramId>,
    pub vertices: Option<Vec<QuadVertex>>,
    pub textures: Vec<TextureParams>,
    pub uniform_writes: Vec<Vec<u8>>,
    pub uploads: Vec<VideoFrame>,
    pub draws: Vec<u32>,
    pub presents: usize,
    pub lost: bool,
    pub listener_detached: bool,
    /// Per-frame operations in call order.
    pub calls: Vec<&'static str>,
    /// Makes `create_program` fail with a link error.
    pub reject_programs: bool,
    next_program: u64,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            next_program: 1,
            ..Default::default()
        }
    }

    pub fn without_low_latency() -> Self {
        let mut backend = Self::new();
        backend.attributes.low_latency = false;
        backend
    }

    pub fn last_uniforms(&self) -> Option<Vec<u8>> {
        self.uniform_writes.last().cloned()
    }

    pub fn lose_context(&mut self) {
        self.lost = true;
    }

    fn check_lost(&self) -> Result<(), RenderError> {
        if self.lost {
            Err(RenderError::ContextLost)
        } else {
            Ok(())
        }
    }
}

impl GpuBackend for FakeBackend {
    fn attributes(&self) -> ContextAttributes {
        self.attributes
    }

    fn adapter_info(&self) -> AdapterInfo {
        AdapterInfo {
            renderer: "Fake Renderer".to_string(),
            vendor: "Tests".to_string(),
        }
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.size = (width, height);
    }

    fn clear(&mut self, rgba: [f32; 4]) -> Result<(), RenderError> {
        self.check_lost()?;
        self.clears.push(rgba);
        Ok(())
    }

    fn create_program(&mut self, _program: &LinkedProgram) -> Result<ProgramId, ShaderError> {
        if self.reject_programs {
            return Err(ShaderError::Link {
                log: "rejected by backend".to_string(),
            });
        }
        let id = ProgramId(self.next_program.max(1));
        self.next_program = id.0 + 1;
        self.programs.push(id);
        Ok(id)
    }

    fn use_program(&mut self, id: ProgramId) {
        self.active = Some(id);
    }

    fn release_program(&mut self, id: ProgramId) {
        self.programs.retain(|p| *p != id);
        self.released.push(id);
        if self.active == Some(id) {
            self.active = None;
        }
    }

    fn upload_vertices(&mut self, vertices: &[QuadVertex]) {
        self.vertices = Some(vertices.to_vec());
    }

    fn create_texture(&mut self, params: TextureParams) {
        self.textures.push(params);
    }

    fn write_uniforms(&mut self, block: &[u8]) {
        self.calls.push("uniforms");
        self.uniform_writes.push(block.to_vec());
    }

    fn upload_texture(&mut self, frame: &VideoFrame) -> Result<(), RenderError> {
        self.check_lost()?;
        self.calls.push("upload");
        self.uploads.push(frame.clone());
        Ok(())
    }

    fn draw_strip(&mut self, vertex_count: u32) -> Result<(), RenderError> {
        self.check_lost()?;
        self.calls.push("draw");
        self.draws.push(vertex_count);
        Ok(())
    }

    fn read_pixels(&mut self) -> Result<VideoFrame, RenderError> {
        self.check_lost()?;
        let (width, height) = self.size;
        let mut frame = VideoFrame::new(width, height, PixelFormat::Rgba);
        frame.data.fill((self.draws.len() % 256) as u8);
        Ok(frame)
    }

    fn present(&mut self) -> Result<(), RenderError> {
        self.check_lost()?;
        self.presents += 1;
        Ok(())
    }

    fn is_context_lost(&self) -> bool {
        self.lost
    }

    fn detach_lost_listener(&mut self) {
        self.listener_detached = true;
    }
}
