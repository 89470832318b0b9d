//! Full-screen quad geometry.

use super::backend::GpuBackend;
use crate::error::MissingInterface;
use crate::frame::QuadVertex;
use crate::shader::{ProgramHandle, POSITION_ATTRIBUTE};

/// The constant triangle strip every effect is drawn with.
#[derive(Debug, Default)]
pub struct GeometryBuffer {
    uploaded: bool,
}

impl GeometryBuffer {
    pub const VERTEX_COUNT: u32 = QuadVertex::STRIP.len() as u32;

    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the strip to `aVertexPosition` of `program` and uploads it.
    pub fn setup<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        program: &ProgramHandle,
    ) -> Result<(), MissingInterface> {
        if !program.interface().has_attribute(POSITION_ATTRIBUTE) {
            return Err(MissingInterface::Attribute(POSITION_ATTRIBUTE.to_string()));
        }
        if !self.uploaded {
            backend.upload_vertices(QuadVertex::STRIP);
            self.uploaded = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::fake::{FakeBackend, NO_POSITION_VERTEX_SHADER};
    use crate::shader::{ShaderCompiler, DEFAULT_FRAGMENT_SHADER, VERTEX_SHADER};

    #[test]
    fn test_uploads_strip_once() {
        let mut backend = FakeBackend::new();
        let program = ShaderCompiler::compile_and_link(&mut backend, VERTEX_SHADER, DEFAULT_FRAGMENT_SHADER).unwrap();
        let mut geometry = GeometryBuffer::new();

        geometry.setup(&mut backend, &program).unwrap();
        backend.vertices = None;
        geometry.setup(&mut backend, &program).unwrap();

        assert!(backend.vertices.is_none());
        assert_eq!(GeometryBuffer::VERTEX_COUNT, 4);
    }

    #[test]
    fn test_program_without_position_attribute_is_rejected() {
        let mut backend = FakeBackend::new();
        let program =
            ShaderCompiler::compile_and_link(&mut backend, NO_POSITION_VERTEX_SHADER, DEFAULT_FRAGMENT_SHADER).unwrap();
        assert!(!program.interface().has_attribute(POSITION_ATTRIBUTE));

        let err = GeometryBuffer::new().setup(&mut backend, &program).unwrap_err();
        assert_eq!(err, MissingInterface::Attribute("aVertexPosition".to_string()));
        assert_eq!(err.to_string(), "Couldn't find attribute [aVertexPosition] location.");
        assert!(backend.vertices.is_none());
    }
}
