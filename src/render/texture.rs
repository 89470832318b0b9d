//! The texture holding the current video frame.

use super::backend::{GpuBackend, TextureParams};
use crate::error::{MissingInterface, RenderError};
use crate::frame::VideoFrame;
use crate::shader::ProgramHandle;

#[derive(Debug)]
pub struct FrameTexture {
    params: TextureParams,
}

impl FrameTexture {
    /// Allocates a texture for `width`x`height` frames. Rows are flipped on
    /// upload and minification is linear.
    pub fn create<B: GpuBackend + ?Sized>(backend: &mut B, width: u32, height: u32) -> Self {
        let params = TextureParams {
            width,
            height,
            flip_y: true,
            linear_min_filter: true,
        };
        backend.create_texture(params);
        Self { params }
    }

    /// Checks that `program` samples the frame through `sampler`.
    pub fn bind(&self, program: &ProgramHandle, sampler: &str) -> Result<(), MissingInterface> {
        if program.interface().has_sampler(sampler) {
            Ok(())
        } else {
            Err(MissingInterface::Sampler(sampler.to_string()))
        }
    }

    /// Overwrites the texture with `frame`, which must match its size.
    pub fn upload<B: GpuBackend + ?Sized>(&mut self, backend: &mut B, frame: &VideoFrame) -> Result<(), RenderError> {
        if (frame.width, frame.height) != (self.params.width, self.params.height) {
            return Err(RenderError::Backend(format!(
                "frame is {}x{} but the texture is {}x{}",
                frame.width, frame.height, self.params.width, self.params.height
            )));
        }
        backend.upload_texture(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use crate::render::fake::FakeBackend;

    #[test]
    fn test_create_flips_rows_and_filters_linearly() {
        let mut backend = FakeBackend::new();
        FrameTexture::create(&mut backend, 16, 9);

        assert_eq!(backend.textures.len(), 1);
        assert_eq!((backend.textures[0].width, backend.textures[0].height), (16, 9));
        assert!(backend.textures[0].flip_y);
        assert!(backend.textures[0].linear_min_filter);
    }

    #[test]
    fn test_upload_rejects_mismatched_frame() {
        let mut backend = FakeBackend::new();
        let mut texture = FrameTexture::create(&mut backend, 16, 9);

        texture
            .upload(&mut backend, &VideoFrame::new(16, 9, PixelFormat::Rgba))
            .unwrap();
        let err = texture
            .upload(&mut backend, &VideoFrame::new(8, 8, PixelFormat::Rgba))
            .unwrap_err();

        assert!(matches!(err, RenderError::Backend(_)));
        assert_eq!(backend.uploads.len(), 1);
    }
}
