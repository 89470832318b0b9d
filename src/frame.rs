//! Video frame types and the full-screen quad geometry.

use bytemuck::{Pod, Zeroable};
use std::path::Path;

/// Supported pixel formats for video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// RGB with 8 bits per channel (24 bits per pixel)
    Rgb,
    /// RGBA with 8 bits per channel (32 bits per pixel)
    Rgba,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb => 3,
            PixelFormat::Rgba => 4,
        }
    }
}

/// A video frame containing image data.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel format of the frame data
    pub format: PixelFormat,
    /// Presentation timestamp in microseconds (if available)
    pub timestamp_us: Option<u64>,
    /// Raw pixel data, rows top to bottom
    pub data: Vec<u8>,
}

impl VideoFrame {
    /// Creates a black frame with the given dimensions and format.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let size = (width as usize) * (height as usize) * format.bytes_per_pixel();
        Self {
            width,
            height,
            format,
            timestamp_us: None,
            data: vec![0; size],
        }
    }

    /// Creates a video frame from existing data.
    pub fn from_data(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            timestamp_us: None,
            data,
        }
    }

    pub fn with_timestamp(mut self, seconds: f64) -> Self {
        self.timestamp_us = Some((seconds.max(0.0) * 1_000_000.0).round() as u64);
        self
    }

    /// Timestamp in seconds, zero when unknown.
    pub fn timestamp_secs(&self) -> f64 {
        self.timestamp_us.map(|us| us as f64 / 1_000_000.0).unwrap_or(0.0)
    }

    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Converts this frame to RGBA format.
    pub fn to_rgba(&self) -> VideoFrame {
        if self.format == PixelFormat::Rgba {
            return self.clone();
        }

        let pixel_count = self.width as usize * self.height as usize;
        let mut rgba_data = vec![0u8; pixel_count * 4];
        for (dst, src) in rgba_data.chunks_exact_mut(4).zip(self.data.chunks_exact(3)) {
            dst[..3].copy_from_slice(src);
            dst[3] = 255;
        }

        VideoFrame {
            width: self.width,
            height: self.height,
            format: PixelFormat::Rgba,
            timestamp_us: self.timestamp_us,
            data: rgba_data,
        }
    }

    /// Writes the pixels into `out` as RGBA, bottom row first when
    /// `flip_y` is set. `out` is cleared but keeps its capacity.
    pub fn write_rgba_into(&self, out: &mut Vec<u8>, flip_y: bool) {
        out.clear();
        let row = self.row_bytes();
        if row == 0 {
            return;
        }
        out.reserve(self.width as usize * self.height as usize * 4);

        let format = self.format;
        let mut push_row = |src: &[u8]| match format {
            PixelFormat::Rgba => out.extend_from_slice(src),
            PixelFormat::Rgb => {
                for px in src.chunks_exact(3) {
                    out.extend_from_slice(&[px[0], px[1], px[2], 255]);
                }
            }
        };
        let rows = self.data.chunks_exact(row);
        if flip_y {
            rows.rev().for_each(&mut push_row);
        } else {
            rows.for_each(&mut push_row);
        }
    }

    /// Writes the frame as a PNG image.
    pub fn save_png(&self, path: impl AsRef<Path>) -> Result<(), image::ImageError> {
        let rgba = self.to_rgba();
        let image = image::RgbaImage::from_raw(rgba.width, rgba.height, rgba.data).ok_or_else(|| {
            image::ImageError::Parameter(image::error::ParameterError::from_kind(
                image::error::ParameterErrorKind::DimensionMismatch,
            ))
        })?;
        image.save_with_format(path, image::ImageFormat::Png)
    }
}

/// Vertex of the full-screen triangle strip.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 2],
}

impl QuadVertex {
    /// Two triangles covering clip space, in strip order.
    pub const STRIP: &'static [QuadVertex] = &[
        QuadVertex { position: [-1.0, 1.0] },
        QuadVertex { position: [1.0, 1.0] },
        QuadVertex { position: [-1.0, -1.0] },
        QuadVertex { position: [1.0, -1.0] },
    ];

    /// Returns the vertex buffer layout (`aVertexPosition` at location 0).
    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        const ATTRIBUTES: [wgpu::VertexAttribute; 1] = [wgpu::VertexAttribute {
            offset: 0,
            shader_location: 0,
            format: wgpu::VertexFormat::Float32x2,
        }];

        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &ATTRIBUTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_to_rgba_conversion() {
        let rgb_data = vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255];
        let frame = VideoFrame::from_data(2, 2, PixelFormat::Rgb, rgb_data);
        let rgba_frame = frame.to_rgba();

        assert_eq!(rgba_frame.format, PixelFormat::Rgba);
        assert_eq!(rgba_frame.data.len(), 16);
        assert_eq!(&rgba_frame.data[0..4], &[255, 0, 0, 255]);
        assert_eq!(&rgba_frame.data[4..8], &[0, 255, 0, 255]);
    }

    #[test]
    fn test_flip_reverses_rows_into_reused_buffer() {
        let data = vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3];
        let frame = VideoFrame::from_data(1, 3, PixelFormat::Rgba, data.clone());
        let mut out = Vec::new();

        frame.write_rgba_into(&mut out, true);
        assert_eq!(out, vec![3, 3, 3, 3, 2, 2, 2, 2, 1, 1, 1, 1]);

        let capacity = out.capacity();
        frame.write_rgba_into(&mut out, false);
        assert_eq!(out, data);
        assert_eq!(out.capacity(), capacity);
    }

    #[test]
    fn test_rgb_rows_expand_while_flipping() {
        let frame = VideoFrame::from_data(1, 2, PixelFormat::Rgb, vec![10, 20, 30, 40, 50, 60]);
        let mut out = vec![9; 64];

        frame.write_rgba_into(&mut out, true);
        assert_eq!(out, vec![40, 50, 60, 255, 10, 20, 30, 255]);
    }

    #[test]
    fn test_strip_covers_clip_space() {
        let xs: Vec<f32> = QuadVertex::STRIP.iter().map(|v| v.position[0]).collect();
        let ys: Vec<f32> = QuadVertex::STRIP.iter().map(|v| v.position[1]).collect();
        assert_eq!(QuadVertex::STRIP.len(), 4);
        assert!(xs.contains(&-1.0) && xs.contains(&1.0));
        assert!(ys.contains(&-1.0) && ys.contains(&1.0));
    }

    #[test]
    fn test_timestamp_round_trip() {
        let frame = VideoFrame::new(1, 1, PixelFormat::Rgba).with_timestamp(1.5);
        assert_eq!(frame.timestamp_us, Some(1_500_000));
        assert!((frame.timestamp_secs() - 1.5).abs() < 1e-9);
    }
}
