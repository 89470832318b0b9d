//! wgpu implementation of [`GpuBackend`].
//!
//! Effects render into an offscreen `Rgba8Unorm` target so every frame can be
//! read back for capture. When a window is attached the target is blitted to
//! its surface on [`GpuBackend::present`].

use super::backend::{AdapterInfo, ContextAttributes, GpuBackend, ProgramId, TextureParams};
use crate::error::{RenderError, ShaderError};
use crate::frame::{PixelFormat, QuadVertex, VideoFrame};
use crate::shader::compiler::{ENTRY_POINT, FRAME_SAMPLER_BINDING, FRAME_TEXTURE_BINDING, RUNTIME_UNIFORM_BINDING};
use crate::shader::uniforms::MAX_UNIFORM_BLOCK_SIZE;
use crate::shader::LinkedProgram;
use anyhow::{anyhow, Result};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use wgpu::util::DeviceExt;
use winit::window::Window;

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Copies the offscreen target onto the window surface.
const BLIT_SHADER: &str = r#"
@group(0) @binding(0) var t_image: texture_2d<f32>;
@group(0) @binding(1) var s_image: sampler;

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VertexOutput {
    let x = f32(i32(index & 1u) * 4 - 1);
    let y = f32(i32(index >> 1u) * 4 - 1);
    var out: VertexOutput;
    out.clip_position = vec4<f32>(x, y, 0.0, 1.0);
    out.uv = vec2<f32>((x + 1.0) * 0.5, (1.0 - y) * 0.5);
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(t_image, s_image, in.uv);
}
"#;

struct RenderTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

struct FrameTextureGpu {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    sampler: wgpu::Sampler,
    params: TextureParams,
}

struct Readback {
    buffer: wgpu::Buffer,
    padded_row: u32,
    width: u32,
    height: u32,
}

struct Presenter {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    bind_group: Option<wgpu::BindGroup>,
}

/// GPU backend built on wgpu.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_info: AdapterInfo,
    attributes: ContextAttributes,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    programs: HashMap<ProgramId, wgpu::RenderPipeline>,
    next_program: u64,
    active_program: Option<ProgramId>,
    vertex_buffer: Option<wgpu::Buffer>,
    uniform_buffer: wgpu::Buffer,
    frame_texture: FrameTextureGpu,
    bind_group: wgpu::BindGroup,
    target: RenderTarget,
    readback: Option<Readback>,
    presenter: Option<Presenter>,
    /// Reused for frames that need flipping or RGB expansion before upload.
    upload_scratch: Vec<u8>,
    lost: Arc<AtomicBool>,
}

impl WgpuBackend {
    /// Creates a backend. With a window, frames are also presented to it;
    /// without one the backend renders offscreen only.
    pub fn new(window: Option<Arc<Window>>) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = match &window {
            Some(window) => Some(instance.create_surface(window.clone())?),
            None => None,
        };

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: surface.as_ref(),
            force_fallback_adapter: false,
        }))
        .map_err(|e| anyhow!("Failed to find GPU adapter: {:?}", e))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Shaderpunk Device"),
            required_features: wgpu::Features::empty(),
            required_limits: if surface.is_some() {
                wgpu::Limits::default()
            } else {
                wgpu::Limits::downlevel_defaults()
            },
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))?;

        let lost = Arc::new(AtomicBool::new(false));
        let lost_flag = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            warn!("GPU device lost ({:?}): {}", reason, message);
            lost_flag.store(true, Ordering::SeqCst);
        });

        let info = adapter.get_info();
        let adapter_info = AdapterInfo {
            renderer: info.name.clone(),
            vendor: if info.driver.is_empty() {
                format!("{:?}", info.backend)
            } else {
                format!("{:?}, {}", info.backend, info.driver)
            },
        };

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Effect Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: FRAME_TEXTURE_BINDING,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: FRAME_SAMPLER_BINDING,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: RUNTIME_UNIFORM_BINDING,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Effect Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Runtime Uniform Buffer"),
            size: MAX_UNIFORM_BLOCK_SIZE as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        // 1x1 black stand-in until the video texture is created.
        let frame_texture = create_frame_texture(
            &device,
            TextureParams {
                width: 1,
                height: 1,
                flip_y: false,
                linear_min_filter: true,
            },
        );
        let bind_group = create_bind_group(&device, &bind_group_layout, &frame_texture, &uniform_buffer);

        let size = window.as_ref().map(|w| w.inner_size());
        let target = create_target(
            &device,
            size.map(|s| s.width).unwrap_or(1),
            size.map(|s| s.height).unwrap_or(1),
        );

        let (presenter, low_latency) = match surface {
            Some(surface) => {
                let (width, height) = size.map(|s| (s.width, s.height)).unwrap_or((1, 1));
                let (presenter, low_latency) = Presenter::new(&device, &adapter, surface, width, height);
                (Some(presenter), low_latency)
            }
            None => (None, true),
        };

        let mut backend = Self {
            device,
            queue,
            adapter_info,
            attributes: ContextAttributes {
                low_latency,
                read_back: true,
                preserve_buffer: true,
            },
            bind_group_layout,
            pipeline_layout,
            programs: HashMap::new(),
            next_program: 1,
            active_program: None,
            vertex_buffer: None,
            uniform_buffer,
            frame_texture,
            bind_group,
            target,
            readback: None,
            presenter,
            upload_scratch: Vec::new(),
            lost,
        };
        backend.rebind_presenter();

        info!("GPU backend ready on {}", backend.adapter_info.describe());
        Ok(backend)
    }

    /// Reconfigures the window surface after the window was resized.
    pub fn resize_surface(&mut self, width: u32, height: u32) {
        if let Some(presenter) = &mut self.presenter {
            if width > 0 && height > 0 {
                presenter.config.width = width;
                presenter.config.height = height;
                presenter.surface.configure(&self.device, &presenter.config);
            }
        }
    }

    fn rebind_presenter(&mut self) {
        if let Some(presenter) = &mut self.presenter {
            presenter.bind_group = Some(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Present Bind Group"),
                layout: &presenter.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&self.target.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&presenter.sampler),
                    },
                ],
            }));
        }
    }

    fn check_lost(&self) -> Result<(), RenderError> {
        if self.lost.load(Ordering::SeqCst) {
            Err(RenderError::ContextLost)
        } else {
            Ok(())
        }
    }

    fn ensure_readback(&mut self) {
        let (width, height) = (self.target.width, self.target.height);
        let stale = self
            .readback
            .as_ref()
            .map(|r| r.width != width || r.height != height)
            .unwrap_or(true);
        if !stale {
            return;
        }

        let padded_row = padded_bytes_per_row(width);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: (padded_row * height) as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        self.readback = Some(Readback {
            buffer,
            padded_row,
            width,
            height,
        });
    }

    fn pass<'a>(
        encoder: &'a mut wgpu::CommandEncoder,
        view: &'a wgpu::TextureView,
        label: &str,
        clear: wgpu::Color,
    ) -> wgpu::RenderPass<'a> {
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(label),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(clear),
                    store: wgpu::StoreOp::Store,
                },
                depth_slice: None,
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        })
    }
}

impl Presenter {
    fn new(
        device: &wgpu::Device,
        adapter: &wgpu::Adapter,
        surface: wgpu::Surface<'static>,
        width: u32,
        height: u32,
    ) -> (Self, bool) {
        let caps = surface.get_capabilities(adapter);
        // The offscreen target already holds display-encoded values.
        let format = caps
            .formats
            .iter()
            .find(|f| !f.is_srgb())
            .copied()
            .unwrap_or(caps.formats[0]);
        let low_latency = caps.present_modes.contains(&wgpu::PresentMode::Mailbox);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: width.max(1),
            height: height.max(1),
            present_mode: if low_latency {
                wgpu::PresentMode::Mailbox
            } else {
                wgpu::PresentMode::AutoVsync
            },
            alpha_mode: caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: if low_latency { 1 } else { 2 },
        };
        surface.configure(device, &config);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Present Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(BLIT_SHADER)),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Present Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Present Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Present Pipeline"),
            layout: Some(&layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &module,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Present Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        (
            Self {
                surface,
                config,
                pipeline,
                bind_group_layout,
                sampler,
                bind_group: None,
            },
            low_latency,
        )
    }
}

fn create_target(device: &wgpu::Device, width: u32, height: u32) -> RenderTarget {
    let (width, height) = (width.max(1), height.max(1));
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Effect Target"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TARGET_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::TEXTURE_BINDING,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    RenderTarget {
        texture,
        view,
        width,
        height,
    }
}

fn create_frame_texture(device: &wgpu::Device, params: TextureParams) -> FrameTextureGpu {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Frame Texture"),
        size: wgpu::Extent3d {
            width: params.width.max(1),
            height: params.height.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8Unorm,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("Frame Sampler"),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: if params.linear_min_filter {
            wgpu::FilterMode::Linear
        } else {
            wgpu::FilterMode::Nearest
        },
        ..Default::default()
    });
    FrameTextureGpu {
        texture,
        view,
        sampler,
        params,
    }
}

fn create_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    frame: &FrameTextureGpu,
    uniforms: &wgpu::Buffer,
) -> wgpu::BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("Effect Bind Group"),
        layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: FRAME_TEXTURE_BINDING,
                resource: wgpu::BindingResource::TextureView(&frame.view),
            },
            wgpu::BindGroupEntry {
                binding: FRAME_SAMPLER_BINDING,
                resource: wgpu::BindingResource::Sampler(&frame.sampler),
            },
            wgpu::BindGroupEntry {
                binding: RUNTIME_UNIFORM_BINDING,
                resource: uniforms.as_entire_binding(),
            },
        ],
    })
}

/// Row pitch of a texture-to-buffer copy of `width` RGBA pixels.
pub(crate) fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width * 4;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

/// Drops row padding from a mapped read-back buffer.
pub(crate) fn strip_row_padding(data: &[u8], width: u32, height: u32, padded_row: u32) -> Vec<u8> {
    let row = (width * 4) as usize;
    let mut pixels = Vec::with_capacity(row * height as usize);
    for chunk in data.chunks(padded_row as usize).take(height as usize) {
        pixels.extend_from_slice(&chunk[..row.min(chunk.len())]);
    }
    pixels
}

impl GpuBackend for WgpuBackend {
    fn attributes(&self) -> ContextAttributes {
        self.attributes
    }

    fn adapter_info(&self) -> AdapterInfo {
        self.adapter_info.clone()
    }

    fn resize(&mut self, width: u32, height: u32) {
        if self.target.width == width.max(1) && self.target.height == height.max(1) {
            return;
        }
        debug!("Resizing drawing buffer to {}x{}", width, height);
        self.target = create_target(&self.device, width, height);
        self.rebind_presenter();
    }

    fn clear(&mut self, rgba: [f32; 4]) -> Result<(), RenderError> {
        self.check_lost()?;
        let color = wgpu::Color {
            r: rgba[0] as f64,
            g: rgba[1] as f64,
            b: rgba[2] as f64,
            a: rgba[3] as f64,
        };
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Clear Encoder"),
        });
        drop(Self::pass(&mut encoder, &self.target.view, "Clear Pass", color));
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn create_program(&mut self, program: &LinkedProgram) -> Result<ProgramId, ShaderError> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(ShaderError::Link {
                log: "GPU context is lost".to_string(),
            });
        }

        let vertex_module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Vertex Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(&program.vertex_wgsl)),
        });
        let fragment_module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Fragment Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(&program.fragment_wgsl)),
        });

        let id = ProgramId(self.next_program);
        self.next_program += 1;

        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&format!("Effect Pipeline {}", id.0)),
            layout: Some(&self.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &vertex_module,
                entry_point: Some(ENTRY_POINT),
                buffers: &[QuadVertex::layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &fragment_module,
                entry_point: Some(ENTRY_POINT),
                targets: &[Some(wgpu::ColorTargetState {
                    format: TARGET_FORMAT,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleStrip,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });

        self.programs.insert(id, pipeline);
        Ok(id)
    }

    fn use_program(&mut self, id: ProgramId) {
        if self.programs.contains_key(&id) {
            self.active_program = Some(id);
        }
    }

    fn release_program(&mut self, id: ProgramId) {
        self.programs.remove(&id);
        if self.active_program == Some(id) {
            self.active_program = None;
        }
    }

    fn upload_vertices(&mut self, vertices: &[QuadVertex]) {
        self.vertex_buffer = Some(self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Quad Vertex Buffer"),
            contents: bytemuck::cast_slice(vertices),
            usage: wgpu::BufferUsages::VERTEX,
        }));
    }

    fn create_texture(&mut self, params: TextureParams) {
        self.frame_texture = create_frame_texture(&self.device, params);
        self.bind_group = create_bind_group(
            &self.device,
            &self.bind_group_layout,
            &self.frame_texture,
            &self.uniform_buffer,
        );
    }

    fn write_uniforms(&mut self, block: &[u8]) {
        let len = block.len().min(MAX_UNIFORM_BLOCK_SIZE as usize);
        if len == 0 || len % wgpu::COPY_BUFFER_ALIGNMENT as usize != 0 {
            return;
        }
        self.queue.write_buffer(&self.uniform_buffer, 0, &block[..len]);
    }

    fn upload_texture(&mut self, frame: &VideoFrame) -> Result<(), RenderError> {
        self.check_lost()?;

        let params = self.frame_texture.params;
        if frame.width != params.width || frame.height != params.height {
            self.create_texture(TextureParams {
                width: frame.width,
                height: frame.height,
                ..params
            });
        }

        let pixels: &[u8] = if frame.format == PixelFormat::Rgba && !params.flip_y {
            &frame.data
        } else {
            frame.write_rgba_into(&mut self.upload_scratch, params.flip_y);
            &self.upload_scratch
        };

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.frame_texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(frame.width * 4),
                rows_per_image: Some(frame.height),
            },
            wgpu::Extent3d {
                width: frame.width,
                height: frame.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn draw_strip(&mut self, vertex_count: u32) -> Result<(), RenderError> {
        self.check_lost()?;

        let pipeline = self
            .active_program
            .and_then(|id| self.programs.get(&id))
            .ok_or_else(|| RenderError::Backend("no program in use".to_string()))?;
        let vertices = self
            .vertex_buffer
            .as_ref()
            .ok_or_else(|| RenderError::Backend("no vertex data uploaded".to_string()))?;

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Effect Encoder"),
        });
        {
            let mut pass = Self::pass(&mut encoder, &self.target.view, "Effect Pass", wgpu::Color::BLACK);
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.set_vertex_buffer(0, vertices.slice(..));
            pass.draw(0..vertex_count, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn read_pixels(&mut self) -> Result<VideoFrame, RenderError> {
        self.check_lost()?;

        self.ensure_readback();
        let (width, height) = (self.target.width, self.target.height);
        let readback = self
            .readback
            .as_ref()
            .ok_or_else(|| RenderError::Backend("readback buffer missing".to_string()))?;
        let padded_row = readback.padded_row;

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback Encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback.buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback.buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| RenderError::Backend(e.to_string()))?;
        receiver
            .recv()
            .map_err(|e| RenderError::Backend(e.to_string()))?
            .map_err(|e| RenderError::Backend(e.to_string()))?;

        let pixels = {
            let data = slice.get_mapped_range();
            strip_row_padding(&data, width, height, padded_row)
        };
        readback.buffer.unmap();
        self.check_lost()?;

        Ok(VideoFrame::from_data(width, height, PixelFormat::Rgba, pixels))
    }

    fn present(&mut self) -> Result<(), RenderError> {
        self.check_lost()?;
        let Some(presenter) = &self.presenter else {
            return Ok(());
        };
        let Some(bind_group) = &presenter.bind_group else {
            return Ok(());
        };

        let output = match presenter.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                presenter.surface.configure(&self.device, &presenter.config);
                return Ok(());
            }
            Err(wgpu::SurfaceError::Timeout) => return Ok(()),
            Err(e) => return Err(RenderError::Backend(e.to_string())),
        };
        let view = output.texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Present Encoder"),
        });
        {
            let mut pass = Self::pass(&mut encoder, &view, "Present Pass", wgpu::Color::BLACK);
            pass.set_pipeline(&presenter.pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();
        Ok(())
    }

    fn is_context_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn detach_lost_listener(&mut self) {
        self.device.set_device_lost_callback(|_, _| {});
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_are_padded_to_copy_alignment() {
        assert_eq!(padded_bytes_per_row(64), 256);
        assert_eq!(padded_bytes_per_row(65), 512);
        assert_eq!(padded_bytes_per_row(1), 256);
    }

    #[test]
    fn test_strip_row_padding() {
        let padded_row = padded_bytes_per_row(2);
        let mut data = vec![0u8; (padded_row * 2) as usize];
        data[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        data[padded_row as usize..padded_row as usize + 8].copy_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16]);

        let pixels = strip_row_padding(&data, 2, 2, padded_row);
        assert_eq!(pixels, (1..=16).collect::<Vec<u8>>());
    }
}
