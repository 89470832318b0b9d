//! The render session: one GPU surface drawing one video through the active
//! shader program.

pub mod backend;
#[cfg(test)]
pub mod fake;
pub mod geometry;
pub mod texture;
pub mod wgpu_backend;

pub use backend::GpuBackend;
pub use geometry::GeometryBuffer;
pub use texture::FrameTexture;
pub use wgpu_backend::WgpuBackend;

use crate::error::{RenderError, ShaderError};
use crate::frame::VideoFrame;
use crate::logging::LogSink;
use crate::shader::{
    ProgramHandle, ShaderCompiler, UniformBinder, Uniforms, DEFAULT_FRAGMENT_SHADER, FRAME_SAMPLER,
    RESOLUTION_UNIFORM, TIME_UNIFORM, VERTEX_SHADER,
};
use crate::video::FrameSource;
use std::sync::Arc;
use tracing::debug;

/// Failed setups tolerated before automatic retries stop.
pub const DEFAULT_MAX_SETUP_ATTEMPTS: u32 = 3;

const CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Ready,
    Drawing,
    ContextLost,
    TornDown,
}

impl SessionState {
    pub fn is_drawable(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Drawing)
    }
}

/// Whether the host should keep requesting frames for the session.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrawLoop {
    scheduled: bool,
}

impl DrawLoop {
    pub fn schedule(&mut self) {
        self.scheduled = true;
    }

    pub fn cancel(&mut self) {
        self.scheduled = false;
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }
}

pub struct RenderSession<B: GpuBackend> {
    backend: B,
    log: Arc<dyn LogSink>,
    state: SessionState,
    program: Option<ProgramHandle>,
    texture: Option<FrameTexture>,
    geometry: GeometryBuffer,
    uniforms: UniformBinder,
    draw_loop: DrawLoop,
    vertex_source: &'static str,
    frames_drawn: u64,
    failed_setups: u32,
    max_setup_attempts: u32,
}

impl<B: GpuBackend> RenderSession<B> {
    pub fn new(backend: B, log: Arc<dyn LogSink>) -> Self {
        Self {
            backend,
            log,
            state: SessionState::Uninitialized,
            program: None,
            texture: None,
            geometry: GeometryBuffer::new(),
            uniforms: UniformBinder::new(),
            draw_loop: DrawLoop::default(),
            vertex_source: VERTEX_SHADER,
            frames_drawn: 0,
            failed_setups: 0,
            max_setup_attempts: DEFAULT_MAX_SETUP_ATTEMPTS,
        }
    }

    pub fn with_max_setup_attempts(mut self, attempts: u32) -> Self {
        self.max_setup_attempts = attempts.max(1);
        self
    }

    /// Prepares the surface for `source` and draws the first frame.
    ///
    /// Uses the passthrough effect when `fragment_source` is `None`. On any
    /// failure the session is left `Uninitialized`.
    pub fn initialize(
        &mut self,
        source: &mut dyn FrameSource,
        fragment_source: Option<&str>,
    ) -> Result<(), RenderError> {
        if matches!(self.state, SessionState::ContextLost | SessionState::TornDown) {
            return Err(RenderError::NotReady(self.state));
        }

        let attributes = self.backend.attributes();
        if !attributes.low_latency {
            self.log
                .warn("Low latency rendering is not supported. Video playback may lag or stutter.");
        }
        self.log
            .info(&format!("Renderer: [{}]", self.backend.adapter_info().describe()));

        match self.setup(source, fragment_source.unwrap_or(DEFAULT_FRAGMENT_SHADER)) {
            Ok(()) => {
                self.failed_setups = 0;
                self.state = SessionState::Ready;
                self.draw_loop.schedule();
                self.log.info("Canvas ready.");
                self.draw_frame(source)?;
                Ok(())
            }
            Err(e) => {
                self.failed_setups += 1;
                self.state = SessionState::Uninitialized;
                if let Some(program) = self.program.take() {
                    self.backend.release_program(program.id());
                }
                Err(e)
            }
        }
    }

    fn setup(&mut self, source: &mut dyn FrameSource, fragment_source: &str) -> Result<(), RenderError> {
        let (width, height) = source.dimensions();
        self.backend.resize(width, height);
        self.backend.clear(CLEAR_COLOR)?;

        let program = ShaderCompiler::compile_and_link(&mut self.backend, self.vertex_source, fragment_source)?;
        let texture = FrameTexture::create(&mut self.backend, width, height);

        let bound = self
            .geometry
            .setup(&mut self.backend, &program)
            .and_then(|()| texture.bind(&program, FRAME_SAMPLER));
        if let Err(missing) = bound {
            self.backend.release_program(program.id());
            return Err(ShaderError::from(missing).into());
        }

        if let Some(previous) = self.program.replace(program) {
            self.backend.release_program(previous.id());
        }
        self.texture = Some(texture);
        Ok(())
    }

    /// Swaps in a new fragment shader, keeping the current one on failure.
    pub fn recompile(&mut self, fragment_source: &str) -> Result<(), RenderError> {
        if !self.state.is_drawable() {
            return Err(RenderError::NotReady(self.state));
        }

        let program = ShaderCompiler::compile_and_link(&mut self.backend, self.vertex_source, fragment_source)?;

        let bound = self.geometry.setup(&mut self.backend, &program).and_then(|()| match &self.texture {
            Some(texture) => texture.bind(&program, FRAME_SAMPLER),
            None => Err(crate::error::MissingInterface::Sampler(FRAME_SAMPLER.to_string())),
        });
        if let Err(missing) = bound {
            self.backend.release_program(program.id());
            if let Some(current) = &self.program {
                self.backend.use_program(current.id());
            }
            return Err(ShaderError::from(missing).into());
        }

        debug!("Activated program {:?}", program.id());
        if let Some(previous) = self.program.replace(program) {
            self.backend.release_program(previous.id());
        }
        Ok(())
    }

    /// Draws the source's current frame with the active program.
    ///
    /// Returns the number of frames drawn so far. A frame is skipped, not an
    /// error, while the source has nothing decoded yet.
    pub fn draw_frame(&mut self, source: &mut dyn FrameSource) -> Result<u64, RenderError> {
        if self.backend.is_context_lost() {
            self.on_context_lost();
            return Err(RenderError::ContextLost);
        }
        if !self.state.is_drawable() {
            return Err(RenderError::NotReady(self.state));
        }
        let Some(program) = &self.program else {
            return Err(RenderError::NotReady(self.state));
        };

        let time = source.current_time() as f32;
        let (width, height) = source.dimensions();
        self.uniforms.bind(
            &mut self.backend,
            &program.interface().uniforms,
            &[
                (TIME_UNIFORM, &[time]),
                (RESOLUTION_UNIFORM, &[width as f32, height as f32]),
            ],
        );

        let Some(frame) = source.current_frame() else {
            return Ok(self.frames_drawn);
        };

        let result = match self.texture.as_mut() {
            Some(texture) => texture.upload(&mut self.backend, frame),
            None => Err(RenderError::NotReady(self.state)),
        }
        .and_then(|()| self.backend.draw_strip(GeometryBuffer::VERTEX_COUNT))
        .and_then(|()| self.backend.present());

        match result {
            Ok(()) => {
                self.state = SessionState::Drawing;
                self.frames_drawn += 1;
                Ok(self.frames_drawn)
            }
            Err(RenderError::ContextLost) => {
                self.on_context_lost();
                Err(RenderError::ContextLost)
            }
            Err(e) => Err(e),
        }
    }

    /// Marks the surface unusable. The host must drop it and rebuild.
    pub fn on_context_lost(&mut self) {
        if self.state == SessionState::ContextLost {
            return;
        }
        self.state = SessionState::ContextLost;
        self.draw_loop.cancel();
        self.log.error(&RenderError::ContextLost.to_string());
    }

    /// Stops drawing and detaches from the backend.
    pub fn teardown(&mut self) {
        if self.state == SessionState::TornDown {
            return;
        }
        self.log.info("Cleaning up canvas.");
        self.draw_loop.cancel();
        self.backend.detach_lost_listener();
        if let Some(program) = self.program.take() {
            self.backend.release_program(program.id());
        }
        self.state = SessionState::TornDown;
    }

    /// Reads back the last drawn frame, top row first.
    pub fn capture_frame(&mut self) -> Option<VideoFrame> {
        if self.state != SessionState::Drawing {
            return None;
        }
        match self.backend.read_pixels() {
            Ok(frame) => Some(frame),
            Err(RenderError::ContextLost) => {
                self.on_context_lost();
                None
            }
            Err(e) => {
                self.log.error(&format!("Failed to read rendered frame: {}", e));
                None
            }
        }
    }

    /// `true` while the host should keep scheduling draws.
    pub fn wants_redraw(&self) -> bool {
        self.draw_loop.is_scheduled() && self.state.is_drawable()
    }

    /// A failed setup may be retried automatically.
    pub fn can_retry(&self) -> bool {
        self.failed_setups < self.max_setup_attempts
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn program(&self) -> Option<&ProgramHandle> {
        self.program.as_ref()
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames_drawn
    }

    pub fn uniforms(&self) -> Uniforms {
        self.uniforms.current()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MissingInterface;
    use crate::logging::{ConsoleLog, LogLevel};
    use crate::render::fake::{FakeBackend, NO_POSITION_VERTEX_SHADER};
    use crate::video::fake::FakeSource;

    const NO_FRAME_SHADER: &str = r#"#version 450
layout(location = 0) in vec2 aTextureCoord;
layout(location = 0) out vec4 oColor;
void main() { oColor = vec4(aTextureCoord, 0.0, 1.0); }
"#;

    const GRAYSCALE_SHADER: &str = r#"#version 450
layout(location = 0) in vec2 aTextureCoord;
layout(set = 0, binding = 0) uniform texture2D uFrame;
layout(set = 0, binding = 1) uniform sampler uSampler;
layout(location = 0) out vec4 oColor;
void main() {
    vec4 c = texture(sampler2D(uFrame, uSampler), aTextureCoord);
    float g = dot(c.rgb, vec3(0.299, 0.587, 0.114));
    oColor = vec4(g, g, g, c.a);
}
"#;

    fn new_session(backend: FakeBackend) -> (RenderSession<FakeBackend>, Arc<ConsoleLog>) {
        let console = Arc::new(ConsoleLog::new());
        (RenderSession::new(backend, console.clone()), console)
    }

    fn ready_session() -> (RenderSession<FakeBackend>, Arc<ConsoleLog>, FakeSource) {
        let (mut session, console) = new_session(FakeBackend::new());
        let mut source = FakeSource::new(64, 48);
        session.initialize(&mut source, None).unwrap();
        (session, console, source)
    }

    fn messages(console: &ConsoleLog) -> Vec<String> {
        console.entries().into_iter().map(|e| e.message).collect()
    }

    #[test]
    fn test_initialize_prepares_surface() {
        let (session, console, _source) = ready_session();
        let backend = session.backend();

        assert_eq!(session.state(), SessionState::Drawing);
        assert_eq!(backend.size, (64, 48));
        assert_eq!(backend.clears, vec![[0.0, 0.0, 0.0, 1.0]]);
        assert!(backend.textures[0].flip_y);
        assert!(backend.textures[0].linear_min_filter);
        assert_eq!(backend.vertices.as_ref().unwrap().len(), 4);
        assert!(session.wants_redraw());

        let log = messages(&console);
        assert!(log.contains(&"Renderer: [Fake Renderer (Tests)]".to_string()));
        assert!(log.contains(&"Canvas ready.".to_string()));
        assert_eq!(console.count(LogLevel::Warn), 0);
    }

    #[test]
    fn test_warns_without_low_latency() {
        let (mut session, console) = new_session(FakeBackend::without_low_latency());
        session.initialize(&mut FakeSource::new(8, 8), None).unwrap();

        assert_eq!(console.count(LogLevel::Warn), 1);
        assert_eq!(
            console.entries().last().unwrap().message,
            "Low latency rendering is not supported. Video playback may lag or stutter."
        );
    }

    #[test]
    fn test_missing_frame_sampler_leaves_session_uninitialized() {
        let (mut session, _console) = new_session(FakeBackend::new());
        let err = session
            .initialize(&mut FakeSource::new(8, 8), Some(NO_FRAME_SHADER))
            .unwrap_err();

        assert!(matches!(
            err,
            RenderError::Shader(ShaderError::MissingInterface(MissingInterface::Sampler(ref name))) if name == "uFrame"
        ));
        assert_eq!(err.to_string(), "Couldn't find sampler [uFrame] location.");
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(session.program().is_none());
        assert!(session.backend().programs.is_empty());
    }

    #[test]
    fn test_setup_retries_are_capped() {
        let (session, _console) = new_session(FakeBackend::new());
        let mut session = session.with_max_setup_attempts(2);
        let mut source = FakeSource::new(8, 8);

        assert!(session.can_retry());
        let _ = session.initialize(&mut source, Some(NO_FRAME_SHADER));
        assert!(session.can_retry());
        let _ = session.initialize(&mut source, Some(NO_FRAME_SHADER));
        assert!(!session.can_retry());
    }

    #[test]
    fn test_failed_recompile_keeps_previous_program() {
        let (mut session, _console, mut source) = ready_session();
        let before = session.program().unwrap().clone();

        let err = session.recompile("#version 450\nvoid main() { oColor = ; }").unwrap_err();
        assert!(matches!(err, RenderError::Shader(ShaderError::Compile { .. })));
        assert_eq!(session.program(), Some(&before));
        assert_eq!(session.backend().active, Some(before.id()));

        session.draw_frame(&mut source).unwrap();
        assert_eq!(session.backend().active, Some(before.id()));
    }

    #[test]
    fn test_recompile_without_sampler_restores_previous_program() {
        let (mut session, _console, _source) = ready_session();
        let before = session.program().unwrap().id();

        assert!(session.recompile(NO_FRAME_SHADER).is_err());
        assert_eq!(session.backend().active, Some(before));
        assert_eq!(session.backend().programs, vec![before]);
    }

    #[test]
    fn test_recompile_without_position_attribute_keeps_previous_program() {
        let (mut session, _console, mut source) = ready_session();
        let before = session.program().unwrap().clone();
        session.vertex_source = NO_POSITION_VERTEX_SHADER;

        let err = session.recompile(GRAYSCALE_SHADER).unwrap_err();
        assert!(matches!(
            err,
            RenderError::Shader(ShaderError::MissingInterface(MissingInterface::Attribute(ref name))) if name == "aVertexPosition"
        ));
        assert_eq!(session.program(), Some(&before));
        assert_eq!(session.backend().active, Some(before.id()));
        assert_eq!(session.backend().programs, vec![before.id()]);

        session.draw_frame(&mut source).unwrap();
        assert_eq!(session.backend().active, Some(before.id()));
    }

    #[test]
    fn test_recompile_replaces_and_releases_program() {
        let (mut session, _console, _source) = ready_session();
        let before = session.program().unwrap().id();

        session.recompile(GRAYSCALE_SHADER).unwrap();
        let after = session.program().unwrap();

        assert_ne!(after.id(), before);
        assert_eq!(after.fragment_source(), GRAYSCALE_SHADER);
        assert_eq!(session.backend().released, vec![before]);
        assert_eq!(session.backend().programs, vec![after.id()]);
    }

    #[test]
    fn test_identical_recompile_is_idempotent() {
        let (mut session, _console, _source) = ready_session();
        session.recompile(GRAYSCALE_SHADER).unwrap();
        let first = session.program().unwrap().interface().clone();

        session.recompile(GRAYSCALE_SHADER).unwrap();
        assert_eq!(session.program().unwrap().interface(), &first);
        assert_eq!(session.backend().programs.len(), 1);
        assert!(session.state().is_drawable());
    }

    #[test]
    fn test_draw_order_is_uniforms_upload_draw() {
        let (mut session, _console, mut source) = ready_session();
        session.backend_mut().calls.clear();

        session.draw_frame(&mut source).unwrap();
        assert_eq!(session.backend().calls, vec!["uniforms", "upload", "draw"]);
    }

    #[test]
    fn test_resolution_fixed_and_time_monotonic() {
        let (mut session, _console, mut source) = ready_session();
        source.play();

        let mut last_time = session.uniforms().time;
        for _ in 0..5 {
            source.advance(0.1);
            session.draw_frame(&mut source).unwrap();
            let uniforms = session.uniforms();
            assert_eq!(uniforms.resolution, [64.0, 48.0]);
            assert!(uniforms.time >= last_time);
            last_time = uniforms.time;
        }
        assert_eq!(session.frames_drawn(), 6);
    }

    #[test]
    fn test_starved_source_skips_frame() {
        let (mut session, _console, mut source) = ready_session();
        source.starved = true;
        let drawn = session.frames_drawn();

        assert_eq!(session.draw_frame(&mut source).unwrap(), drawn);
        assert_eq!(session.backend().draws.len() as u64, drawn);
    }

    #[test]
    fn test_context_loss_stops_drawing() {
        let (mut session, console, mut source) = ready_session();
        session.backend_mut().lose_context();

        let err = session.draw_frame(&mut source).unwrap_err();
        assert!(err.is_context_lost());
        assert_eq!(session.state(), SessionState::ContextLost);
        assert!(!session.wants_redraw());
        assert!(session.capture_frame().is_none());
        assert_eq!(console.count(LogLevel::Error), 1);

        assert!(session.draw_frame(&mut source).is_err());
        assert_eq!(console.count(LogLevel::Error), 1);
    }

    #[test]
    fn test_teardown_detaches_listener() {
        let (mut session, console, mut source) = ready_session();
        session.teardown();

        assert_eq!(session.state(), SessionState::TornDown);
        assert!(session.backend().listener_detached);
        assert!(!session.wants_redraw());
        assert!(session.draw_frame(&mut source).is_err());
        assert_eq!(console.entries()[0].message, "Cleaning up canvas.");
    }

    #[test]
    fn test_capture_frame_reads_back_drawn_image() {
        let (mut session, _console) = new_session(FakeBackend::new());
        assert!(session.capture_frame().is_none());

        session.initialize(&mut FakeSource::new(16, 8), None).unwrap();
        let frame = session.capture_frame().unwrap();
        assert_eq!((frame.width, frame.height), (16, 8));
        assert_eq!(frame.data.len(), 16 * 8 * 4);
    }
}
