//! Shaderpunk: apply a GLSL fragment shader to a video and record the result.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use shaderpunk::capture::orchestrator::ARTIFACT_FILE_NAME;
use shaderpunk::capture::{
    CaptureSettings, FfmpegVp9Factory, HostEvent, RecordingOrchestrator, TickOutcome,
};
use shaderpunk::config::ShaderpunkConfig;
use shaderpunk::error::RenderError;
use shaderpunk::logging::{ConsoleLog, LogEntry, LogSink, TracingSink};
use shaderpunk::render::{RenderSession, SessionState, WgpuBackend};
use shaderpunk::utils::FpsCounter;
use shaderpunk::video::{FrameSource, VideoPlayer, UNKNOWN_DURATION_WARNING};
use shaderpunk::watch::ShaderWatcher;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowAttributes, WindowId};

/// Seconds skipped by the arrow keys.
const SEEK_STEP: f64 = 5.0;
/// Surface rebuilds attempted after the GPU context is lost.
const MAX_REBUILDS: u32 = 3;
const SNAPSHOT_FILE_NAME: &str = "frame.png";

/// Real-time shader effects for video files.
#[derive(Parser, Debug)]
#[command(name = "shaderpunk")]
#[command(about = "Apply a GLSL fragment shader to a video and record the result as WebM")]
struct Args {
    /// Video file to play
    video: PathBuf,

    /// Path to a GLSL fragment shader (hot reloaded on change)
    #[arg(short, long)]
    shader: Option<PathBuf>,

    /// Where to write the recording (default: <output_dir>/video.webm)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Start recording as soon as the video is ready
    #[arg(long)]
    record: bool,

    /// Render without a window, record the video once and exit
    #[arg(long)]
    headless: bool,

    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Encoder bitrate in bits per second
    #[arg(long)]
    bitrate: Option<u32>,

    /// Quiet period before a changed shader is reloaded
    #[arg(long)]
    debounce_ms: Option<u64>,
}

/// Command line merged over the config file.
#[derive(Debug, Clone)]
struct Settings {
    video: PathBuf,
    shader: Option<PathBuf>,
    output_dir: PathBuf,
    output: PathBuf,
    record: bool,
    headless: bool,
    bitrate: u32,
    debounce: Duration,
    max_setup_attempts: u32,
    title: String,
}

impl Settings {
    fn resolve(args: Args) -> Result<Self> {
        let config = match &args.config {
            Some(path) => ShaderpunkConfig::load(path)?,
            None => ShaderpunkConfig::default(),
        };
        let output_dir = config.output_dir.clone();
        let output = args.output.unwrap_or_else(|| output_dir.join(ARTIFACT_FILE_NAME));
        let debounce = args
            .debounce_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| config.debounce());

        Ok(Self {
            video: args.video,
            shader: args.shader.or(config.shader),
            output_dir,
            output,
            record: args.record,
            headless: args.headless,
            bitrate: args.bitrate.unwrap_or(config.bitrate),
            debounce,
            max_setup_attempts: config.max_setup_attempts,
            title: config.preview_title,
        })
    }

    fn capture(&self) -> CaptureSettings {
        CaptureSettings {
            bitrate: self.bitrate,
        }
    }
}

fn load_fragment(path: Option<&Path>, log: &dyn LogSink) -> Option<String> {
    let path = path?;
    info!("Loading shader from {:?}", path);
    match fs::read_to_string(path) {
        Ok(source) => Some(source),
        Err(e) => {
            log.error(&format!("Failed to read shader {}: {}. Using passthrough.", path.display(), e));
            None
        }
    }
}

fn open_video(path: &Path, log: &dyn LogSink) -> Result<VideoPlayer> {
    let player = VideoPlayer::open(path).inspect_err(|e| log.error(&e.to_string()))?;
    if player.duration().is_none() {
        log.warn(UNKNOWN_DURATION_WARNING);
    }
    Ok(player)
}

/// Handles a finished recording. Returns `true` once the recording is over.
fn settle(outcome: TickOutcome, orchestrator: &RecordingOrchestrator, output: &Path, log: &dyn LogSink) -> bool {
    match outcome {
        TickOutcome::Idle | TickOutcome::Recording => false,
        TickOutcome::Completed { id, size } => {
            debug!(id, size, "recording finished");
            if let Some(artifact) = orchestrator.artifact() {
                let written = output
                    .parent()
                    .filter(|dir| !dir.as_os_str().is_empty())
                    .map_or(Ok(()), fs::create_dir_all)
                    .and_then(|()| artifact.write_to_path(output));
                match written {
                    Ok(()) => log.info(&format!("Saved recording to {}", output.display())),
                    Err(e) => log.error(&format!("Failed to write {}: {}", output.display(), e)),
                }
            }
            true
        }
        TickOutcome::Skipped(reason) => {
            debug!(?reason, "recording skipped");
            true
        }
        TickOutcome::Failed(e) => {
            debug!("recording failed: {}", e);
            true
        }
    }
}

/// Application state for the event loop.
struct ShaderpunkApp {
    settings: Settings,
    console: Arc<ConsoleLog>,
    shown_entry: Option<LogEntry>,
    log: Arc<dyn LogSink>,
    interrupted: Arc<AtomicBool>,
    window: Option<Arc<Window>>,
    session: Option<RenderSession<WgpuBackend>>,
    source: Option<VideoPlayer>,
    orchestrator: RecordingOrchestrator,
    watcher: Option<ShaderWatcher>,
    fragment: Option<String>,
    fps: FpsCounter,
    last_frame_time: Instant,
    rebuilds: u32,
}

impl ShaderpunkApp {
    fn new(settings: Settings, console: Arc<ConsoleLog>, interrupted: Arc<AtomicBool>) -> Self {
        let log: Arc<dyn LogSink> = console.clone();
        let fragment = load_fragment(settings.shader.as_deref(), log.as_ref());
        let watcher = settings
            .shader
            .as_ref()
            .and_then(|path| ShaderWatcher::new(path, settings.debounce));
        let orchestrator = RecordingOrchestrator::new(Box::new(FfmpegVp9Factory), settings.capture(), log.clone());

        Self {
            settings,
            console,
            shown_entry: None,
            log,
            interrupted,
            window: None,
            session: None,
            source: None,
            orchestrator,
            watcher,
            fragment,
            fps: FpsCounter::new(),
            last_frame_time: Instant::now(),
            rebuilds: 0,
        }
    }

    /// Builds a render surface for `source`.
    fn attach(&mut self, mut source: VideoPlayer) -> Result<()> {
        let window = self.window.clone().ok_or_else(|| anyhow!("no window to render into"))?;

        let backend = WgpuBackend::new(Some(window.clone())).context("Failed to create GPU backend")?;
        let mut session =
            RenderSession::new(backend, self.log.clone()).with_max_setup_attempts(self.settings.max_setup_attempts);
        let size = window.inner_size();
        session.backend_mut().resize_surface(size.width, size.height);

        if let Err(e) = session.initialize(&mut source, self.fragment.as_deref()) {
            self.log.error(&e.to_string());
        }
        self.session = Some(session);
        self.source = Some(source);
        Ok(())
    }

    fn apply_shader(&mut self, fragment: String) {
        let (Some(session), Some(source)) = (self.session.as_mut(), self.source.as_mut()) else {
            self.fragment = Some(fragment);
            return;
        };

        let result = match session.state() {
            SessionState::Uninitialized if session.can_retry() => session.initialize(source, Some(&fragment)),
            SessionState::Uninitialized => {
                self.log
                    .error("Shader setup failed too many times. Restart to try again.");
                return;
            }
            _ => session.recompile(&fragment),
        };
        match result {
            Ok(()) => {
                self.log.info("Shader updated.");
                self.fragment = Some(fragment);
            }
            Err(e) => self.log.error(&e.to_string()),
        }
    }

    fn handle_key(&mut self, event: &KeyEvent, event_loop: &ActiveEventLoop) {
        if event.state != ElementState::Pressed || event.repeat {
            return;
        }
        match &event.logical_key {
            Key::Named(NamedKey::Escape) => event_loop.exit(),
            Key::Named(NamedKey::Space) => {
                if let Some(source) = self.source.as_mut() {
                    if source.is_paused() {
                        source.play();
                    } else {
                        source.pause();
                    }
                }
            }
            Key::Named(NamedKey::ArrowLeft) => self.seek_by(-SEEK_STEP),
            Key::Named(NamedKey::ArrowRight) => self.seek_by(SEEK_STEP),
            Key::Character(c) if c.eq_ignore_ascii_case("r") => self.start_recording(),
            // Stopping pauses the video; the recording then completes normally.
            Key::Character(c) if c.eq_ignore_ascii_case("s") => {
                if let Some(source) = self.source.as_mut() {
                    source.pause();
                }
            }
            Key::Character(c) if c.eq_ignore_ascii_case("p") => self.save_snapshot(),
            _ => {}
        }
    }

    fn seek_by(&mut self, delta: f64) {
        if let Some(source) = self.source.as_mut() {
            let target = source.current_time() + delta;
            source.seek(target);
        }
    }

    fn start_recording(&mut self) {
        let source = self.source.as_mut().map(|s| s as &mut dyn FrameSource);
        if let Err(e) = self.orchestrator.start(source) {
            debug!("recording not started: {}", e);
        }
    }

    fn save_snapshot(&mut self) {
        let Some(frame) = self.session.as_mut().and_then(|s| s.capture_frame()) else {
            self.log.warn("No rendered frame to save yet.");
            return;
        };
        let path = self.settings.output_dir.join(SNAPSHOT_FILE_NAME);
        match frame.save_png(&path) {
            Ok(()) => self.log.info(&format!("Saved frame to {}", path.display())),
            Err(e) => self.log.error(&format!("Failed to save {}: {}", path.display(), e)),
        }
    }

    fn host_event(&mut self, event: HostEvent) {
        if let Some(source) = self.source.as_mut() {
            self.orchestrator.handle_host_event(event, source);
        }
    }

    /// Shows the newest console line in the window title.
    fn show_latest_entry(&mut self) {
        let Some(entry) = self.console.latest() else {
            return;
        };
        if self.shown_entry.as_ref() == Some(&entry) {
            return;
        }
        if let Some(window) = &self.window {
            let line = entry.message.lines().next().unwrap_or_default();
            window.set_title(&format!("{} | {}", self.settings.title, line));
        }
        self.shown_entry = Some(entry);
    }

    fn process_frame(&mut self, event_loop: &ActiveEventLoop) {
        if self.interrupted.swap(false, Ordering::SeqCst) {
            if self.orchestrator.is_recording() {
                self.orchestrator.cancel();
            } else {
                info!("Received interrupt signal, shutting down...");
                event_loop.exit();
                return;
            }
        }

        if let Some(fragment) = self.watcher.as_mut().and_then(|w| w.poll()) {
            self.apply_shader(fragment);
        }
        self.show_latest_entry();

        let (Some(session), Some(source)) = (self.session.as_mut(), self.source.as_mut()) else {
            return;
        };

        match session.draw_frame(source) {
            Ok(_) => {
                if let Some(fps) = self.fps.update() {
                    debug!("[Perf] Rendering at {:.2} FPS", fps);
                }
            }
            Err(e) if e.is_context_lost() => {
                self.rebuild(event_loop);
                return;
            }
            Err(RenderError::NotReady(_)) => {}
            Err(e) => error!("Render error: {}", e),
        }

        let outcome = self.orchestrator.tick(session, source);
        settle(outcome, &self.orchestrator, &self.settings.output, self.log.as_ref());
    }

    /// Drops the lost surface and its source and attaches a fresh pair.
    fn rebuild(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(source) = self.source.as_mut() {
            self.orchestrator.abandon(source);
        }
        if let Some(mut session) = self.session.take() {
            session.teardown();
        }
        self.source = None;

        self.rebuilds += 1;
        if self.rebuilds > MAX_REBUILDS {
            error!("GPU context lost {} times, giving up", self.rebuilds);
            event_loop.exit();
            return;
        }
        info!("Rebuilding render surface");
        let reattached = open_video(&self.settings.video, self.log.as_ref()).and_then(|source| self.attach(source));
        if let Err(e) = reattached {
            error!("Failed to rebuild render surface: {:#}", e);
            event_loop.exit();
        }
    }

    fn frame_duration(&self) -> Duration {
        let fps = self.source.as_ref().map_or(30.0, |s| s.frame_rate());
        Duration::from_secs_f64(1.0 / fps.max(1.0))
    }
}

impl ApplicationHandler for ShaderpunkApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let source = match open_video(&self.settings.video, self.log.as_ref()) {
            Ok(source) => source,
            Err(e) => {
                error!("Initialization error: {:#}", e);
                event_loop.exit();
                return;
            }
        };
        let (width, height) = source.dimensions();
        let window_attrs = WindowAttributes::default()
            .with_title(self.settings.title.clone())
            .with_inner_size(PhysicalSize::new(width, height));

        match event_loop.create_window(window_attrs) {
            Ok(window) => {
                self.window = Some(Arc::new(window));
                info!("Window created successfully");
                if let Err(e) = self.attach(source) {
                    error!("Initialization error: {:#}", e);
                    event_loop.exit();
                    return;
                }
                if self.settings.record {
                    self.start_recording();
                }
            }
            Err(e) => {
                error!("Failed to create window: {}", e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Window closed");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(session) = &mut self.session {
                    session.backend_mut().resize_surface(size.width, size.height);
                }
            }
            WindowEvent::Focused(focused) => self.host_event(HostEvent::FocusChanged { focused }),
            WindowEvent::Occluded(hidden) => self.host_event(HostEvent::VisibilityChanged { hidden }),
            WindowEvent::KeyboardInput { event, .. } => self.handle_key(&event, event_loop),
            WindowEvent::RedrawRequested => {
                let now = Instant::now();
                if now.duration_since(self.last_frame_time) >= self.frame_duration() {
                    self.process_frame(event_loop);
                    self.last_frame_time = now;
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        let wants_redraw = self.session.as_ref().map_or(true, |s| s.wants_redraw());
        if let Some(window) = &self.window {
            if wants_redraw || self.interrupted.load(Ordering::SeqCst) {
                window.request_redraw();
            }
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(source) = self.source.as_mut() {
            self.orchestrator.abandon(source);
        }
        if let Some(session) = &mut self.session {
            session.teardown();
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::resolve(Args::parse())?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })?;

    info!("Starting Shaderpunk...");
    if settings.headless {
        run_headless(settings, Arc::new(TracingSink), interrupted)
    } else {
        run_window_mode(settings, Arc::new(ConsoleLog::new()), interrupted)
    }
}

/// Run with a preview window (default).
fn run_window_mode(settings: Settings, console: Arc<ConsoleLog>, interrupted: Arc<AtomicBool>) -> Result<()> {
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = ShaderpunkApp::new(settings, console, interrupted);
    event_loop.run_app(&mut app)?;

    Ok(())
}

/// Render offscreen, record the whole video once and exit.
fn run_headless(settings: Settings, log: Arc<dyn LogSink>, interrupted: Arc<AtomicBool>) -> Result<()> {
    let mut source = open_video(&settings.video, log.as_ref())?;
    let fragment = load_fragment(settings.shader.as_deref(), log.as_ref());

    let backend = WgpuBackend::new(None)?;
    let mut session = RenderSession::new(backend, log.clone()).with_max_setup_attempts(settings.max_setup_attempts);
    session.initialize(&mut source, fragment.as_deref())?;

    let mut orchestrator = RecordingOrchestrator::new(Box::new(FfmpegVp9Factory), settings.capture(), log.clone());
    orchestrator.start(Some(&mut source))?;

    let frame_duration = Duration::from_secs_f64(1.0 / source.frame_rate().max(1.0));
    let mut fps = FpsCounter::new();
    info!("Recording {:?} headless at {:.2} fps", settings.video, source.frame_rate());

    loop {
        let frame_start = Instant::now();
        if interrupted.swap(false, Ordering::SeqCst) {
            orchestrator.cancel();
        }

        match session.draw_frame(&mut source) {
            Ok(_) => {
                if let Some(rate) = fps.update() {
                    info!("Headless: {:.2} FPS", rate);
                }
            }
            Err(RenderError::NotReady(_)) => {}
            Err(e) => {
                orchestrator.abandon(&mut source);
                session.teardown();
                return Err(e.into());
            }
        }

        let outcome = orchestrator.tick(&mut session, &mut source);
        if settle(outcome, &orchestrator, &settings.output, log.as_ref()) {
            break;
        }

        let elapsed = frame_start.elapsed();
        if elapsed < frame_duration {
            thread::sleep(frame_duration - elapsed);
        }
    }

    session.teardown();
    Ok(())
}
