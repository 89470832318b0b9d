//! Starts and stops recordings and keeps the latest finished file.

use super::encoder::EncoderFactory;
use super::interrupt::{CancelSignal, HostEvent, HostState, Interrupt};
use super::{CaptureSession, CaptureSettings, CaptureState, FrameStream};
use crate::error::CaptureError;
use crate::logging::LogSink;
use crate::video::FrameSource;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// File name a finished recording is saved under.
pub const ARTIFACT_FILE_NAME: &str = "video.webm";

const BACKGROUND_WARNING: &str = "Shaderpunk does not support background recording. \
If the window is hidden or minimised, recording will stop and no video will be saved.";

/// A finished recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedArtifact {
    id: u64,
    file_name: String,
    bytes: Vec<u8>,
}

impl RecordedArtifact {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Writes the file into `dir`, creating it if needed.
    pub fn write_to(&self, dir: impl AsRef<Path>) -> io::Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(&self.file_name);
        self.write_to_path(&path)?;
        Ok(path)
    }

    pub fn write_to_path(&self, path: impl AsRef<Path>) -> io::Result<()> {
        fs::write(path, &self.bytes)
    }
}

/// What a tick did to the current recording.
#[derive(Debug)]
pub enum TickOutcome {
    Idle,
    Recording,
    /// A new artifact was installed.
    Completed { id: u64, size: usize },
    Skipped(Option<Interrupt>),
    Failed(CaptureError),
}

/// Owns at most one [`CaptureSession`] and the current artifact.
pub struct RecordingOrchestrator {
    factory: Box<dyn EncoderFactory>,
    settings: CaptureSettings,
    cancel: CancelSignal,
    host: HostState,
    session: Option<CaptureSession>,
    artifact: Option<RecordedArtifact>,
    next_artifact_id: u64,
    warned_background: bool,
    log: Arc<dyn LogSink>,
}

impl RecordingOrchestrator {
    pub fn new(factory: Box<dyn EncoderFactory>, settings: CaptureSettings, log: Arc<dyn LogSink>) -> Self {
        Self {
            factory,
            settings,
            cancel: CancelSignal::new(),
            host: HostState::default(),
            session: None,
            artifact: None,
            next_artifact_id: 1,
            warned_background: false,
            log,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    pub fn host_state(&self) -> HostState {
        self.host
    }

    pub fn artifact(&self) -> Option<&RecordedArtifact> {
        self.artifact.as_ref()
    }

    pub fn start(&mut self, source: Option<&mut dyn FrameSource>) -> Result<(), CaptureError> {
        if self.session.is_some() {
            return Err(CaptureError::AlreadyRecording);
        }
        if !self.warned_background {
            self.log.warn(BACKGROUND_WARNING);
            self.warned_background = true;
        }

        self.cancel.reset();
        let session = CaptureSession::start(
            source,
            self.factory.as_ref(),
            &self.settings,
            self.cancel.clone(),
            self.log.clone(),
        )
        .inspect_err(|e| self.log.error(&format!("Could not start recording: {}", e)))?;

        self.session = Some(session);
        self.log.info("Recording...");
        Ok(())
    }

    /// Requests cancellation; observed on the next tick.
    pub fn cancel(&self) {
        if self.session.is_some() {
            self.cancel.cancel();
        }
    }

    /// Records the new host state and forwards the event to the recording.
    pub fn handle_host_event(&mut self, event: HostEvent, source: &mut dyn FrameSource) -> Option<Interrupt> {
        self.host.apply(event);
        let session = self.session.as_mut()?;
        session.handle_host_event(event, self.host, source)
    }

    /// Drops the recording without producing a file, e.g. when the render
    /// surface is lost.
    pub fn abandon(&mut self, source: &mut dyn FrameSource) {
        if let Some(mut session) = self.session.take() {
            session.handle_host_event(HostEvent::CancelRequested, self.host, source);
            debug!(state = ?session.state(), "recording abandoned");
        }
    }

    /// Runs one capture iteration and settles the recording once it ends.
    pub fn tick(&mut self, stream: &mut dyn FrameStream, source: &mut dyn FrameSource) -> TickOutcome {
        let Some(session) = self.session.as_mut() else {
            return TickOutcome::Idle;
        };
        let state = session.step(stream, source, self.host);
        if !state.is_finished() {
            return TickOutcome::Recording;
        }
        let Some(session) = self.session.take() else {
            return TickOutcome::Idle;
        };

        let interrupt = session.interrupt_reason();
        match session.finish() {
            Ok(Some(bytes)) => {
                let size = bytes.len();
                let id = self.install(bytes);
                self.log.info("Recording complete.");
                TickOutcome::Completed { id, size }
            }
            Ok(None) => TickOutcome::Skipped(interrupt),
            Err(e) => {
                // Faults during the run were already reported by the session.
                if state != CaptureState::Failed {
                    self.log.error(&format!("Recording failed: {}", e));
                }
                TickOutcome::Failed(e)
            }
        }
    }

    fn install(&mut self, bytes: Vec<u8>) -> u64 {
        if let Some(previous) = self.artifact.take() {
            debug!(id = previous.id, "released previous recording");
        }
        let id = self.next_artifact_id;
        self.next_artifact_id += 1;
        self.artifact = Some(RecordedArtifact {
            id,
            file_name: ARTIFACT_FILE_NAME.to_string(),
            bytes,
        });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::fake::{FakeFactory, FakeStream};
    use crate::logging::{ConsoleLog, LogLevel};
    use crate::render::fake::FakeBackend;
    use crate::render::{RenderSession, SessionState};
    use crate::video::fake::FakeSource;

    fn orchestrator(factory: FakeFactory) -> (RecordingOrchestrator, Arc<ConsoleLog>) {
        let console = Arc::new(ConsoleLog::new());
        let orchestrator = RecordingOrchestrator::new(Box::new(factory), CaptureSettings::default(), console.clone());
        (orchestrator, console)
    }

    fn source() -> FakeSource {
        let mut source = FakeSource::new(16, 8);
        source.duration = Some(0.5);
        source
    }

    fn run(orchestrator: &mut RecordingOrchestrator, source: &mut FakeSource) -> TickOutcome {
        let mut stream = FakeStream::new(16, 8);
        for _ in 0..100 {
            match orchestrator.tick(&mut stream, source) {
                TickOutcome::Recording => source.advance(1.0 / 30.0),
                outcome => return outcome,
            }
        }
        TickOutcome::Recording
    }

    fn messages(console: &ConsoleLog) -> Vec<String> {
        console.entries().into_iter().map(|e| e.message).collect()
    }

    #[test]
    fn test_rejects_second_recording() {
        let (mut orchestrator, _) = orchestrator(FakeFactory::new());
        let mut source = source();
        orchestrator.start(Some(&mut source)).unwrap();
        assert!(matches!(
            orchestrator.start(Some(&mut source)),
            Err(CaptureError::AlreadyRecording)
        ));
    }

    #[test]
    fn test_missing_source_is_reported() {
        let (mut orchestrator, console) = orchestrator(FakeFactory::new());
        assert!(matches!(orchestrator.start(None), Err(CaptureError::NoSource)));
        assert!(!orchestrator.is_recording());
        assert_eq!(console.count(LogLevel::Error), 1);
    }

    #[test]
    fn test_completed_recording_installs_artifact() {
        let (mut orchestrator, console) = orchestrator(FakeFactory::new());
        let mut source = source();
        orchestrator.start(Some(&mut source)).unwrap();

        let outcome = run(&mut orchestrator, &mut source);
        assert!(matches!(outcome, TickOutcome::Completed { id: 1, .. }));
        assert!(!orchestrator.is_recording());

        let artifact = orchestrator.artifact().unwrap();
        assert_eq!(artifact.file_name(), "video.webm");
        assert!(!artifact.bytes().is_empty());

        let log = messages(&console);
        assert_eq!(log[0], "Recording complete.");
        assert!(log.contains(&"Recording...".to_string()));
    }

    #[test]
    fn test_new_artifact_replaces_previous() {
        let (mut orchestrator, console) = orchestrator(FakeFactory::new());
        let mut source = source();

        orchestrator.start(Some(&mut source)).unwrap();
        run(&mut orchestrator, &mut source);
        source.seek(0.0);
        orchestrator.start(Some(&mut source)).unwrap();
        run(&mut orchestrator, &mut source);

        assert_eq!(orchestrator.artifact().unwrap().id(), 2);
        let warnings = console.entries().into_iter().filter(|e| e.message == BACKGROUND_WARNING).count();
        assert_eq!(warnings, 1);
    }

    #[test]
    fn test_cancel_skips_without_artifact() {
        let (mut orchestrator, _) = orchestrator(FakeFactory::new());
        let mut source = source();
        orchestrator.start(Some(&mut source)).unwrap();
        orchestrator.cancel();

        let outcome = run(&mut orchestrator, &mut source);
        assert!(matches!(outcome, TickOutcome::Skipped(Some(Interrupt::UserCancelled))));
        assert!(orchestrator.artifact().is_none());
        assert!(source.paused);
    }

    #[test]
    fn test_hidden_window_skips_recording() {
        let (mut orchestrator, console) = orchestrator(FakeFactory::new());
        let mut source = source();
        orchestrator.start(Some(&mut source)).unwrap();
        assert_eq!(console.count(LogLevel::Warn), 1);

        let hidden = HostEvent::VisibilityChanged { hidden: true };
        assert_eq!(
            orchestrator.handle_host_event(hidden, &mut source),
            Some(Interrupt::TabHidden)
        );
        let outcome = run(&mut orchestrator, &mut source);
        assert!(matches!(outcome, TickOutcome::Skipped(Some(Interrupt::TabHidden))));
        assert_eq!(console.count(LogLevel::Warn), 2);
    }

    #[test]
    fn test_encoder_fault_fails_without_artifact() {
        let factory = FakeFactory {
            fail_at: Some(3),
            ..FakeFactory::default()
        };
        let (mut orchestrator, console) = orchestrator(factory);
        let mut source = source();
        orchestrator.start(Some(&mut source)).unwrap();

        let outcome = run(&mut orchestrator, &mut source);
        assert!(matches!(outcome, TickOutcome::Failed(CaptureError::EncoderFault(_))));
        assert!(orchestrator.artifact().is_none());
        assert_eq!(console.count(LogLevel::Error), 1);
    }

    #[test]
    fn test_abandon_restores_playback() {
        let (mut orchestrator, _) = orchestrator(FakeFactory::new());
        let mut source = source();
        orchestrator.start(Some(&mut source)).unwrap();
        assert!(!source.paused);

        orchestrator.abandon(&mut source);
        assert!(!orchestrator.is_recording());
        assert!(source.paused);
    }

    #[test]
    fn test_artifact_written_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = RecordedArtifact {
            id: 1,
            file_name: ARTIFACT_FILE_NAME.to_string(),
            bytes: vec![1, 2, 3],
        };

        let path = artifact.write_to(dir.path().join("out")).unwrap();
        assert_eq!(path.file_name().unwrap(), "video.webm");
        assert_eq!(fs::read(path).unwrap(), vec![1, 2, 3]);
    }

    fn new_surface(source: &mut FakeSource) -> RenderSession<FakeBackend> {
        let mut surface = RenderSession::new(FakeBackend::new(), Arc::new(ConsoleLog::new()));
        surface.initialize(source, None).unwrap();
        surface
    }

    fn draw_and_tick(
        orchestrator: &mut RecordingOrchestrator,
        surface: &mut RenderSession<FakeBackend>,
        source: &mut FakeSource,
    ) -> TickOutcome {
        for _ in 0..100 {
            let _ = surface.draw_frame(source);
            match orchestrator.tick(surface, source) {
                TickOutcome::Recording => source.advance(1.0 / 30.0),
                outcome => return outcome,
            }
        }
        TickOutcome::Recording
    }

    #[test]
    fn test_recording_waits_for_first_drawn_frame() {
        let (mut orchestrator, console) = orchestrator(FakeFactory::new());
        let mut source = source();
        source.starved = true;
        let mut surface = new_surface(&mut source);
        assert_eq!(surface.state(), SessionState::Ready);

        orchestrator.start(Some(&mut source)).unwrap();
        for _ in 0..3 {
            surface.draw_frame(&mut source).unwrap();
            assert!(matches!(
                orchestrator.tick(&mut surface, &mut source),
                TickOutcome::Recording
            ));
            source.advance(1.0 / 30.0);
        }
        assert!(orchestrator.is_recording());
        assert_eq!(surface.frames_drawn(), 0);

        source.starved = false;
        let outcome = draw_and_tick(&mut orchestrator, &mut surface, &mut source);
        assert!(matches!(outcome, TickOutcome::Completed { id: 1, .. }));
        assert!(!orchestrator.artifact().unwrap().bytes().is_empty());
        assert_eq!(console.count(LogLevel::Error), 0);
    }

    #[test]
    fn test_lost_surface_ends_recording() {
        let (mut orchestrator, _) = orchestrator(FakeFactory::new());
        let mut source = source();
        source.duration = None;
        let mut surface = new_surface(&mut source);
        orchestrator.start(Some(&mut source)).unwrap();

        for _ in 0..5 {
            surface.draw_frame(&mut source).unwrap();
            assert!(matches!(
                orchestrator.tick(&mut surface, &mut source),
                TickOutcome::Recording
            ));
            source.advance(1.0 / 30.0);
        }

        surface.backend_mut().lose_context();
        assert!(surface.draw_frame(&mut source).is_err());
        assert_eq!(surface.state(), SessionState::ContextLost);
        assert!(matches!(
            orchestrator.tick(&mut surface, &mut source),
            TickOutcome::Completed { .. }
        ));
    }
}
