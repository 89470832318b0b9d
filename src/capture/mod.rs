//! Recording of the rendered output.
//!
//! A [`CaptureSession`] reads frames back from the render surface once per
//! tick, feeds them to a VP9 encoder and collects the encoded chunks in a
//! WebM muxer. The [`orchestrator`] owns at most one session at a time.

pub mod encoder;
pub mod interrupt;
pub mod orchestrator;
pub mod webm;

#[cfg(test)]
pub mod fake;

pub use encoder::{EncodedChunk, EncoderConfig, EncoderFactory, FfmpegVp9Factory, VideoEncoder, DEFAULT_BITRATE};
pub use interrupt::{CancelSignal, HostEvent, HostState, Interrupt, InterruptRegistry, Trigger};
pub use orchestrator::{RecordedArtifact, RecordingOrchestrator, TickOutcome};
pub use webm::WebmMuxer;

use crate::error::CaptureError;
use crate::frame::VideoFrame;
use crate::logging::LogSink;
use crate::render::{GpuBackend, RenderSession, SessionState};
use crate::video::FrameSource;
use std::sync::Arc;
use tracing::{debug, info};

/// Frames encoded per tick at most when the loop falls behind the source.
const MAX_CATCH_UP: u64 = 4;

/// Live output of a render surface.
pub trait FrameStream {
    /// `false` once the surface can no longer produce frames.
    fn is_active(&self) -> bool;

    /// `false` while the surface is live but has not drawn a frame yet.
    fn has_frame(&self) -> bool;

    /// The most recently rendered frame, or `None` when the stream ended.
    fn read_frame(&mut self) -> Option<VideoFrame>;
}

impl<B: GpuBackend> FrameStream for RenderSession<B> {
    fn is_active(&self) -> bool {
        self.state().is_drawable()
    }

    fn has_frame(&self) -> bool {
        self.state() == SessionState::Drawing
    }

    fn read_frame(&mut self) -> Option<VideoFrame> {
        self.capture_frame()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Recording,
    Finalizing,
    Done,
    Skipped,
    Failed,
}

impl CaptureState {
    pub fn is_finished(self) -> bool {
        self != CaptureState::Idle && self != CaptureState::Recording
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureSettings {
    pub bitrate: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            bitrate: DEFAULT_BITRATE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitReason {
    Cancelled,
    Hidden,
    StreamEnded,
    SourceEnded,
    SourcePaused,
}

/// Playback state to put back when recording stops.
#[derive(Debug, Clone, Copy)]
struct PlaybackSnapshot {
    paused: bool,
    looping: bool,
}

/// One recording attempt.
pub struct CaptureSession {
    state: CaptureState,
    encoder: Box<dyn VideoEncoder>,
    muxer: WebmMuxer,
    cancel: CancelSignal,
    registry: InterruptRegistry,
    skip: bool,
    interrupt: Option<Interrupt>,
    fault: Option<CaptureError>,
    snapshot: PlaybackSnapshot,
    start_time: f64,
    end_time: Option<f64>,
    frame_rate: f64,
    /// Index of the next frame slot on the source timeline.
    next_slot: u64,
    frames_encoded: u64,
    stream_active: bool,
    cleaned_up: bool,
    log: Arc<dyn LogSink>,
}

impl CaptureSession {
    /// Starts recording `source` from its current position.
    pub fn start(
        source: Option<&mut dyn FrameSource>,
        factory: &dyn EncoderFactory,
        settings: &CaptureSettings,
        cancel: CancelSignal,
        log: Arc<dyn LogSink>,
    ) -> Result<Self, CaptureError> {
        let source = source.ok_or(CaptureError::NoSource)?;
        let (width, height) = source.dimensions();
        let config = EncoderConfig::vp9(width, height, settings.bitrate, source.frame_rate());
        let encoder = factory.create(&config)?;

        let snapshot = PlaybackSnapshot {
            paused: source.is_paused(),
            looping: source.is_looping(),
        };
        source.set_looping(false);
        source.play();

        let mut registry = InterruptRegistry::new();
        for trigger in Trigger::ALL {
            registry.register(trigger);
        }

        info!(width, height, bitrate = config.bitrate, fps = config.frame_rate, "capture started");
        Ok(Self {
            state: CaptureState::Recording,
            encoder,
            muxer: WebmMuxer::new(width, height),
            cancel,
            registry,
            skip: false,
            interrupt: None,
            fault: None,
            snapshot,
            start_time: source.current_time(),
            end_time: source.duration(),
            frame_rate: config.frame_rate,
            next_slot: 0,
            frames_encoded: 0,
            stream_active: true,
            cleaned_up: false,
            log,
        })
    }

    /// Runs one acquisition iteration and returns the resulting state.
    pub fn step(&mut self, stream: &mut dyn FrameStream, source: &mut dyn FrameSource, host: HostState) -> CaptureState {
        if self.state != CaptureState::Recording {
            return self.state;
        }

        if let Some(reason) = self.exit_reason(stream, source, host) {
            match reason {
                ExitReason::Cancelled => self.interrupt(Interrupt::UserCancelled, source),
                ExitReason::Hidden => self.interrupt(Interrupt::TabHidden, source),
                _ => self.complete(reason, source),
            }
            return self.state;
        }

        // Frame slots start counting at the first drawn frame.
        if !stream.has_frame() {
            if self.next_slot == 0 {
                self.start_time = source.current_time();
            }
            return self.state;
        }

        let due = self.due_frames(source.current_time());
        if due == 0 {
            return self.state;
        }

        let Some(frame) = stream.read_frame() else {
            self.complete(ExitReason::StreamEnded, source);
            return self.state;
        };
        for _ in 0..due {
            if let Err(e) = self.encoder.encode(&frame) {
                self.fail(e, source);
                return self.state;
            }
            self.frames_encoded += 1;
        }
        drop(frame);

        if let Err(e) = self.drain() {
            self.fail(e, source);
        }
        self.state
    }

    /// Routes a host event to the registered listeners.
    pub fn handle_host_event(
        &mut self,
        event: HostEvent,
        host: HostState,
        source: &mut dyn FrameSource,
    ) -> Option<Interrupt> {
        if self.state != CaptureState::Recording {
            return None;
        }
        let interrupt = self.registry.dispatch(event, host, self.stream_active)?;
        self.interrupt(interrupt, source);
        Some(interrupt)
    }

    /// Flushes the encoder and returns the finished WebM bytes, or `None`
    /// when the recording was skipped.
    pub fn finish(mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        match self.state {
            CaptureState::Recording => return Err(CaptureError::StillRecording),
            CaptureState::Skipped | CaptureState::Idle | CaptureState::Done => return Ok(None),
            CaptureState::Failed => {
                return Err(self
                    .fault
                    .take()
                    .unwrap_or_else(|| CaptureError::EncoderFault("unknown failure".into())))
            }
            CaptureState::Finalizing => {}
        }

        for chunk in self.encoder.flush()? {
            self.muxer.add_chunk(&chunk)?;
        }
        if self.muxer.block_count() == 0 {
            return Err(CaptureError::Mux("no frames were captured".into()));
        }
        let bytes = self.muxer.finalize()?;
        self.state = CaptureState::Done;
        debug!(
            frames = self.frames_encoded,
            clusters = self.muxer.cluster_count(),
            bytes = bytes.len(),
            "capture finalized"
        );
        Ok(Some(bytes))
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn skipped(&self) -> bool {
        self.skip
    }

    pub fn interrupt_reason(&self) -> Option<Interrupt> {
        self.interrupt
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    pub fn listeners(&self) -> &InterruptRegistry {
        &self.registry
    }

    fn exit_reason(&self, stream: &dyn FrameStream, source: &dyn FrameSource, host: HostState) -> Option<ExitReason> {
        if self.cancel.is_cancelled() {
            Some(ExitReason::Cancelled)
        } else if host.hidden {
            Some(ExitReason::Hidden)
        } else if !self.stream_active || !stream.is_active() {
            Some(ExitReason::StreamEnded)
        } else if self.end_time.is_some_and(|end| source.current_time() >= end) {
            Some(ExitReason::SourceEnded)
        } else if source.is_paused() {
            Some(ExitReason::SourcePaused)
        } else {
            None
        }
    }

    /// Number of frame slots the source has moved through since the last
    /// encoded frame.
    fn due_frames(&mut self, position: f64) -> u64 {
        let elapsed = (position - self.start_time).max(0.0);
        let reached = (elapsed * self.frame_rate + 1e-6).floor() as u64 + 1;
        if reached <= self.next_slot {
            return 0;
        }
        let due = reached - self.next_slot;
        self.next_slot = reached;
        due.min(MAX_CATCH_UP)
    }

    fn drain(&mut self) -> Result<(), CaptureError> {
        for chunk in self.encoder.take_chunks()? {
            self.muxer.add_chunk(&chunk)?;
        }
        Ok(())
    }

    fn complete(&mut self, reason: ExitReason, source: &mut dyn FrameSource) {
        debug!(?reason, frames = self.frames_encoded, "capture loop finished");
        self.cleanup(source);
        self.state = CaptureState::Finalizing;
    }

    fn interrupt(&mut self, interrupt: Interrupt, source: &mut dyn FrameSource) {
        if self.skip {
            return;
        }
        self.skip = true;
        self.interrupt = Some(interrupt);
        debug!(%interrupt, "capture interrupted");
        self.log.warn("Recording stopped.");
        self.cleanup(source);
        self.state = CaptureState::Skipped;
    }

    fn fail(&mut self, error: CaptureError, source: &mut dyn FrameSource) {
        self.log.error(&error.to_string());
        self.fault = Some(error);
        self.cleanup(source);
        self.state = CaptureState::Failed;
    }

    fn cleanup(&mut self, source: &mut dyn FrameSource) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        self.stream_active = false;

        source.set_looping(self.snapshot.looping);
        if self.snapshot.paused {
            source.pause();
        } else {
            source.play();
        }
        self.registry.clear();
    }
}
