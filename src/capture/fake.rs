//! Scripted encoder and frame stream for capture tests.

use super::encoder::{EncodedChunk, EncoderConfig, EncoderFactory, VideoEncoder};
use super::FrameStream;
use crate::error::CaptureError;
use crate::frame::{PixelFormat, VideoFrame};
use std::sync::{Arc, Mutex};

/// What a [`FakeEncoder`] saw, shared with the test.
#[derive(Debug, Default)]
pub struct EncoderLog {
    pub configs: Vec<EncoderConfig>,
    pub encoded: usize,
    pub flushed: bool,
}

pub struct FakeEncoder {
    frame_us: u64,
    pending: Vec<EncodedChunk>,
    fail_at: Option<usize>,
    log: Arc<Mutex<EncoderLog>>,
}

impl VideoEncoder for FakeEncoder {
    fn encode(&mut self, frame: &VideoFrame) -> Result<(), CaptureError> {
        let mut log = self.log.lock().unwrap();
        if self.fail_at == Some(log.encoded) {
            return Err(CaptureError::EncoderFault("scripted failure".into()));
        }
        let index = log.encoded as u64;
        log.encoded += 1;
        self.pending.push(EncodedChunk {
            data: frame.data.iter().take(8).copied().collect(),
            timestamp_us: index * self.frame_us,
            keyframe: index % 10 == 0,
        });
        Ok(())
    }

    fn take_chunks(&mut self) -> Result<Vec<EncodedChunk>, CaptureError> {
        Ok(std::mem::take(&mut self.pending))
    }

    fn flush(&mut self) -> Result<Vec<EncodedChunk>, CaptureError> {
        self.log.lock().unwrap().flushed = true;
        self.take_chunks()
    }
}

#[derive(Default)]
pub struct FakeFactory {
    pub log: Arc<Mutex<EncoderLog>>,
    /// Encoding fails on the frame with this index.
    pub fail_at: Option<usize>,
    /// `create` itself fails.
    pub unavailable: bool,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encoded(&self) -> usize {
        self.log.lock().unwrap().encoded
    }
}

impl EncoderFactory for FakeFactory {
    fn create(&self, config: &EncoderConfig) -> Result<Box<dyn VideoEncoder>, CaptureError> {
        if self.unavailable {
            return Err(CaptureError::EncoderFault("no encoder".into()));
        }
        self.log.lock().unwrap().configs.push(config.clone());
        Ok(Box::new(FakeEncoder {
            frame_us: (1_000_000.0 / config.frame_rate) as u64,
            pending: Vec::new(),
            fail_at: self.fail_at,
            log: self.log.clone(),
        }))
    }
}

/// Produces solid frames until `remaining` runs out.
pub struct FakeStream {
    pub width: u32,
    pub height: u32,
    pub remaining: Option<usize>,
    pub drawn: bool,
    pub reads: usize,
}

impl FakeStream {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            remaining: None,
            drawn: true,
            reads: 0,
        }
    }
}

impl FrameStream for FakeStream {
    fn is_active(&self) -> bool {
        self.remaining != Some(0)
    }

    fn has_frame(&self) -> bool {
        self.drawn
    }

    fn read_frame(&mut self) -> Option<VideoFrame> {
        match &mut self.remaining {
            Some(0) => return None,
            Some(n) => *n -= 1,
            None => {}
        }
        self.reads += 1;
        let mut frame = VideoFrame::new(self.width, self.height, PixelFormat::Rgba);
        frame.data.fill(self.reads as u8);
        Some(frame)
    }
}
