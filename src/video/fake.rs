//! Scripted frame source for tests.

use super::FrameSource;
use crate::frame::{PixelFormat, VideoFrame};

#[derive(Debug, Clone)]
pub struct FakeSource {
    pub width: u32,
    pub height: u32,
    pub duration: Option<f64>,
    pub fps: f64,
    pub time: f64,
    pub paused: bool,
    pub looping: bool,
    /// `current_frame` returns `None` while set.
    pub starved: bool,
    pub seeks: Vec<f64>,
    frame: Option<VideoFrame>,
}

impl FakeSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            duration: Some(10.0),
            fps: 30.0,
            time: 0.0,
            paused: true,
            looping: false,
            starved: false,
            seeks: Vec::new(),
            frame: None,
        }
    }

    /// Moves the position forward when playing.
    pub fn advance(&mut self, seconds: f64) {
        if self.paused {
            return;
        }
        self.time += seconds;
        if let Some(duration) = self.duration {
            if self.time >= duration {
                if self.looping {
                    self.time %= duration;
                } else {
                    self.time = duration;
                    self.paused = true;
                }
            }
        }
    }
}

impl FrameSource for FakeSource {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn duration(&self) -> Option<f64> {
        self.duration
    }

    fn frame_rate(&self) -> f64 {
        self.fps
    }

    fn current_time(&self) -> f64 {
        self.time
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn play(&mut self) {
        self.paused = false;
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn is_looping(&self) -> bool {
        self.looping
    }

    fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    fn seek(&mut self, seconds: f64) {
        self.seeks.push(seconds);
        self.time = seconds;
    }

    fn current_frame(&mut self) -> Option<&VideoFrame> {
        if self.starved {
            return None;
        }
        let shade = ((self.time * 10.0) as u64 % 256) as u8;
        let mut frame = VideoFrame::new(self.width, self.height, PixelFormat::Rgba).with_timestamp(self.time);
        frame.data.fill(shade);
        self.frame = Some(frame);
        self.frame.as_ref()
    }
}
