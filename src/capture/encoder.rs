//! VP9 encoding through an `ffmpeg` subprocess.
//!
//! Raw RGBA frames go in on stdin; an IVF stream comes back on stdout and a
//! reader thread splits it into [`EncodedChunk`]s.

use crate::error::CaptureError;
use crate::frame::{PixelFormat, VideoFrame};
use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Codec string of the recording.
pub const VP9_CODEC: &str = "vp09.00.10.08";
/// Default target bitrate in bits per second.
pub const DEFAULT_BITRATE: u32 = 7_000_000;

const IVF_SIGNATURE: &[u8; 4] = b"DKIF";
const IVF_HEADER_LEN: usize = 32;
const IVF_FRAME_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub bitrate: u32,
    pub frame_rate: f64,
}

impl EncoderConfig {
    pub fn vp9(width: u32, height: u32, bitrate: u32, frame_rate: f64) -> Self {
        Self {
            codec: VP9_CODEC.to_string(),
            width,
            height,
            bitrate,
            frame_rate: if frame_rate > 0.0 { frame_rate } else { 30.0 },
        }
    }
}

/// One compressed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub data: Vec<u8>,
    pub timestamp_us: u64,
    pub keyframe: bool,
}

/// Frame-by-frame video encoder.
pub trait VideoEncoder {
    fn encode(&mut self, frame: &VideoFrame) -> Result<(), CaptureError>;

    /// Chunks finished since the last call.
    fn take_chunks(&mut self) -> Result<Vec<EncodedChunk>, CaptureError>;

    /// Waits for every submitted frame and returns the remaining chunks.
    fn flush(&mut self) -> Result<Vec<EncodedChunk>, CaptureError>;
}

/// Creates an encoder per recording.
pub trait EncoderFactory {
    fn create(&self, config: &EncoderConfig) -> Result<Box<dyn VideoEncoder>, CaptureError>;
}

/// `true` when `data` starts a VP9 key frame.
pub fn vp9_is_keyframe(data: &[u8]) -> bool {
    let bit = |pos: usize| -> Option<u8> { data.get(pos / 8).map(|b| (b >> (7 - pos % 8)) & 1) };

    // frame_marker
    if bit(0) != Some(1) || bit(1) != Some(0) {
        return false;
    }
    let (Some(low), Some(high)) = (bit(2), bit(3)) else {
        return false;
    };
    let mut pos = 4;
    if (high << 1 | low) == 3 {
        pos += 1;
    }
    // show_existing_frame
    if bit(pos) != Some(0) {
        return false;
    }
    // frame_type: 0 is KEY_FRAME
    bit(pos + 1) == Some(0)
}

/// Splits an IVF stream into chunks.
pub struct IvfReader<R> {
    inner: R,
    rate: u32,
    scale: u32,
}

impl<R: Read> IvfReader<R> {
    pub fn new(mut inner: R) -> io::Result<Self> {
        let mut header = [0u8; IVF_HEADER_LEN];
        inner.read_exact(&mut header)?;
        if &header[0..4] != IVF_SIGNATURE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not an IVF stream"));
        }
        let rate = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
        let scale = u32::from_le_bytes([header[20], header[21], header[22], header[23]]);
        Ok(Self {
            inner,
            rate: rate.max(1),
            scale: scale.max(1),
        })
    }

    /// Next chunk, or `None` at a clean end of stream.
    pub fn next_chunk(&mut self) -> io::Result<Option<EncodedChunk>> {
        let mut header = [0u8; IVF_FRAME_HEADER_LEN];
        match self.inner.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let size = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let mut pts_bytes = [0u8; 8];
        pts_bytes.copy_from_slice(&header[4..12]);
        let pts = u64::from_le_bytes(pts_bytes);

        let mut data = vec![0u8; size];
        self.inner.read_exact(&mut data)?;

        let timestamp_us = pts.saturating_mul(self.scale as u64).saturating_mul(1_000_000) / self.rate as u64;
        Ok(Some(EncodedChunk {
            keyframe: vp9_is_keyframe(&data),
            data,
            timestamp_us,
        }))
    }
}

/// VP9 encoder backed by `ffmpeg -c:v libvpx-vp9`.
pub struct FfmpegVp9Encoder {
    config: EncoderConfig,
    child: Child,
    stdin: Option<ChildStdin>,
    chunk_rx: Receiver<Result<EncodedChunk, String>>,
    reader: Option<JoinHandle<()>>,
    last_error: Arc<Mutex<Option<String>>>,
    frames: u64,
}

impl FfmpegVp9Encoder {
    /// Check if FFmpeg is available on the system.
    pub fn is_available() -> bool {
        Command::new("ffmpeg")
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    pub fn spawn(config: &EncoderConfig) -> Result<Self, CaptureError> {
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-loglevel", "error"]);
        cmd.args([
            "-f",
            "rawvideo",
            "-pixel_format",
            "rgba",
            "-video_size",
            &format!("{}x{}", config.width, config.height),
            "-framerate",
            &format!("{}", config.frame_rate),
            "-i",
            "-",
        ]);
        cmd.args([
            "-c:v",
            "libvpx-vp9",
            "-b:v",
            &config.bitrate.to_string(),
            "-deadline",
            "realtime",
            "-cpu-used",
            "8",
            "-row-mt",
            "1",
            "-pix_fmt",
            "yuv420p",
            "-f",
            "ivf",
            "-",
        ]);

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CaptureError::EncoderFault(format!("failed to start ffmpeg: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CaptureError::EncoderFault("failed to open ffmpeg stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::EncoderFault("failed to open ffmpeg stdout".into()))?;

        let last_error = Arc::new(Mutex::new(None));
        if let Some(mut stderr) = child.stderr.take() {
            let last_error = last_error.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 1024];
                loop {
                    match stderr.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let msg = String::from_utf8_lossy(&buf[..n]);
                            for line in msg.lines().filter(|l| !l.trim().is_empty()) {
                                error!("ffmpeg: {}", line);
                                if let Ok(mut last) = last_error.lock() {
                                    *last = Some(line.trim().to_string());
                                }
                            }
                        }
                    }
                }
            });
        }

        let (chunk_tx, chunk_rx) = mpsc::channel();
        let reader = thread::spawn(move || {
            let mut ivf = match IvfReader::new(stdout) {
                Ok(ivf) => ivf,
                Err(e) => {
                    let _ = chunk_tx.send(Err(format!("invalid encoder output: {}", e)));
                    return;
                }
            };
            loop {
                match ivf.next_chunk() {
                    Ok(Some(chunk)) => {
                        if chunk_tx.send(Ok(chunk)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        let _ = chunk_tx.send(Err(format!("failed to read encoder output: {}", e)));
                        return;
                    }
                }
            }
        });

        debug!(
            "Started {} encoder {}x{} @ {} bps",
            config.codec, config.width, config.height, config.bitrate
        );
        Ok(Self {
            config: config.clone(),
            child,
            stdin: Some(stdin),
            chunk_rx,
            reader: Some(reader),
            last_error,
            frames: 0,
        })
    }

    fn fault(&self, context: impl std::fmt::Display) -> CaptureError {
        let detail = self.last_error.lock().ok().and_then(|last| last.clone());
        match detail {
            Some(detail) => CaptureError::EncoderFault(format!("{}: {}", context, detail)),
            None => CaptureError::EncoderFault(context.to_string()),
        }
    }

}

impl VideoEncoder for FfmpegVp9Encoder {
    fn encode(&mut self, frame: &VideoFrame) -> Result<(), CaptureError> {
        if frame.width != self.config.width || frame.height != self.config.height {
            return Err(CaptureError::EncoderFault(format!(
                "frame {} has dimensions {}x{}, expected {}x{}",
                self.frames, frame.width, frame.height, self.config.width, self.config.height
            )));
        }
        let rgba;
        let data = if frame.format == PixelFormat::Rgba {
            &frame.data
        } else {
            rgba = frame.to_rgba();
            &rgba.data
        };

        let Some(stdin) = self.stdin.as_mut() else {
            return Err(CaptureError::EncoderFault("encoder already flushed".into()));
        };
        if let Err(e) = stdin.write_all(data) {
            return Err(self.fault(format!("failed to write frame {} to ffmpeg: {}", self.frames, e)));
        }
        self.frames += 1;
        Ok(())
    }

    fn take_chunks(&mut self) -> Result<Vec<EncodedChunk>, CaptureError> {
        let mut chunks = Vec::new();
        while let Ok(result) = self.chunk_rx.try_recv() {
            chunks.push(result.map_err(|e| self.fault(e))?);
        }
        Ok(chunks)
    }

    fn flush(&mut self) -> Result<Vec<EncodedChunk>, CaptureError> {
        let mut chunks = self.take_chunks()?;
        drop(self.stdin.take());

        for result in self.chunk_rx.iter() {
            chunks.push(result.map_err(|e| self.fault(e))?);
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }

        let status = self
            .child
            .wait()
            .map_err(|e| CaptureError::EncoderFault(format!("failed to wait for ffmpeg: {}", e)))?;
        if !status.success() {
            return Err(self.fault(format!("ffmpeg exited with {}", status)));
        }
        debug!("Encoder flushed after {} frames", self.frames);
        Ok(chunks)
    }
}

impl Drop for FfmpegVp9Encoder {
    fn drop(&mut self) {
        if self.stdin.take().is_some() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Spawns [`FfmpegVp9Encoder`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegVp9Factory;

impl EncoderFactory for FfmpegVp9Factory {
    fn create(&self, config: &EncoderConfig) -> Result<Box<dyn VideoEncoder>, CaptureError> {
        Ok(Box::new(FfmpegVp9Encoder::spawn(config)?))
    }
}
