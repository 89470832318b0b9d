//! Video sources.
//! [`VideoPlayer`] decodes files with the `ffmpeg` command-line tool in a
//! background process and paces frames against a playback clock.

use crate::error::VideoError;
use crate::frame::{PixelFormat, VideoFrame};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[cfg(test)]
pub mod fake;

/// File extensions accepted as video input.
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "m4v", "webm", "mkv", "mov", "avi", "ogv", "mpg", "mpeg", "wmv", "flv", "ts", "3gp",
];

/// Shown when a source reports no finite duration.
pub const UNKNOWN_DURATION_WARNING: &str =
    "Unable to determine video file duration. This may cause unexpected behavior with playback and recording.";

/// Decoded frames buffered ahead of playback.
const FRAME_BUFFER: usize = 5;

/// A playable video the render loop pulls frames from.
pub trait FrameSource {
    /// Native `(width, height)` in pixels.
    fn dimensions(&self) -> (u32, u32);

    /// Length in seconds; `None` when infinite or unknown.
    fn duration(&self) -> Option<f64>;

    fn frame_rate(&self) -> f64;

    /// Playback position in seconds.
    fn current_time(&self) -> f64;

    fn is_paused(&self) -> bool;

    fn play(&mut self);

    fn pause(&mut self);

    fn is_looping(&self) -> bool;

    fn set_looping(&mut self, looping: bool);

    fn seek(&mut self, seconds: f64);

    /// The frame for the current position, once one has been decoded.
    fn current_frame(&mut self) -> Option<&VideoFrame>;

    /// Playback reached the end and will not wrap.
    fn has_ended(&self) -> bool {
        !self.is_looping()
            && self
                .duration()
                .map(|d| self.current_time() >= d)
                .unwrap_or(false)
    }
}

/// Stream metadata reported by `ffprobe`.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub duration: Option<f64>,
    pub frame_rate: f64,
}

/// `true` when the path carries a known video extension.
pub fn is_supported_video(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn parse_fps(s: &str) -> f64 {
    if let Some((num, den)) = s.split_once('/') {
        let n: f64 = num.parse().unwrap_or(0.0);
        let d: f64 = den.parse().unwrap_or(1.0);
        if d == 0.0 {
            0.0
        } else {
            n / d
        }
    } else {
        s.parse().unwrap_or(30.0)
    }
}

/// Parses `ffprobe -of default=noprint_wrappers=1` output.
pub fn parse_probe_output(output: &str) -> Result<VideoInfo, String> {
    let mut width = None;
    let mut height = None;
    let mut duration = None;
    let mut frame_rate = 30.0;

    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        match key {
            "width" => width = value.parse::<u32>().ok(),
            "height" => height = value.parse::<u32>().ok(),
            "duration" => duration = value.parse::<f64>().ok().filter(|d| d.is_finite() && *d > 0.0),
            "r_frame_rate" => {
                let fps = parse_fps(value);
                if fps > 0.0 {
                    frame_rate = fps;
                }
            }
            _ => {}
        }
    }

    match (width, height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => Ok(VideoInfo {
            width,
            height,
            duration,
            frame_rate,
        }),
        _ => Err(format!("no video stream dimensions in ffprobe output: {}", output.trim())),
    }
}

/// Wall-clock playback position.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackClock {
    anchor: f64,
    resumed_at: Option<Instant>,
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            anchor: 0.0,
            resumed_at: None,
        }
    }

    pub fn position(&self, now: Instant) -> f64 {
        match self.resumed_at {
            Some(at) => self.anchor + now.saturating_duration_since(at).as_secs_f64(),
            None => self.anchor,
        }
    }

    pub fn is_running(&self) -> bool {
        self.resumed_at.is_some()
    }

    pub fn play(&mut self, now: Instant) {
        if self.resumed_at.is_none() {
            self.resumed_at = Some(now);
        }
    }

    pub fn pause(&mut self, now: Instant) {
        self.anchor = self.position(now);
        self.resumed_at = None;
    }

    pub fn seek(&mut self, position: f64, now: Instant) {
        self.anchor = position;
        if self.resumed_at.is_some() {
            self.resumed_at = Some(now);
        }
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Background ffmpeg process decoding from a start position.
struct DecodeWorker {
    frame_rx: Option<Receiver<VideoFrame>>,
    stop: Arc<AtomicBool>,
}

impl DecodeWorker {
    fn spawn(path: PathBuf, info: &VideoInfo, start: f64) -> Self {
        let (frame_tx, frame_rx) = mpsc::sync_channel(FRAME_BUFFER);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let info = info.clone();

        thread::spawn(move || {
            decode_loop(path, info, start, frame_tx, stop_clone);
        });

        Self {
            frame_rx: Some(frame_rx),
            stop,
        }
    }

    fn try_recv(&self) -> Result<VideoFrame, TryRecvError> {
        match &self.frame_rx {
            Some(rx) => rx.try_recv(),
            None => Err(TryRecvError::Disconnected),
        }
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Unblocks a sender waiting on a full channel.
        self.frame_rx.take();
    }
}

fn decode_loop(path: PathBuf, info: VideoInfo, start: f64, tx: SyncSender<VideoFrame>, stop: Arc<AtomicBool>) {
    let frame_size = info.width as usize * info.height as usize * 4;
    let frame_duration = 1.0 / info.frame_rate.max(1.0);
    let start_arg = format!("{:.3}", start.max(0.0));

    debug!("Starting ffmpeg decode at {}s", start_arg);
    let mut child = match Command::new("ffmpeg")
        .args(["-v", "error", "-ss", &start_arg, "-i"])
        .arg(&path)
        .args(["-f", "rawvideo", "-pix_fmt", "rgba", "-"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            error!("Failed to spawn ffmpeg: {}", e);
            return;
        }
    };

    if let Some(mut stderr) = child.stderr.take() {
        thread::spawn(move || {
            let mut buf = [0u8; 1024];
            loop {
                match stderr.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let msg = String::from_utf8_lossy(&buf[..n]);
                        for line in msg.lines().filter(|l| !l.trim().is_empty()) {
                            error!("ffmpeg: {}", line);
                        }
                    }
                }
            }
        });
    }

    let Some(mut stdout) = child.stdout.take() else {
        let _ = child.kill();
        return;
    };
    let mut buffer = vec![0u8; frame_size];
    let mut frame_count: u64 = 0;

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        if let Err(e) = stdout.read_exact(&mut buffer) {
            if e.kind() != std::io::ErrorKind::UnexpectedEof {
                warn!("Error reading from ffmpeg: {}", e);
            }
            break;
        }

        let timestamp = start + frame_count as f64 * frame_duration;
        frame_count += 1;

        let frame = VideoFrame::from_data(info.width, info.height, PixelFormat::Rgba, buffer.clone())
            .with_timestamp(timestamp);
        if tx.send(frame).is_err() {
            break;
        }
    }

    let _ = child.kill();
    let _ = child.wait();
}

/// A video file played through ffmpeg.
pub struct VideoPlayer {
    path: PathBuf,
    info: VideoInfo,
    clock: PlaybackClock,
    looping: bool,
    decoder: Option<DecodeWorker>,
    current: Option<VideoFrame>,
    pending: Option<VideoFrame>,
}

impl VideoPlayer {
    /// Probes `path` and prepares playback. The source starts paused at 0.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VideoError> {
        let path = path.as_ref().to_path_buf();
        if !is_supported_video(&path) {
            return Err(VideoError::UnsupportedFormat(path));
        }
        info!("Opening video via ffmpeg CLI: {:?}", path);

        let output = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height,r_frame_rate:format=duration",
                "-of",
                "default=noprint_wrappers=1",
            ])
            .arg(&path)
            .output()?;

        if !output.status.success() {
            return Err(VideoError::Probe {
                path,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let info = parse_probe_output(&stdout).map_err(|reason| VideoError::Probe {
            path: path.clone(),
            reason,
        })?;

        match info.duration {
            Some(duration) => info!(
                "Video: {}x{}, {:.1}s, {:.1} fps",
                info.width, info.height, duration, info.frame_rate
            ),
            None => debug!("Video: {}x{}, unknown duration", info.width, info.height),
        }

        Ok(Self {
            path,
            info,
            clock: PlaybackClock::new(),
            looping: false,
            decoder: None,
            current: None,
            pending: None,
        })
    }

    pub fn info(&self) -> &VideoInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn restart_decoder(&mut self, position: f64) {
        self.pending = None;
        self.decoder = Some(DecodeWorker::spawn(self.path.clone(), &self.info, position));
    }

    /// Applies end-of-stream behaviour for the position at `now`.
    fn handle_end(&mut self, now: Instant) {
        let Some(duration) = self.info.duration else {
            return;
        };
        let position = self.clock.position(now);
        if position < duration {
            return;
        }
        if self.looping {
            let wrapped = position % duration;
            debug!("Looping video to {:.2}s", wrapped);
            self.clock.seek(wrapped, now);
            self.restart_decoder(wrapped);
        } else if self.clock.is_running() {
            self.clock.pause(now);
            self.clock.seek(duration, now);
        }
    }
}

impl FrameSource for VideoPlayer {
    fn dimensions(&self) -> (u32, u32) {
        (self.info.width, self.info.height)
    }

    fn duration(&self) -> Option<f64> {
        self.info.duration
    }

    fn frame_rate(&self) -> f64 {
        self.info.frame_rate
    }

    fn current_time(&self) -> f64 {
        let position = self.clock.position(Instant::now());
        match self.info.duration {
            Some(duration) if !self.looping => position.min(duration),
            _ => position,
        }
    }

    fn is_paused(&self) -> bool {
        !self.clock.is_running()
    }

    fn play(&mut self) {
        if self.has_ended() {
            self.seek(0.0);
        }
        self.clock.play(Instant::now());
    }

    fn pause(&mut self) {
        self.clock.pause(Instant::now());
    }

    fn is_looping(&self) -> bool {
        self.looping
    }

    fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    fn seek(&mut self, seconds: f64) {
        let target = match self.info.duration {
            Some(duration) => seconds.clamp(0.0, duration),
            None => seconds.max(0.0),
        };
        self.clock.seek(target, Instant::now());
        self.restart_decoder(target);
    }

    fn current_frame(&mut self) -> Option<&VideoFrame> {
        let now = Instant::now();
        self.handle_end(now);
        if self.decoder.is_none() {
            let position = self.clock.position(now);
            self.restart_decoder(position);
        }
        let position = self.clock.position(now);

        if let Some(frame) = &self.pending {
            if frame.timestamp_secs() > position {
                return self.current.as_ref();
            }
            self.current = self.pending.take();
        }

        if let Some(decoder) = &self.decoder {
            loop {
                match decoder.try_recv() {
                    Ok(frame) if frame.timestamp_secs() <= position || self.current.is_none() => {
                        self.current = Some(frame);
                    }
                    Ok(frame) => {
                        self.pending = Some(frame);
                        break;
                    }
                    Err(_) => break,
                }
            }
        }

        self.current.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_supported_extensions() {
        assert!(is_supported_video(Path::new("clip.mp4")));
        assert!(is_supported_video(Path::new("/tmp/CLIP.WEBM")));
        assert!(!is_supported_video(Path::new("notes.txt")));
        assert!(!is_supported_video(Path::new("no_extension")));
    }

    #[test]
    fn test_open_rejects_non_video() {
        let err = VideoPlayer::open("shader.glsl").err().unwrap();
        assert!(matches!(err, VideoError::UnsupportedFormat(_)));
        assert_eq!(err.to_string(), "File `shader.glsl` is not a video.");
    }

    #[test]
    fn test_parse_probe_output() {
        let output = "width=1280\nheight=720\nr_frame_rate=30000/1001\nduration=12.500000\n";
        let info = parse_probe_output(output).unwrap();
        assert_eq!((info.width, info.height), (1280, 720));
        assert_eq!(info.duration, Some(12.5));
        assert!((info.frame_rate - 29.97).abs() < 0.01);
    }

    #[test]
    fn test_parse_probe_output_without_duration() {
        let info = parse_probe_output("width=640\nheight=480\nr_frame_rate=25/1\nduration=N/A\n").unwrap();
        assert_eq!(info.duration, None);
        assert_eq!(info.frame_rate, 25.0);
    }

    #[test]
    fn test_parse_probe_output_requires_dimensions() {
        assert!(parse_probe_output("duration=3.0\n").is_err());
    }

    #[test]
    fn test_clock_tracks_play_pause_seek() {
        let t0 = Instant::now();
        let mut clock = PlaybackClock::new();
        assert_eq!(clock.position(t0 + Duration::from_secs(5)), 0.0);

        clock.play(t0);
        let t1 = t0 + Duration::from_secs(2);
        assert!((clock.position(t1) - 2.0).abs() < 1e-9);

        clock.pause(t1);
        assert!((clock.position(t1 + Duration::from_secs(10)) - 2.0).abs() < 1e-9);

        clock.seek(7.0, t1);
        clock.play(t1);
        assert!((clock.position(t1 + Duration::from_secs(1)) - 8.0).abs() < 1e-9);
    }
}
