//! Hot reload of the fragment shader file.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Fires once events have been quiet for `delay`.
#[derive(Debug, Clone)]
pub struct Debounce {
    delay: Duration,
    pending_since: Option<Instant>,
}

impl Debounce {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending_since: None,
        }
    }

    /// Records an event at `now`, restarting the quiet period.
    pub fn trigger(&mut self, now: Instant) {
        self.pending_since = Some(now);
    }

    /// `true` exactly once per burst, after the quiet period.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.pending_since {
            Some(since) if now.duration_since(since) >= self.delay => {
                self.pending_since = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending_since.is_some()
    }
}

/// Watches one shader file and yields its new contents after edits settle.
pub struct ShaderWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    rx: Receiver<Result<Event, notify::Error>>,
    debounce: Debounce,
    last_source: Option<String>,
}

impl ShaderWatcher {
    /// Returns `None` (after logging) when the file cannot be watched.
    pub fn new(path: impl Into<PathBuf>, delay: Duration) -> Option<Self> {
        let path = path.into();
        // Editors often replace the file, so watch the directory holding it.
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let (tx, rx) = channel();

        let mut watcher = match RecommendedWatcher::new(tx, notify::Config::default()) {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!("Failed to create shader watcher: {}", e);
                return None;
            }
        };
        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            warn!("Failed to watch shader {:?}: {}", path, e);
            return None;
        }
        info!("Watching shader {:?} for changes", path);

        Some(Self {
            last_source: fs::read_to_string(&path).ok(),
            path,
            _watcher: watcher,
            rx,
            debounce: Debounce::new(delay),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// New shader source once the file changed and edits have settled.
    pub fn poll(&mut self) -> Option<String> {
        self.poll_at(Instant::now())
    }

    pub fn poll_at(&mut self, now: Instant) -> Option<String> {
        while let Ok(res) = self.rx.try_recv() {
            match res {
                Ok(event) if self.is_relevant(&event) => self.debounce.trigger(now),
                Ok(_) => {}
                Err(e) => error!("Shader watch error: {}", e),
            }
        }

        if !self.debounce.ready(now) {
            return None;
        }
        match fs::read_to_string(&self.path) {
            Ok(source) if self.last_source.as_deref() == Some(source.as_str()) => {
                debug!("Shader {:?} touched without changes", self.path);
                None
            }
            Ok(source) => {
                info!("Shader {:?} changed, recompiling", self.path);
                self.last_source = Some(source.clone());
                Some(source)
            }
            Err(e) => {
                error!("Failed to read shader {:?}: {}", self.path, e);
                None
            }
        }
    }

    fn is_relevant(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
            && event
                .paths
                .iter()
                .any(|p| p.file_name() == self.path.file_name())
    }
}
