//! Cancellation and host events that end a recording early.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag raised by the user (stop key, Ctrl-C) to abort a recording.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Something the host window reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    VisibilityChanged { hidden: bool },
    FocusChanged { focused: bool },
    CancelRequested,
}

/// Visibility and focus of the host window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostState {
    pub hidden: bool,
    pub focused: bool,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            hidden: false,
            focused: true,
        }
    }
}

impl HostState {
    pub fn apply(&mut self, event: HostEvent) {
        match event {
            HostEvent::VisibilityChanged { hidden } => self.hidden = hidden,
            HostEvent::FocusChanged { focused } => self.focused = focused,
            HostEvent::CancelRequested => {}
        }
    }
}

/// Why a recording ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    UserCancelled,
    TabHidden,
    FocusLost,
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::UserCancelled => write!(f, "cancelled by user"),
            Interrupt::TabHidden => write!(f, "window hidden"),
            Interrupt::FocusLost => write!(f, "window lost focus while hidden"),
        }
    }
}

/// Event kinds a recording listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Cancel,
    Visibility,
    Focus,
}

impl Trigger {
    pub const ALL: [Trigger; 3] = [Trigger::Cancel, Trigger::Visibility, Trigger::Focus];
}

/// Listener registrations owned by one recording.
#[derive(Debug, Default)]
pub struct InterruptRegistry {
    registered: Vec<Trigger>,
}

impl InterruptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, trigger: Trigger) {
        if !self.registered.contains(&trigger) {
            self.registered.push(trigger);
        }
    }

    pub fn clear(&mut self) {
        self.registered.clear();
    }

    pub fn is_registered(&self, trigger: Trigger) -> bool {
        self.registered.contains(&trigger)
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    /// Maps `event` to an interrupt. `host` already reflects the event and
    /// `stream_active` tells whether frames are still being read.
    pub fn dispatch(&self, event: HostEvent, host: HostState, stream_active: bool) -> Option<Interrupt> {
        match event {
            HostEvent::CancelRequested if self.is_registered(Trigger::Cancel) => Some(Interrupt::UserCancelled),
            HostEvent::VisibilityChanged { .. }
                if self.is_registered(Trigger::Visibility) && host.hidden && stream_active =>
            {
                Some(Interrupt::TabHidden)
            }
            HostEvent::FocusChanged { focused: false }
                if self.is_registered(Trigger::Focus) && host.hidden && stream_active =>
            {
                Some(Interrupt::FocusLost)
            }
            _ => None,
        }
    }
}
