//! Display server abstraction.
//!
//! The pipeline never talks to X11 or sway directly. Everything goes through
//! the [`DisplayServer`] trait, with one implementation per backend, selected
//! once at startup by [`connect`]. Windows are plain value types carrying only
//! their identity and the matchable properties captured at event time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::info;

pub mod sway;
pub mod x11;

/// Errors surfaced by a display backend.
#[derive(Debug, Error)]
pub enum DisplayError {
    /// The target window was destroyed or never existed. Recovered locally by
    /// dropping the operation.
    #[error("window {0} is gone")]
    WindowGone(u64),
    /// Connection-level failure.
    #[error("display backend error: {0}")]
    Backend(String),
}

pub type DisplayResult<T> = Result<T, DisplayError>;

/// A window as seen by the pipeline. Equality is identity-based.
#[derive(Debug, Clone)]
pub struct Window {
    pub id: u64,
    properties: HashMap<String, String>,
}

impl Window {
    pub fn new(id: u64, properties: HashMap<String, String>) -> Self {
        Self { id, properties }
    }

    /// A matchable property of the window (`window_class`, `app_id`, ...).
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

impl PartialEq for Window {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Window {}

/// What happened to a window, as reported by a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    FocusShift,
    ClientRequest,
    NewWindow,
    WindowInit,
}

/// One unit of work for the router.
#[derive(Debug, Clone)]
pub struct Event {
    pub window: Window,
    pub kind: EventKind,
}

/// A raw notification from the display server, before producer filtering.
#[derive(Debug, Clone)]
pub enum DisplayEvent {
    FocusShift(Window),
    NewWindow(Window),
}

/// Backend contract consumed by the pipeline.
///
/// Implementations must be safe to call from the producer threads, the router
/// thread and the animation threads concurrently.
pub trait DisplayServer: Send + Sync {
    /// Set a window's opacity, in [0, 1].
    fn set_opacity(&self, window: u64, opacity: f64) -> DisplayResult<()>;

    /// Current opacity of a window, if the backend exposes one.
    fn opacity(&self, window: u64) -> DisplayResult<Option<f64>>;

    fn is_fullscreen(&self, window: u64) -> DisplayResult<bool>;

    /// Ask the window manager to close a window.
    fn destroy(&self, window: u64) -> DisplayResult<()>;

    /// All currently mapped windows, optionally restricted to one workspace.
    fn list_mapped_windows(&self, workspace: Option<u32>) -> DisplayResult<Vec<Window>>;

    fn focused_window(&self) -> DisplayResult<Option<Window>>;

    fn focused_workspace(&self) -> DisplayResult<Option<u32>>;

    /// Wait up to `timeout` for the next focus/new-window notification.
    /// Returns `None` on timeout so callers can check their stop flag.
    fn poll_event(&self, timeout: Duration) -> DisplayResult<Option<DisplayEvent>>;

    /// Tear down the connection. Called once during server shutdown.
    fn disconnect(&self);
}

/// Pick a backend for the current session: sway when `SWAYSOCK` is set,
/// X11 otherwise.
pub fn connect() -> Result<Arc<dyn DisplayServer>> {
    if std::env::var_os("SWAYSOCK").is_some() {
        info!("detected display protocol: wayland (sway)");
        Ok(Arc::new(sway::SwayDisplay::connect()?))
    } else {
        info!("detected display protocol: X11");
        Ok(Arc::new(x11::X11Display::connect()?))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory display double used by the pipeline tests. Records every
    //! opacity write so tests can assert on the observed animation sequence.

    use super::*;
    use std::collections::{HashSet, VecDeque};
    use std::sync::{Condvar, Mutex};
    use std::time::Instant;

    #[derive(Default)]
    struct State {
        // (window, workspace) pairs
        windows: Vec<(Window, u32)>,
        focused: Option<u64>,
        workspace: Option<u32>,
        fullscreen: HashSet<u64>,
        dead: HashSet<u64>,
        events: VecDeque<DisplayEvent>,
        opacity_writes: Vec<(u64, f64)>,
        disconnected: bool,
    }

    #[derive(Default)]
    pub struct FakeDisplay {
        state: Mutex<State>,
        event_ready: Condvar,
    }

    impl FakeDisplay {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_window(&self, window: Window, workspace: u32) {
            let mut state = self.state.lock().unwrap();
            state.windows.push((window, workspace));
        }

        pub fn remove_window(&self, id: u64) {
            let mut state = self.state.lock().unwrap();
            state.windows.retain(|(w, _)| w.id != id);
            state.dead.insert(id);
        }

        pub fn set_focused(&self, id: Option<u64>) {
            self.state.lock().unwrap().focused = id;
        }

        pub fn set_workspace(&self, workspace: Option<u32>) {
            self.state.lock().unwrap().workspace = workspace;
        }

        pub fn set_fullscreen(&self, id: u64, fullscreen: bool) {
            let mut state = self.state.lock().unwrap();
            if fullscreen {
                state.fullscreen.insert(id);
            } else {
                state.fullscreen.remove(&id);
            }
        }

        pub fn push_event(&self, event: DisplayEvent) {
            self.state.lock().unwrap().events.push_back(event);
            self.event_ready.notify_all();
        }

        pub fn opacity_writes(&self) -> Vec<(u64, f64)> {
            self.state.lock().unwrap().opacity_writes.clone()
        }

        pub fn disconnected(&self) -> bool {
            self.state.lock().unwrap().disconnected
        }
    }

    impl DisplayServer for FakeDisplay {
        fn set_opacity(&self, window: u64, opacity: f64) -> DisplayResult<()> {
            let mut state = self.state.lock().unwrap();
            if state.dead.contains(&window) {
                return Err(DisplayError::WindowGone(window));
            }
            state.opacity_writes.push((window, opacity));
            Ok(())
        }

        fn opacity(&self, window: u64) -> DisplayResult<Option<f64>> {
            let state = self.state.lock().unwrap();
            if state.dead.contains(&window) {
                return Err(DisplayError::WindowGone(window));
            }
            Ok(state
                .opacity_writes
                .iter()
                .rev()
                .find(|(id, _)| *id == window)
                .map(|(_, opacity)| *opacity))
        }

        fn is_fullscreen(&self, window: u64) -> DisplayResult<bool> {
            let state = self.state.lock().unwrap();
            if state.dead.contains(&window) {
                return Err(DisplayError::WindowGone(window));
            }
            Ok(state.fullscreen.contains(&window))
        }

        fn destroy(&self, window: u64) -> DisplayResult<()> {
            let mut state = self.state.lock().unwrap();
            state.windows.retain(|(w, _)| w.id != window);
            state.dead.insert(window);
            Ok(())
        }

        fn list_mapped_windows(&self, workspace: Option<u32>) -> DisplayResult<Vec<Window>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .windows
                .iter()
                .filter(|(_, ws)| workspace.is_none_or(|target| *ws == target))
                .map(|(w, _)| w.clone())
                .collect())
        }

        fn focused_window(&self) -> DisplayResult<Option<Window>> {
            let state = self.state.lock().unwrap();
            Ok(state.focused.and_then(|id| {
                state
                    .windows
                    .iter()
                    .find(|(w, _)| w.id == id)
                    .map(|(w, _)| w.clone())
            }))
        }

        fn focused_workspace(&self) -> DisplayResult<Option<u32>> {
            Ok(self.state.lock().unwrap().workspace)
        }

        fn poll_event(&self, timeout: Duration) -> DisplayResult<Option<DisplayEvent>> {
            let deadline = Instant::now() + timeout;
            let mut state = self.state.lock().unwrap();
            loop {
                if let Some(event) = state.events.pop_front() {
                    return Ok(Some(event));
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                let (next, _) = self
                    .event_ready
                    .wait_timeout(state, deadline - now)
                    .unwrap();
                state = next;
            }
        }

        fn disconnect(&self) {
            self.state.lock().unwrap().disconnected = true;
        }
    }

    /// Convenience constructor for a window with X11-style properties.
    pub fn window(id: u64, instance: &str, class: &str) -> Window {
        let mut properties = HashMap::new();
        properties.insert("window_id".to_string(), instance.to_string());
        properties.insert("window_class".to_string(), class.to_string());
        Window::new(id, properties)
    }
}
