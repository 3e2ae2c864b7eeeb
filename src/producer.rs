//! Event producer threads.
//!
//! Two producers push onto the shared event queue: the client monitor (flash
//! requests over the control socket) and the display handler (focus shifts
//! and newly mapped windows). Each registers with its source before
//! signalling ready, so the server never consumes before subscriptions are in
//! place, and stops cooperatively via an atomic flag checked between timed
//! reads.

use std::fs;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info};

use crate::client;
use crate::display::{DisplayEvent, DisplayServer, Event, EventKind};

/// How long a producer blocks before rechecking its stop flag.
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Handle to a running producer thread.
pub struct ProducerHandle {
    name: &'static str,
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl ProducerHandle {
    /// Request cooperative shutdown and wait for the thread to exit.
    pub fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        if self.handle.join().is_err() {
            error!(producer = self.name, "producer thread panicked");
        }
    }
}

/// Listens on the control socket and emits a `ClientRequest` for the focused
/// window whenever a client sends its one-byte request.
pub struct ClientMonitor;

impl ClientMonitor {
    pub fn spawn(
        display: Arc<dyn DisplayServer>,
        events: Sender<Event>,
        ready: Sender<()>,
    ) -> Result<ProducerHandle> {
        let path = client::socket_path();
        // Bind before spawning so no request sent after startup is lost
        let socket = bind_socket(&path)
            .with_context(|| format!("failed to bind control socket {}", path.display()))?;
        socket
            .set_read_timeout(Some(READ_TIMEOUT))
            .context("failed to set control socket read timeout")?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("client-monitor".to_string())
            .spawn(move || {
                let _ = ready.send(());
                Self::run(&socket, &display, &events, &thread_stop);
                // Idempotent: the file may already be gone
                let _ = fs::remove_file(&path);
                info!("client monitor stopped");
            })
            .context("failed to spawn client monitor thread")?;
        Ok(ProducerHandle {
            name: "client-monitor",
            stop,
            handle,
        })
    }

    fn run(
        socket: &UnixDatagram,
        display: &Arc<dyn DisplayServer>,
        events: &Sender<Event>,
        stop: &AtomicBool,
    ) {
        let mut buf = [0u8; 1];
        while !stop.load(Ordering::SeqCst) {
            match socket.recv(&mut buf) {
                Ok(_) => {
                    debug!("received a flash request from a client");
                    match display.focused_window() {
                        Ok(Some(window)) => {
                            let _ = events.send(Event {
                                window,
                                kind: EventKind::ClientRequest,
                            });
                        }
                        Ok(None) => debug!("no window focused, ignoring request"),
                        Err(err) => debug!(%err, "could not resolve the focused window"),
                    }
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) => {}
                Err(err) => {
                    error!(%err, "control socket read failed");
                    break;
                }
            }
        }
    }
}

fn bind_socket(path: &Path) -> io::Result<UnixDatagram> {
    // A stale socket from a previous run would make bind fail
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
        _ => {}
    }
    UnixDatagram::bind(path)
}

/// Forwards focus shifts and newly mapped windows from the display server.
pub struct DisplayHandler;

impl DisplayHandler {
    pub fn spawn(
        display: Arc<dyn DisplayServer>,
        events: Sender<Event>,
        ready: Sender<()>,
    ) -> Result<ProducerHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("display-handler".to_string())
            .spawn(move || {
                // The backend subscribed to notifications when it connected,
                // so nothing is lost before this point
                let _ = ready.send(());
                Self::run(&display, &events, &thread_stop);
                info!("display handler stopped");
            })
            .context("failed to spawn display handler thread")?;
        Ok(ProducerHandle {
            name: "display-handler",
            stop,
            handle,
        })
    }

    fn run(display: &Arc<dyn DisplayServer>, events: &Sender<Event>, stop: &AtomicBool) {
        while !stop.load(Ordering::SeqCst) {
            match display.poll_event(READ_TIMEOUT) {
                Ok(Some(DisplayEvent::FocusShift(window))) => {
                    debug!(window = window.id, "focus shifted");
                    let _ = events.send(Event {
                        window,
                        kind: EventKind::FocusShift,
                    });
                }
                Ok(Some(DisplayEvent::NewWindow(window))) => Self::handle_new_window(
                    window,
                    display,
                    events,
                ),
                Ok(None) => {}
                Err(err) => debug!(%err, "display event error"),
            }
        }
    }

    /// Only forward windows that are confirmed mapped. A create notification
    /// can arrive for a window that never becomes visible; writing opacity to
    /// one of those freezes it at that opacity for good.
    fn handle_new_window(
        window: crate::display::Window,
        display: &Arc<dyn DisplayServer>,
        events: &Sender<Event>,
    ) {
        match display.list_mapped_windows(None) {
            Ok(mapped) if mapped.iter().any(|m| m.id == window.id) => {
                debug!(window = window.id, "new window mapped");
                let _ = events.send(Event {
                    window,
                    kind: EventKind::NewWindow,
                });
            }
            Ok(_) => debug!(window = window.id, "window is not visible, ignoring"),
            Err(err) => debug!(%err, "could not list mapped windows"),
        }
    }
}
