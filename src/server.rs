//! Server orchestration: startup, the consume loop and shutdown.
//!
//! The server owns the single consumer end of the event queue. Producers are
//! started only after every mapped window has been initialized to its default
//! opacity, and the loop begins only once all producers have signalled ready,
//! so no early event is lost.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::display::{DisplayError, DisplayServer, Event, EventKind};
use crate::flasher::OpacityWriter;
use crate::producer::{ClientMonitor, DisplayHandler, ProducerHandle};
use crate::router::FlashRouter;

/// How long the consumer blocks before rechecking the stop flag.
const QUEUE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct FlashServer {
    display: Arc<dyn DisplayServer>,
    router: FlashRouter,
    stop: Arc<AtomicBool>,
}

impl FlashServer {
    pub fn new(config: &Config, display: Arc<dyn DisplayServer>) -> Result<Self> {
        let writer = OpacityWriter::spawn(Arc::clone(&display))?;
        let router = FlashRouter::new(config, Arc::clone(&display), writer)
            .context("failed to build the flash router")?;
        Ok(Self {
            display,
            router,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag observed by the consume loop; signal handlers set it to shut the
    /// server down.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Run until the stop flag is set, then clean up.
    pub fn run(mut self) -> Result<()> {
        info!("initializing default window opacity");
        self.init_window_opacity()?;

        info!("starting producer threads");
        let (events_tx, events_rx) = mpsc::channel::<Event>();
        let (ready_tx, ready_rx) = mpsc::channel::<()>();
        let producers = vec![
            ClientMonitor::spawn(
                Arc::clone(&self.display),
                events_tx.clone(),
                ready_tx.clone(),
            )?,
            DisplayHandler::spawn(Arc::clone(&self.display), events_tx, ready_tx)?,
        ];
        for _ in &producers {
            ready_rx
                .recv()
                .context("a producer thread died during startup")?;
        }

        info!("producers ready, waiting for events");
        while !self.stop.load(Ordering::SeqCst) {
            match events_rx.recv_timeout(QUEUE_TIMEOUT) {
                Ok(event) => self.handle(&event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // Both producers are gone: the pipeline is broken
                    error!("event queue disconnected, shutting down");
                    break;
                }
            }
        }
        self.shutdown(producers)
    }

    fn handle(&mut self, event: &Event) {
        match self.router.route(event) {
            Ok(()) => {}
            Err(err @ DisplayError::WindowGone(_)) => {
                debug!(%err, kind = ?event.kind, "dropping event for a vanished window");
            }
            Err(err) => {
                error!(%err, kind = ?event.kind, "failed to route event");
            }
        }
    }

    /// Route a `WindowInit` for every currently mapped window so their
    /// opacity starts at the configured default.
    fn init_window_opacity(&mut self) -> Result<()> {
        let mut windows = self
            .display
            .list_mapped_windows(None)
            .map_err(|err| anyhow::anyhow!("failed to list mapped windows: {err}"))?;
        windows.sort_by_key(|window| window.id);
        for window in windows {
            self.handle(&Event {
                window,
                kind: EventKind::WindowInit,
            });
        }
        Ok(())
    }

    fn shutdown(self, producers: Vec<ProducerHandle>) -> Result<()> {
        info!("stopping producer threads");
        for producer in producers {
            producer.stop();
        }
        info!("resetting windows to their default opacity");
        if let Err(err) = self.router.reset_all_to_default() {
            warn!(%err, "could not reset window opacity");
        }
        info!("disconnecting from the display server");
        self.display.disconnect();
        Ok(())
    }
}
