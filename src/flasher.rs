//! Per-rule opacity animation controller.
//!
//! Each flasher owns the animation parameters for the windows routed to its
//! rule, plus a progress map shared with the animation threads. A flash
//! request for a window that is already animating rewinds the existing
//! animation instead of starting a second one, so at most one animation
//! thread ever runs per window.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::FlashConfig;
use crate::display::{DisplayServer, Window};

/// Dedicated thread serializing fire-and-forget opacity writes.
///
/// Some backends stall the caller when window properties are written from its
/// own control flow, so default-opacity writes are pushed through this single
/// writer instead of blocking the router.
#[derive(Clone)]
pub struct OpacityWriter {
    tx: Sender<(u64, f64)>,
}

impl OpacityWriter {
    pub fn spawn(display: Arc<dyn DisplayServer>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<(u64, f64)>();
        thread::Builder::new()
            .name("opacity-writer".to_string())
            .spawn(move || {
                for (window, opacity) in rx {
                    if let Err(err) = display.set_opacity(window, opacity) {
                        debug!(window, %err, "dropping opacity write");
                    }
                }
            })
            .context("failed to spawn opacity writer thread")?;
        Ok(Self { tx })
    }

    pub fn write(&self, window: u64, opacity: f64) {
        // Send only fails once the writer is gone, during shutdown
        let _ = self.tx.send((window, opacity));
    }
}

/// Linear series from `flash_opacity` toward `default_opacity`, excluding the
/// endpoint. The terminal reset to `default_opacity` is an explicit final
/// step of the animation, not part of the series.
pub fn compute_flash_series(
    flash_opacity: f64,
    default_opacity: f64,
    ntimepoints: usize,
) -> Vec<f64> {
    let diff = default_opacity - flash_opacity;
    (0..ntimepoints)
        .map(|i| flash_opacity + (i as f64 / ntimepoints as f64) * diff)
        .collect()
}

pub struct Flasher {
    display: Arc<dyn DisplayServer>,
    writer: OpacityWriter,
    default_opacity: f64,
    flash_opacity: f64,
    ntimepoints: usize,
    /// Delay between opacity steps.
    timechunk: Duration,
    flash_series: Arc<Vec<f64>>,
    /// Window id -> current frame index, for every window mid-flash.
    progress: Arc<Mutex<HashMap<u64, usize>>>,
}

impl Flasher {
    pub fn new(
        config: &FlashConfig,
        display: Arc<dyn DisplayServer>,
        writer: OpacityWriter,
    ) -> Self {
        let time = Duration::from_secs_f64(config.time / 1000.0);
        let (ntimepoints, timechunk, flash_series) = if config.simple {
            (1, time, vec![config.flash_opacity])
        } else {
            (
                config.ntimepoints,
                time / config.ntimepoints as u32,
                compute_flash_series(
                    config.flash_opacity,
                    config.default_opacity,
                    config.ntimepoints,
                ),
            )
        };
        Self {
            display,
            writer,
            default_opacity: config.default_opacity,
            flash_opacity: config.flash_opacity,
            ntimepoints,
            timechunk,
            flash_series: Arc::new(flash_series),
            progress: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn default_opacity(&self) -> f64 {
        self.default_opacity
    }

    /// Flash a window, restarting in place if it is already mid-flash.
    pub fn flash(&self, window: &Window) {
        if self.default_opacity == self.flash_opacity {
            // Nothing visually distinguishable would happen
            return;
        }
        debug!(window = window.id, "flashing window");
        let mut progress = self.progress.lock().unwrap();
        match progress.entry(window.id) {
            Entry::Occupied(mut entry) => {
                *entry.get_mut() = 0;
            }
            Entry::Vacant(entry) => {
                entry.insert(0);
                self.spawn_animation(window.id);
            }
        }
    }

    /// Restore a window to its default opacity without animating.
    pub fn set_default_opacity(&self, window: &Window) {
        self.writer.write(window.id, self.default_opacity);
    }

    fn spawn_animation(&self, window: u64) {
        let display = Arc::clone(&self.display);
        let progress = Arc::clone(&self.progress);
        let series = Arc::clone(&self.flash_series);
        let ntimepoints = self.ntimepoints;
        let timechunk = self.timechunk;
        let default_opacity = self.default_opacity;
        thread::spawn(move || {
            loop {
                let frame = {
                    let guard = progress.lock().unwrap();
                    match guard.get(&window) {
                        Some(&index) if index < ntimepoints => index,
                        Some(_) => break,
                        // Entry vanished, another path already cleaned up
                        None => return,
                    }
                };
                if let Err(err) = display.set_opacity(window, series[frame]) {
                    debug!(window, %err, "window vanished mid-flash, aborting");
                    progress.lock().unwrap().remove(&window);
                    return;
                }
                thread::sleep(timechunk);
                if let Some(index) = progress.lock().unwrap().get_mut(&window) {
                    *index += 1;
                }
            }
            debug!(window, "flash complete, resetting opacity to default");
            if let Err(err) = display.set_opacity(window, default_opacity) {
                debug!(window, %err, "window vanished before opacity reset");
            }
            progress.lock().unwrap().remove(&window);
        });
    }

    #[cfg(test)]
    fn is_flashing(&self, window: u64) -> bool {
        self.progress.lock().unwrap().contains_key(&window)
    }
}
