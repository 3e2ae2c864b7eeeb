//! X11 backend.
//!
//! Talks EWMH over x11rb: window enumeration via `_NET_CLIENT_LIST`, focus
//! via `_NET_ACTIVE_WINDOW` property changes on the root window and opacity
//! via `_NET_WM_WINDOW_OPACITY`.

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::debug;
use x11rb::connection::Connection;
use x11rb::errors::{ConnectionError, ReplyError};
use x11rb::protocol::Event as X11Event;
use x11rb::protocol::ErrorKind;
use x11rb::protocol::xproto::{
    Atom, AtomEnum, ChangeWindowAttributesAux, ConnectionExt, EventMask, PropMode,
};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as WrapperExt;

use super::{DisplayError, DisplayEvent, DisplayResult, DisplayServer, Window};

/// Interval between checks of the X event queue while waiting in
/// `poll_event`.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Pre-cached atoms to avoid repeated intern roundtrips.
struct Atoms {
    net_client_list: Atom,
    net_active_window: Atom,
    net_current_desktop: Atom,
    net_wm_desktop: Atom,
    net_wm_state: Atom,
    net_wm_state_fullscreen: Atom,
    net_wm_window_opacity: Atom,
}

impl Atoms {
    fn new(conn: &RustConnection) -> Result<Self> {
        let intern = |name: &[u8]| -> Result<Atom> {
            Ok(conn
                .intern_atom(false, name)
                .with_context(|| {
                    format!("failed to intern atom {}", String::from_utf8_lossy(name))
                })?
                .reply()
                .with_context(|| {
                    format!(
                        "failed to get reply for atom {}",
                        String::from_utf8_lossy(name)
                    )
                })?
                .atom)
        };
        Ok(Self {
            net_client_list: intern(b"_NET_CLIENT_LIST")?,
            net_active_window: intern(b"_NET_ACTIVE_WINDOW")?,
            net_current_desktop: intern(b"_NET_CURRENT_DESKTOP")?,
            net_wm_desktop: intern(b"_NET_WM_DESKTOP")?,
            net_wm_state: intern(b"_NET_WM_STATE")?,
            net_wm_state_fullscreen: intern(b"_NET_WM_STATE_FULLSCREEN")?,
            net_wm_window_opacity: intern(b"_NET_WM_WINDOW_OPACITY")?,
        })
    }
}

pub struct X11Display {
    conn: RustConnection,
    root: u32,
    atoms: Atoms,
}

impl X11Display {
    pub fn connect() -> Result<Self> {
        let (conn, screen_num) = x11rb::connect(None).context("failed to connect to X server")?;
        let root = conn.setup().roots[screen_num].root;
        let atoms = Atoms::new(&conn)?;

        // PropertyChange reports focus shifts via _NET_ACTIVE_WINDOW;
        // SubstructureNotify reports newly created windows
        conn.change_window_attributes(
            root,
            &ChangeWindowAttributesAux::new()
                .event_mask(EventMask::PROPERTY_CHANGE | EventMask::SUBSTRUCTURE_NOTIFY),
        )
        .context("failed to select events on the root window")?
        .check()
        .context("failed to select events on the root window")?;

        Ok(Self { conn, root, atoms })
    }

    fn get_property(
        &self,
        window: u32,
        property: Atom,
        type_: AtomEnum,
        length: u32,
    ) -> DisplayResult<x11rb::protocol::xproto::GetPropertyReply> {
        self.conn
            .get_property(false, window, property, type_, 0, length)
            .map_err(backend_err)?
            .reply()
            .map_err(|err| window_err(window, err))
    }

    /// Build a `Window` value, capturing the WM_CLASS instance/class pair as
    /// its matchable properties.
    fn window(&self, id: u32) -> DisplayResult<Window> {
        let reply = self.get_property(id, AtomEnum::WM_CLASS.into(), AtomEnum::STRING, 1024)?;
        let mut properties = HashMap::new();
        // WM_CLASS is two null-terminated strings: instance, then class
        let mut fields = reply
            .value
            .split(|&byte| byte == 0)
            .map(|raw| String::from_utf8_lossy(raw).into_owned());
        if let Some(instance) = fields.next().filter(|s| !s.is_empty()) {
            properties.insert("window_id".to_string(), instance);
        }
        if let Some(class) = fields.next().filter(|s| !s.is_empty()) {
            properties.insert("window_class".to_string(), class);
        }
        Ok(Window::new(u64::from(id), properties))
    }

    fn window_workspace(&self, id: u32) -> DisplayResult<Option<u32>> {
        let reply = self.get_property(id, self.atoms.net_wm_desktop, AtomEnum::CARDINAL, 1)?;
        Ok(reply.value32().and_then(|mut values| values.next()))
    }
}

impl DisplayServer for X11Display {
    fn set_opacity(&self, window: u64, opacity: f64) -> DisplayResult<()> {
        let raw = (opacity.clamp(0.0, 1.0) * f64::from(u32::MAX)) as u32;
        self.conn
            .change_property32(
                PropMode::REPLACE,
                window as u32,
                self.atoms.net_wm_window_opacity,
                AtomEnum::CARDINAL,
                &[raw],
            )
            .map_err(backend_err)?
            .check()
            .map_err(|err| window_err(window as u32, err))
    }

    fn opacity(&self, window: u64) -> DisplayResult<Option<f64>> {
        let reply = self.get_property(
            window as u32,
            self.atoms.net_wm_window_opacity,
            AtomEnum::CARDINAL,
            1,
        )?;
        Ok(reply
            .value32()
            .and_then(|mut values| values.next())
            .map(|raw| f64::from(raw) / f64::from(u32::MAX)))
    }

    fn is_fullscreen(&self, window: u64) -> DisplayResult<bool> {
        let reply =
            self.get_property(window as u32, self.atoms.net_wm_state, AtomEnum::ATOM, 1024)?;
        Ok(reply
            .value32()
            .is_some_and(|mut states| states.any(|atom| atom == self.atoms.net_wm_state_fullscreen)))
    }

    fn destroy(&self, window: u64) -> DisplayResult<()> {
        self.conn
            .destroy_window(window as u32)
            .map_err(backend_err)?
            .check()
            .map_err(|err| window_err(window as u32, err))
    }

    fn list_mapped_windows(&self, workspace: Option<u32>) -> DisplayResult<Vec<Window>> {
        let reply = self.get_property(
            self.root,
            self.atoms.net_client_list,
            AtomEnum::WINDOW,
            u32::MAX,
        )?;
        let ids: Vec<u32> = reply
            .value32()
            .map(|values| values.collect())
            .unwrap_or_default();

        let mut windows = Vec::with_capacity(ids.len());
        for id in ids {
            // Windows can vanish between the list query and the property
            // reads; skip them
            let window = match self.window(id) {
                Ok(window) => window,
                Err(DisplayError::WindowGone(_)) => continue,
                Err(err) => return Err(err),
            };
            if let Some(target) = workspace {
                match self.window_workspace(id) {
                    Ok(Some(ws)) if ws == target => {}
                    Ok(_) => continue,
                    Err(DisplayError::WindowGone(_)) => continue,
                    Err(err) => return Err(err),
                }
            }
            windows.push(window);
        }
        Ok(windows)
    }

    fn focused_window(&self) -> DisplayResult<Option<Window>> {
        let reply = self.get_property(
            self.root,
            self.atoms.net_active_window,
            AtomEnum::WINDOW,
            1,
        )?;
        let Some(id) = reply.value32().and_then(|mut values| values.next()) else {
            return Ok(None);
        };
        if id == 0 {
            return Ok(None);
        }
        match self.window(id) {
            Ok(window) => Ok(Some(window)),
            Err(DisplayError::WindowGone(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn focused_workspace(&self) -> DisplayResult<Option<u32>> {
        let reply = self.get_property(
            self.root,
            self.atoms.net_current_desktop,
            AtomEnum::CARDINAL,
            1,
        )?;
        Ok(reply.value32().and_then(|mut values| values.next()))
    }

    fn poll_event(&self, timeout: Duration) -> DisplayResult<Option<DisplayEvent>> {
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(event) = self.conn.poll_for_event().map_err(backend_err)? {
                match event {
                    X11Event::PropertyNotify(notify)
                        if notify.atom == self.atoms.net_active_window =>
                    {
                        // notify.window can carry a stale id here; resolve
                        // the focused window from the root property instead
                        match self.focused_window() {
                            Ok(Some(window)) => {
                                return Ok(Some(DisplayEvent::FocusShift(window)));
                            }
                            Ok(None) => {}
                            Err(err) => debug!(%err, "could not resolve focused window"),
                        }
                    }
                    X11Event::CreateNotify(notify) => match self.window(notify.window) {
                        Ok(window) => return Ok(Some(DisplayEvent::NewWindow(window))),
                        Err(DisplayError::WindowGone(_)) => {}
                        Err(err) => return Err(err),
                    },
                    _ => {}
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(EVENT_POLL_INTERVAL);
        }
    }

    fn disconnect(&self) {
        // RustConnection closes on drop; just push out anything buffered
        let _ = self.conn.flush();
    }
}

fn backend_err(err: ConnectionError) -> DisplayError {
    DisplayError::Backend(err.to_string())
}

fn window_err(window: u32, err: ReplyError) -> DisplayError {
    match err {
        ReplyError::X11Error(ref x11)
            if matches!(x11.error_kind, ErrorKind::Window | ErrorKind::Drawable) =>
        {
            DisplayError::WindowGone(u64::from(window))
        }
        other => DisplayError::Backend(other.to_string()),
    }
}
