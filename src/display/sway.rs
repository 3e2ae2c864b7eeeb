//! Sway backend.
//!
//! Speaks the i3-ipc protocol over the `SWAYSOCK` unix socket: each message
//! is the `i3-ipc` magic, a native-endian u32 payload length, a u32 message
//! type and a JSON payload. Window queries go through `GET_TREE`, opacity
//! writes through `RUN_COMMAND`, and a second, subscribed connection feeds
//! window events to `poll_event` via a background reader thread.

use std::collections::HashMap;
use std::env;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use super::{DisplayError, DisplayEvent, DisplayResult, DisplayServer, Window};

const MAGIC: &[u8; 6] = b"i3-ipc";
const EVENT_FLAG: u32 = 0x8000_0000;

const RUN_COMMAND: u32 = 0;
const GET_WORKSPACES: u32 = 1;
const SUBSCRIBE: u32 = 2;
const GET_TREE: u32 = 4;
const WINDOW_EVENT: u32 = 3;

struct IpcStream {
    stream: UnixStream,
}

impl IpcStream {
    fn connect(path: &Path) -> io::Result<Self> {
        Ok(Self {
            stream: UnixStream::connect(path)?,
        })
    }

    fn send(&mut self, msg_type: u32, payload: &[u8]) -> io::Result<()> {
        let mut message = Vec::with_capacity(14 + payload.len());
        message.extend_from_slice(MAGIC);
        message.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
        message.extend_from_slice(&msg_type.to_ne_bytes());
        message.extend_from_slice(payload);
        self.stream.write_all(&message)?;
        self.stream.flush()
    }

    fn recv(&mut self) -> io::Result<(u32, Vec<u8>)> {
        let mut header = [0u8; 14];
        self.stream.read_exact(&mut header)?;
        if &header[..6] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad i3-ipc magic",
            ));
        }
        let len = u32::from_ne_bytes([header[6], header[7], header[8], header[9]]) as usize;
        let msg_type = u32::from_ne_bytes([header[10], header[11], header[12], header[13]]);
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        Ok((msg_type, payload))
    }

    /// Send a request and wait for its reply, skipping any interleaved
    /// events.
    fn request(&mut self, msg_type: u32, payload: &[u8]) -> io::Result<Vec<u8>> {
        self.send(msg_type, payload)?;
        loop {
            let (reply_type, reply) = self.recv()?;
            if reply_type & EVENT_FLAG == 0 {
                return Ok(reply);
            }
        }
    }
}

// GET_TREE node, reduced to the fields the pipeline needs.
#[derive(Debug, Deserialize)]
struct TreeNode {
    id: i64,
    #[serde(rename = "type", default)]
    node_type: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    app_id: Option<String>,
    #[serde(default)]
    window_properties: Option<WindowProperties>,
    #[serde(default)]
    focused: bool,
    #[serde(default)]
    fullscreen_mode: Option<u8>,
    #[serde(default)]
    window_rect: Option<Rect>,
    #[serde(default)]
    num: Option<i32>,
    #[serde(default)]
    nodes: Vec<TreeNode>,
    #[serde(default)]
    floating_nodes: Vec<TreeNode>,
}

#[derive(Debug, Deserialize)]
struct WindowProperties {
    #[serde(default)]
    class: Option<String>,
    #[serde(default)]
    instance: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Rect {
    #[serde(default)]
    width: i32,
}

#[derive(Debug, Deserialize)]
struct CommandOutcome {
    success: bool,
}

#[derive(Debug, Deserialize)]
struct WorkspaceInfo {
    num: i32,
    #[serde(default)]
    focused: bool,
}

#[derive(Debug, Deserialize)]
struct WindowEventPayload {
    change: String,
    container: TreeNode,
}

impl TreeNode {
    /// A view the user can see: a leaf container with a nonzero on-screen
    /// rect. Guards against transient containers that would freeze an
    /// opacity write.
    fn is_mapped_view(&self) -> bool {
        matches!(self.node_type.as_deref(), Some("con" | "floating_con"))
            && self.nodes.is_empty()
            && self.floating_nodes.is_empty()
            && self.window_rect.as_ref().is_some_and(|rect| rect.width != 0)
    }

    fn to_window(&self) -> Window {
        let mut properties = HashMap::new();
        if let Some(app_id) = &self.app_id {
            properties.insert("app_id".to_string(), app_id.clone());
        }
        if let Some(name) = &self.name {
            properties.insert("window_name".to_string(), name.clone());
        }
        if let Some(props) = &self.window_properties {
            // XWayland windows carry the X11 instance/class pair instead
            if let Some(instance) = &props.instance {
                properties.insert("window_id".to_string(), instance.clone());
            }
            if let Some(class) = &props.class {
                properties.insert("window_class".to_string(), class.clone());
            }
        }
        Window::new(self.id as u64, properties)
    }

    /// Depth-first walk over (view, enclosing workspace number) pairs.
    fn visit_views(&self, workspace: Option<i32>, visit: &mut impl FnMut(&TreeNode, Option<i32>)) {
        let workspace = if self.node_type.as_deref() == Some("workspace") {
            self.num
        } else {
            workspace
        };
        if self.is_mapped_view() {
            visit(self, workspace);
        }
        for child in self.nodes.iter().chain(&self.floating_nodes) {
            child.visit_views(workspace, visit);
        }
    }

    fn find(&self, id: i64) -> Option<&TreeNode> {
        if self.id == id {
            return Some(self);
        }
        self.nodes
            .iter()
            .chain(&self.floating_nodes)
            .find_map(|child| child.find(id))
    }
}

pub struct SwayDisplay {
    rpc: Mutex<IpcStream>,
    events: Mutex<Receiver<DisplayEvent>>,
    /// Clone of the subscribed stream, kept to unblock the reader thread at
    /// shutdown.
    event_stream: UnixStream,
}

impl SwayDisplay {
    pub fn connect() -> Result<Self> {
        let path = env::var_os("SWAYSOCK").context("SWAYSOCK is not set")?;
        let path = Path::new(&path).to_path_buf();
        let rpc = IpcStream::connect(&path)
            .with_context(|| format!("failed to connect to sway at {}", path.display()))?;

        let mut subscription = IpcStream::connect(&path)
            .with_context(|| format!("failed to connect to sway at {}", path.display()))?;
        let reply = subscription
            .request(SUBSCRIBE, br#"["window"]"#)
            .context("failed to subscribe to sway window events")?;
        let outcome: CommandOutcome =
            serde_json::from_slice(&reply).context("unexpected subscribe reply from sway")?;
        if !outcome.success {
            anyhow::bail!("sway rejected the window event subscription");
        }

        let event_stream = subscription
            .stream
            .try_clone()
            .context("failed to clone the sway event stream")?;
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("sway-events".to_string())
            .spawn(move || read_events(subscription, &tx))
            .context("failed to spawn sway event reader thread")?;

        Ok(Self {
            rpc: Mutex::new(rpc),
            events: Mutex::new(rx),
            event_stream,
        })
    }

    fn tree(&self) -> DisplayResult<TreeNode> {
        let reply = self
            .rpc
            .lock()
            .unwrap()
            .request(GET_TREE, b"")
            .map_err(backend_err)?;
        serde_json::from_slice(&reply).map_err(|err| DisplayError::Backend(err.to_string()))
    }

    fn run_command(&self, window: u64, command: &str) -> DisplayResult<()> {
        let reply = self
            .rpc
            .lock()
            .unwrap()
            .request(RUN_COMMAND, command.as_bytes())
            .map_err(backend_err)?;
        let outcomes: Vec<CommandOutcome> =
            serde_json::from_slice(&reply).map_err(|err| DisplayError::Backend(err.to_string()))?;
        if outcomes.iter().all(|outcome| outcome.success) {
            Ok(())
        } else {
            // The usual failure is that no container matched the id
            Err(DisplayError::WindowGone(window))
        }
    }
}

fn read_events(mut subscription: IpcStream, tx: &mpsc::Sender<DisplayEvent>) {
    loop {
        let (msg_type, payload) = match subscription.recv() {
            Ok(message) => message,
            Err(err) => {
                debug!(%err, "sway event stream closed");
                return;
            }
        };
        if msg_type & EVENT_FLAG == 0 || msg_type & !EVENT_FLAG != WINDOW_EVENT {
            continue;
        }
        let event: WindowEventPayload = match serde_json::from_slice(&payload) {
            Ok(event) => event,
            Err(err) => {
                debug!(%err, "skipping malformed sway window event");
                continue;
            }
        };
        if !event.container.is_mapped_view() {
            continue;
        }
        let forwarded = match event.change.as_str() {
            "focus" => DisplayEvent::FocusShift(event.container.to_window()),
            "new" => DisplayEvent::NewWindow(event.container.to_window()),
            _ => continue,
        };
        if tx.send(forwarded).is_err() {
            return;
        }
    }
}

impl DisplayServer for SwayDisplay {
    fn set_opacity(&self, window: u64, opacity: f64) -> DisplayResult<()> {
        let opacity = opacity.clamp(0.0, 1.0);
        self.run_command(window, &format!("[con_id={window}] opacity {opacity}"))
    }

    fn opacity(&self, _window: u64) -> DisplayResult<Option<f64>> {
        // Sway exposes no query for the current opacity
        Ok(None)
    }

    fn is_fullscreen(&self, window: u64) -> DisplayResult<bool> {
        let tree = self.tree()?;
        match tree.find(window as i64) {
            Some(node) => Ok(node.fullscreen_mode.unwrap_or(0) != 0),
            None => Err(DisplayError::WindowGone(window)),
        }
    }

    fn destroy(&self, window: u64) -> DisplayResult<()> {
        self.run_command(window, &format!("[con_id={window}] kill"))
    }

    fn list_mapped_windows(&self, workspace: Option<u32>) -> DisplayResult<Vec<Window>> {
        let tree = self.tree()?;
        let mut windows = Vec::new();
        tree.visit_views(None, &mut |node, node_workspace| {
            let matches = match workspace {
                Some(target) => node_workspace == Some(target as i32),
                None => true,
            };
            if matches {
                windows.push(node.to_window());
            }
        });
        Ok(windows)
    }

    fn focused_window(&self) -> DisplayResult<Option<Window>> {
        let tree = self.tree()?;
        let mut focused = None;
        tree.visit_views(None, &mut |node, _| {
            if node.focused {
                focused = Some(node.to_window());
            }
        });
        Ok(focused)
    }

    fn focused_workspace(&self) -> DisplayResult<Option<u32>> {
        let reply = self
            .rpc
            .lock()
            .unwrap()
            .request(GET_WORKSPACES, b"")
            .map_err(backend_err)?;
        let workspaces: Vec<WorkspaceInfo> =
            serde_json::from_slice(&reply).map_err(|err| DisplayError::Backend(err.to_string()))?;
        Ok(workspaces
            .iter()
            .find(|ws| ws.focused)
            .map(|ws| ws.num.max(0) as u32))
    }

    fn poll_event(&self, timeout: Duration) -> DisplayResult<Option<DisplayEvent>> {
        match self.events.lock().unwrap().recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(DisplayError::Backend(
                "sway event connection closed".to_string(),
            )),
        }
    }

    fn disconnect(&self) {
        let _ = self.event_stream.shutdown(Shutdown::Both);
        if let Ok(rpc) = self.rpc.lock() {
            let _ = rpc.stream.shutdown(Shutdown::Both);
        }
    }
}

fn backend_err(err: io::Error) -> DisplayError {
    DisplayError::Backend(err.to_string())
}
