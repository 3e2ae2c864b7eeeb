//! Client side of the control socket.
//!
//! The wire protocol is a single datagram of one byte with no reply; the
//! daemon resolves the focused window itself.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use tracing::debug;

pub const SOCKET_NAME: &str = "flashwin.sock";

/// Control socket address: `$XDG_RUNTIME_DIR/flashwin.sock`, with a `/tmp`
/// fallback when the runtime dir is not set.
pub fn socket_path() -> PathBuf {
    socket_path_in(env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from))
}

fn socket_path_in(runtime_dir: Option<PathBuf>) -> PathBuf {
    runtime_dir
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(SOCKET_NAME)
}

/// Ask the running daemon to flash the currently focused window.
pub fn request_flash() -> Result<()> {
    let path = socket_path();
    debug!(socket = %path.display(), "sending flash request to the daemon");
    let socket = UnixDatagram::unbound().context("failed to create client socket")?;
    socket.send_to(b"1", &path).with_context(|| {
        format!(
            "could not reach the flashwin daemon at {} - is it running?",
            path.display()
        )
    })?;
    Ok(())
}
