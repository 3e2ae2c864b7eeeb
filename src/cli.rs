//! Command line interface.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::FlashLoneWindows;

/// Simple focus animations for tiling window managers.
#[derive(Debug, Parser)]
#[command(name = "flashwin", version, about)]
pub struct Cli {
    /// Config file location.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub flash: FlashArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ask the running daemon to flash the currently focused window.
    Flash,
}

/// Overrides for the global flash options. Unset flags fall through to the
/// config file and then to the built-in defaults.
#[derive(Debug, Default, Args)]
pub struct FlashArgs {
    /// Opacity of the window during a flash.
    #[arg(long, short = 'o')]
    pub flash_opacity: Option<f64>,

    /// Opacity windows are restored to after a flash.
    #[arg(long, short = 'e')]
    pub default_opacity: Option<f64>,

    /// Flash duration in milliseconds.
    #[arg(long, short = 't')]
    pub time: Option<f64>,

    /// Don't animate flashes. Improves performance at the cost of rougher
    /// opacity transitions.
    #[arg(long, short = 's')]
    pub simple: bool,

    /// Number of opacity steps in the flash animation. Higher values give
    /// smoother animations at the cost of more display server requests.
    /// Ignored if --simple is set.
    #[arg(long, short = 'n')]
    pub ntimepoints: Option<usize>,

    /// Whether windows are flashed when they gain focus. When false, windows
    /// only flash on request.
    #[arg(long)]
    pub flash_on_focus: Option<bool>,

    /// Whether windows that are alone on their workspace are flashed.
    #[arg(long, short = 'l', value_enum)]
    pub flash_lone_windows: Option<FlashLoneWindows>,

    /// Whether fullscreen windows are flashed.
    #[arg(long)]
    pub flash_fullscreen: Option<bool>,
}
