#![forbid(unsafe_code)]

mod cli;
mod client;
mod config;
mod display;
mod flasher;
mod pid;
mod producer;
mod router;
mod server;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{Level as TraceLevel, info};
use tracing_subscriber::FmtSubscriber;

use cli::{Cli, Command};
use config::Config;
use server::FlashServer;

fn main() -> Result<()> {
    // Parse log level from environment variable
    let log_level = match std::env::var("LOG_LEVEL")
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => TraceLevel::TRACE,
        "debug" => TraceLevel::DEBUG,
        "warn" => TraceLevel::WARN,
        "error" => TraceLevel::ERROR,
        _ => TraceLevel::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install the tracing subscriber")?;

    let cli = Cli::parse();
    match cli.command {
        Some(Command::Flash) => client::request_flash(),
        None => run_server(&cli),
    }
}

fn run_server(cli: &Cli) -> Result<()> {
    let _pid_lock = pid::ensure_single_instance()?;

    let config = Config::load(cli.config.as_deref(), &cli.flash)?;
    info!("config={config:#?}");

    let display = display::connect()?;
    let server = FlashServer::new(&config, display)?;

    // SIGINT/SIGTERM flip the stop flag; the consume loop notices within its
    // queue timeout and runs the shutdown path
    let stop = server.stop_flag();
    signal_hook::flag::register(signal_hook::consts::SIGINT, stop.clone())
        .context("failed to register the SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, stop)
        .context("failed to register the SIGTERM handler")?;

    server.run()
}
