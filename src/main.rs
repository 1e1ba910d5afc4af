//! wayrfb - RFB/VNC server for wlroots compositors
//!
//! Entry point for the server binary.

use anyhow::Result;
use clap::Parser;
use tracing::info;

use wayrfb::config::Config;

/// Command-line arguments for wayrfb
#[derive(Parser, Debug)]
#[command(name = "wayrfb")]
#[command(version, about = "RFB/VNC server for wlroots compositors", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'C', long)]
    pub config: Option<String>,

    /// Frame capturing backend (screencopy|dmabuf)
    #[arg(short = 'c', long = "frame-capturing")]
    pub frame_capturing: Option<String>,

    /// Output to capture
    #[arg(short, long)]
    pub output: Option<String>,

    /// Keyboard layout, optionally with variant (e.g. "de" or "de-nodeadkeys")
    #[arg(short, long)]
    pub keyboard: Option<String>,

    /// Seat for input injection
    #[arg(short, long)]
    pub seat: Option<String>,

    /// Composite the cursor into captured frames
    #[arg(short = 'r', long = "render-cursor")]
    pub render_cursor: bool,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long, default_value = "compact")]
    pub log_format: String,

    /// Listen address
    pub address: Option<String>,

    /// Listen port
    pub port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!(
        "wayrfb v{} ({} {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_DATE")
    );

    // Load configuration; a missing default config file is fine.
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            let default_path = "/etc/wayrfb/config.toml";
            match Config::load(default_path) {
                Ok(config) => config,
                Err(e) => {
                    tracing::debug!("not using {}: {:#}", default_path, e);
                    Config::default()
                }
            }
        }
    };

    let config = config.with_overrides(
        args.address.clone(),
        args.port,
        args.frame_capturing.clone(),
        args.output.clone(),
        args.seat.clone(),
        args.keyboard.clone(),
        args.render_cursor,
    );
    config.validate()?;

    wayrfb::server::run(config)
}

fn init_logging(args: &Args) -> Result<()> {
    let log_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("wayrfb={level},warn", level = log_level))
    });

    match args.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .json()
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .pretty()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .compact()
                .init();
        }
    }

    Ok(())
}
