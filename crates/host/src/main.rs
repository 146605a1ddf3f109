//! tas-host
//!
//! Userspace host for a Teensy-based Mega Drive controller emulator. Feeds
//! the emulator either a recorded GMV movie or live key presses from evdev
//! devices, talking to it through raw usbdevfs interrupt transfers.

mod config;
mod input;
mod session;
mod terminal;
mod usb;

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use config::HostConfig;
use input::{EvdevDevice, InputAggregator, KeyMap};
use protocol::{Movie, MovieStream};
use session::{Responder, Session};
use std::path::PathBuf;
use terminal::EchoGuard;
use tracing::{info, warn};
use usb::DeviceLocator;

#[derive(Parser, Debug)]
#[command(name = "tas-host")]
#[command(
    author,
    version,
    about = "Drive a Mega Drive controller emulator over USB"
)]
#[command(long_about = "
Streams a GMV movie, or live keyboard input, to a Teensy-based Mega Drive
controller emulator. The emulator is found by its USB vendor/product id and
reconnected automatically when it is unplugged or reset.

EXAMPLES:
    # Play keyboard input from one device
    tas-host /dev/input/by-id/usb-keyboard-event-kbd

    # Stream a movie
    tas-host -m ~/movies/sonic.gmv

    # Run with debug logging
    tas-host --log-level debug /dev/input/event3

CONFIGURATION:
    The host looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/tas-host/host.toml
    3. /etc/tas-host/host.toml
    4. Built-in defaults

Text printed by the emulator on its debug interface goes to stdout, logs go
to stderr.
")]
struct Args {
    /// GMV movie to stream instead of live input
    #[arg(short, long, value_name = "PATH")]
    movie: Option<PathBuf>,

    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// evdev input devices to read key presses from
    #[arg(value_name = "INPUT_DEVICE")]
    inputs: Vec<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        HostConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.host.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("tas-host v{}", env!("CARGO_PKG_VERSION"));

    // a bad movie must stop us before the device is touched
    let movie = match &args.movie {
        Some(path) => {
            let path = config::expand_path(path)?;
            let movie = Movie::load(&path)
                .with_context(|| format!("Failed to load movie {}", path.display()))?;
            Some(MovieStream::new(movie))
        }
        None => None,
    };

    let inputs = EvdevDevice::open_all(&args.inputs, config.input.max_devices);
    if movie.is_none() && inputs.is_empty() {
        warn!("No movie and no input devices, the emulator will only see idle input");
    }

    let target = config.usb.target()?;
    let locator = DeviceLocator::new(config.usb.devfs_root()?, target);
    let aggregator = InputAggregator::new(KeyMap::from(&config.input.keymap));
    let responder = Responder::new(config.wire, movie, aggregator);

    let _echo = match EchoGuard::disable() {
        Ok(guard) => Some(guard),
        Err(e) => {
            warn!("Leaving terminal echo on: {}", e);
            None
        }
    };
    terminal::install_interrupt_handler().context("Failed to install SIGINT handler")?;

    let mut session = Session::new(locator, inputs, responder, config.usb.clone());
    session.run().context("Session failed")?;

    Ok(())
}
