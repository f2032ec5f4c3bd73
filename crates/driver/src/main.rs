//! harmony-remote
//!
//! Prints the keys of a Harmony remote paired with a Unifying receiver.
//! A long press on OFF exits.

use anyhow::{Context, Result};
use clap::Parser;
use common::{Reactor, Transport, setup_logging};
use driver::config::{self, Config};
use driver::remote::Remote;
use driver::usb::UsbTransport;
use protocol::{KeyCode, MAX_PAIRED_DEVICES};
use std::rc::Rc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "harmony-remote")]
#[command(
    author,
    version,
    about = "Harmony remote driver - print key presses from a Unifying receiver"
)]
#[command(long_about = "
Reads key presses of a Logitech Harmony remote through its Unifying USB
receiver and prints them. Hold OFF to exit.

EXAMPLES:
    # Run with default config
    harmony-remote

    # Run with custom config
    harmony-remote --config ~/remote.toml

    # List the devices paired with the receiver first
    harmony-remote --names

    # Poll the receiver directly instead of running the event loop
    harmony-remote --blocking

CONFIGURATION:
    The driver looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/harmony-remote/config.toml
    3. /etc/harmony-remote/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Wait for keys with blocking calls instead of the event loop
    #[arg(long)]
    blocking: bool,

    /// Print the names of the paired devices before reading keys
    #[arg(long)]
    names: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = Config::default();
        let path = Config::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        Config::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("harmony-remote v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Looking for receiver {:04x}:{:04x}",
        config.receiver.vendor_id, config.receiver.product_id
    );

    let transport = UsbTransport::new().context("Failed to initialize libusb")?;

    if args.blocking {
        run_blocking(transport, &config, args.names);
        Ok(())
    } else {
        run_event_loop(transport, &config, args.names)
    }
}

fn print_key(key: KeyCode) {
    println!("{:#07x} {}", key.raw(), key);
}

fn print_paired_devices<T: Transport + 'static>(remote: &Remote<T>) {
    for slot in 0..MAX_PAIRED_DEVICES {
        if let Some(name) = remote.paired_device_name(slot) {
            println!("Paired device {}: {}", slot + 1, name);
        }
    }
}

fn run_event_loop(transport: UsbTransport, config: &Config, names: bool) -> Result<()> {
    let reactor = Rc::new(Reactor::new());
    let remote = Remote::new(transport, Some(Rc::clone(&reactor)), config);

    if names {
        print_paired_devices(&remote);
    }

    let stopper = Rc::downgrade(&reactor);
    remote.set_key_callback(move |key| {
        print_key(key);
        if key == KeyCode::OFF.long()
            && let Some(reactor) = stopper.upgrade()
        {
            info!("OFF held, exiting");
            reactor.stop();
        }
    });

    info!("Hold OFF to exit");
    reactor.run().context("Event loop failed")?;
    Ok(())
}

fn run_blocking(transport: UsbTransport, config: &Config, names: bool) {
    let remote = Remote::new(transport, None, config);
    if names {
        print_paired_devices(&remote);
    }

    info!("Hold OFF to exit");
    loop {
        let key = remote.get_key();
        print_key(key);
        if key == KeyCode::OFF.long() {
            info!("OFF held, exiting");
            break;
        }
    }
}
