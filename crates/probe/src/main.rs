//! usbtarget probe
//!
//! Opens a USB device (or a simulated one) through the target layer and
//! exercises it: descriptor queries, pipe reads and writes, control
//! transfers and alternate-setting switches.

mod commands;
mod config;
mod usb;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use common::setup_logging;
use commands::{Output, parse_hex, parse_number};
use config::ProbeConfig;
use protocol::SetupPacket;
use std::sync::Arc;
use tracing::info;
use usbtarget::sim::{SimulatedDevice, SimulatedTransport};
use usbtarget::{Transport, UsbTargetDevice};
use usb::RusbTransport;

#[derive(Parser, Debug)]
#[command(name = "usbtarget-probe")]
#[command(
    author,
    version,
    about = "Exercise a USB device through the usbtarget target layer"
)]
#[command(long_about = "
Creates a USB target for one device and drives it the way a redirection
client would: descriptor queries, pipe I/O, control transfers and
alternate-setting switches.

EXAMPLES:
    # List attached devices
    usbtarget-probe list

    # Describe the first device matching a VID:PID filter
    usbtarget-probe --device 0x0781:* describe

    # Read 64 bytes from bulk IN endpoint 0x81
    usbtarget-probe read 0x81 64

    # GET_DESCRIPTOR(device) on the default pipe
    usbtarget-probe control 0x80 0x06 0x0100 0 18

    # Try everything against a simulated audio device
    usbtarget-probe --simulate audio set-alt 1 2

CONFIGURATION:
    The probe looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbtarget/probe.toml
    3. /etc/usbtarget/probe.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Device to open as VID:PID, overriding the configuration
    #[arg(short, long, value_name = "VID:PID")]
    device: Option<String>,

    /// Use a simulated device instead of real hardware
    #[arg(long, value_name = "PROFILE")]
    simulate: Option<SimProfile>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// List attached USB devices
    List,

    /// Show descriptors and the pipes of every interface
    Describe,

    /// Read from an IN endpoint
    Read {
        #[arg(value_parser = parse_number::<u8>)]
        endpoint: u8,
        #[arg(value_parser = parse_number::<usize>)]
        length: usize,
    },

    /// Write hex data to an OUT endpoint
    Write {
        #[arg(value_parser = parse_number::<u8>)]
        endpoint: u8,
        /// Bytes as hex, e.g. "55534243"
        data: String,
    },

    /// Control transfer on the default pipe
    Control {
        #[arg(value_parser = parse_number::<u8>)]
        request_type: u8,
        #[arg(value_parser = parse_number::<u8>)]
        request: u8,
        #[arg(value_parser = parse_number::<u16>)]
        value: u16,
        #[arg(value_parser = parse_number::<u16>)]
        index: u16,
        #[arg(value_parser = parse_number::<u16>)]
        length: u16,
        /// Data stage for OUT transfers, as hex
        #[arg(long)]
        data: Option<String>,
    },

    /// Select an alternate setting on an interface
    SetAlt {
        #[arg(value_parser = parse_number::<u8>)]
        interface: u8,
        #[arg(value_parser = parse_number::<u8>)]
        alt_setting: u8,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum SimProfile {
    /// Bulk-only mass storage, endpoints 0x81 and 0x02
    MassStorage,
    /// Audio device whose streaming interface has three settings
    Audio,
}

impl SimProfile {
    fn device(self) -> SimulatedDevice {
        match self {
            SimProfile::MassStorage => SimulatedDevice::mass_storage(),
            SimProfile::Audio => SimulatedDevice::alt_switching_audio(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = ProbeConfig::default();
        let path = ProbeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        ProbeConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ProbeConfig::load_or_default()
    };

    if let Some(device) = &args.device {
        config::validate_filter(device)?;
        config.usb.device = Some(device.clone());
    }

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.probe.log_level.clone());
    setup_logging(&log_level).context("Failed to setup logging")?;

    info!("usbtarget probe v{}", env!("CARGO_PKG_VERSION"));

    let command = args.command.clone().unwrap_or(Command::Describe);
    let output = Output { json: args.json };
    let simulate = args.simulate;

    // Transport calls block; keep them off the runtime's worker threads
    tokio::task::spawn_blocking(move || run(command, simulate, &config, output))
        .await
        .context("Probe task panicked")?
}

fn run(
    command: Command,
    simulate: Option<SimProfile>,
    config: &ProbeConfig,
    output: Output,
) -> Result<()> {
    if let Command::List = command {
        let devices = match simulate {
            Some(profile) => {
                let descriptor = profile.device().device_descriptor;
                vec![usb::DeviceSummary {
                    bus_number: 0,
                    device_address: 1,
                    vendor_id: descriptor.vendor_id,
                    product_id: descriptor.product_id,
                    class: descriptor.class,
                    speed: "Simulated".to_string(),
                    manufacturer: None,
                    product: Some(format!("{:?}", profile)),
                    serial_number: None,
                }]
            }
            None => {
                let context = rusb::Context::new().context("Failed to create libusb context")?;
                usb::list_devices(&context).context("Failed to enumerate USB devices")?
            }
        };
        return commands::list(&devices, output);
    }

    let transport: Arc<dyn Transport> = match simulate {
        Some(profile) => {
            info!("Using simulated {:?} device", profile);
            let sim = SimulatedTransport::new(profile.device());
            sim.set_auto_complete(true);
            Arc::new(sim)
        }
        None => Arc::new(RusbTransport::open(
            config.usb.device.as_deref(),
            config.usb.transfer_timeout(),
        )?),
    };

    let device = UsbTargetDevice::create(transport, &config.target)
        .context("Failed to create USB target")?;

    match command {
        Command::List => Ok(()),
        Command::Describe => commands::describe(&device, output),
        Command::Read { endpoint, length } => commands::read(&device, endpoint, length, output),
        Command::Write { endpoint, data } => {
            commands::write(&device, endpoint, &parse_hex(&data)?, output)
        }
        Command::Control {
            request_type,
            request,
            value,
            index,
            length,
            data,
        } => {
            let setup = SetupPacket {
                request_type,
                request,
                value,
                index,
                length,
            };
            let data = data.as_deref().map(parse_hex).transpose()?.unwrap_or_default();
            commands::control(&device, setup, &data, output)
        }
        Command::SetAlt {
            interface,
            alt_setting,
        } => commands::set_alt(&device, interface, alt_setting, output),
    }
}
