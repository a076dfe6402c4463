//! Small command-line front-end: list instruments, fire off queries.

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use usbtmc::Instrument;

#[derive(Parser)]
#[command(name = "usbtmc-cli", version, about = "Talk to USBTMC instruments")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List connected USBTMC devices as resource strings
    List,
    /// Send a command and print the reply
    Query {
        /// Resource string, e.g. USB::0x0957::0x1755::INSTR
        resource: String,
        /// SCPI command to send, e.g. *IDN?
        command: String,
        /// Per-operation timeout in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Send a command without reading a reply
    Write {
        resource: String,
        command: String,
    },
    /// Issue a device clear
    Clear { resource: String },
    /// Read the status byte (USB488 devices)
    Stb { resource: String },
}

fn main() -> Result<()> {
    env_logger::init();

    match Cli::parse().command {
        Command::List => {
            for dev in usbtmc::list_devices()? {
                match &dev.serial {
                    Some(serial) => println!(
                        "USB0::0x{:04X}::0x{:04X}::{}::INSTR",
                        dev.vendor_id, dev.product_id, serial
                    ),
                    None => println!(
                        "USB0::0x{:04X}::0x{:04X}::INSTR",
                        dev.vendor_id, dev.product_id
                    ),
                }
            }
        }
        Command::Query {
            resource,
            command,
            timeout_ms,
        } => {
            let mut instrument = Instrument::open_resource(&resource)?;
            instrument.set_timeout(Duration::from_millis(timeout_ms));
            println!("{}", instrument.ask(&command, None)?);
        }
        Command::Write { resource, command } => {
            let mut instrument = Instrument::open_resource(&resource)?;
            instrument.write(&command)?;
        }
        Command::Clear { resource } => {
            let mut instrument = Instrument::open_resource(&resource)?;
            instrument.clear()?;
        }
        Command::Stb { resource } => {
            let mut instrument = Instrument::open_resource(&resource)?;
            println!("0x{:02X}", instrument.read_stb()?);
        }
    }

    Ok(())
}
