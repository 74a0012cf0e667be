//! `fuctloader` — check, load, verify, rip and erase FreeEMS firmware
//! through the serial monitor.

use chrono::Local;
use indicatif::ProgressBar;
use log::{debug, error, info, warn};
use serialport::{Parity, SerialPort};
use simplelog::{Config, LevelFilter, TermLogger, TerminalMode};
use structopt::StructOpt;

use fuct::monitor::Monitor;
use fuct::srecord::RecordKind;
use fuct::{pages, validator, Error};
use std::path::{Path, PathBuf};
use std::process;

/// Firmware pages live in `0xE0..=0xFF`; the monitor itself is above them.
const FIRST_PAGE: u8 = 0xE0;
const LAST_PAGE: u8 = 0xFF;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "fuctloader",
    about = "FreeEMS firmware loader: check your device, validate S19 files, load, verify, rip and erase firmware."
)]
struct Options {
    /// Serial port device (eg. /dev/ttyUSB0, COM1)
    #[structopt(short, long, env = "FUCT_PORT")]
    serial: Option<String>,

    /// Show debug information
    #[structopt(short, long)]
    debug: bool,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Validate an S19 firmware file (no device needed)
    Check {
        /// Location of the S19 firmware file
        firmware: PathBuf,
    },
    /// Poll the device for its part id and serial monitor
    Device,
    /// Validate, load and verify a firmware file
    Load {
        /// Location of the S19 firmware file
        firmware: PathBuf,
    },
    /// Load a firmware file without readback verification
    Fastload {
        /// Location of the S19 firmware file
        firmware: PathBuf,
    },
    /// Rip the firmware pages into an S19 file
    Rip {
        /// Output file (default rip-<timestamp>.s19)
        output: Option<PathBuf>,
    },
    /// Erase the firmware pages (the serial monitor is not erased)
    Erase,
}

fn main() {
    let opts = Options::from_args();
    let level = if opts.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    TermLogger::init(level, Config::default(), TerminalMode::Mixed).unwrap();

    match run(opts) {
        Ok(()) => info!("Exiting..."),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}

fn run(opts: Options) -> fuct::Result<()> {
    match &opts.command {
        Command::Check { firmware } => check(firmware),
        Command::Device => {
            let mut dev = open_monitor(&opts.serial)?;
            dev.analyse_monitor(true)
        }
        Command::Load { firmware } => load(&opts, firmware, true),
        Command::Fastload { firmware } => load(&opts, firmware, false),
        Command::Rip { output } => rip(&opts, output.clone()),
        Command::Erase => erase(&opts),
    }
}

/// Opens the port, restarts the monitor and refuses to go on with a part
/// FreeEMS does not run on.
fn open_monitor(serial: &Option<String>) -> fuct::Result<Monitor<Box<dyn SerialPort>>> {
    let path = serial
        .as_deref()
        .ok_or_else(|| Error::Protocol("serial port argument cannot be empty".into()))?;
    info!("Opening port {}", path);
    let port = fuct::open_port(path, Parity::None)?;

    info!("Checking device...");
    let mut dev = Monitor::new(port);
    dev.reinit()?;
    if !dev.check_device()? {
        return Err(Error::Protocol(
            "device failed verification, won't proceed".into(),
        ));
    }
    Ok(dev)
}

fn check(firmware: &Path) -> fuct::Result<()> {
    info!("Checking firmware...");
    let records = validator::verify_firmware(firmware)?;
    info!("Parsed {} records", records.len());

    match records.first() {
        Some(rec) if rec.kind == RecordKind::S0 => {
            if rec.data.iter().all(u8::is_ascii) {
                info!("Header info: [{}]", String::from_utf8_lossy(&rec.data));
            } else {
                info!("Header info: [binary data]");
            }
        }
        _ => warn!("No header..."),
    }
    info!("File OK");
    Ok(())
}

fn load(opts: &Options, firmware: &Path, verify: bool) -> fuct::Result<()> {
    info!("Checking firmware file...");
    let mut records = validator::verify_firmware(firmware)?;
    if records.is_empty() {
        return Err(Error::Protocol(
            "firmware file has no records, won't load".into(),
        ));
    }
    info!("File OK, got {} records", records.len());

    // The S0 banner and S8 terminator are not programmable data.
    let header = if records.first().map(|r| r.kind) == Some(RecordKind::S0) {
        Some(records.remove(0))
    } else {
        None
    };
    if records.last().map(|r| r.kind) == Some(RecordKind::S8) {
        records.pop();
    }

    info!("Converting records to memory pages...");
    let (pagelist, total) = pages::records_to_pages(&records)?;
    info!("Received {} pages", pagelist.len());
    if let Some(header) = &header {
        info!("Loading firmware: '{}'", String::from_utf8_lossy(&header.data));
    }

    let mut dev = open_monitor(&opts.serial)?;

    let bar = ProgressBar::new(total as u64);
    let mut last_page: Option<u8> = None;
    for page in &pagelist {
        debug!(
            "{:6} bytes to 0x{:02x} @ 0x{:04x}",
            page.data.len(),
            page.page,
            page.address
        );
        dev.erase_and_write(page, last_page != Some(page.page), verify)?;
        last_page = Some(page.page);
        bar.inc(page.data.len() as u64);
    }
    bar.finish_and_clear();

    info!("Firmware loaded successfully");
    Ok(())
}

fn rip(opts: &Options, output: Option<PathBuf>) -> fuct::Result<()> {
    let mut dev = open_monitor(&opts.serial)?;
    let path = output.unwrap_or_else(|| {
        PathBuf::from(format!("rip-{}.s19", Local::now().format("%Y%m%d-%H%M%S")))
    });

    info!(
        "Ripping pages from 0x{:02x} to 0x{:02x} into {}",
        FIRST_PAGE,
        LAST_PAGE,
        path.display()
    );
    let bar = ProgressBar::new(u64::from(LAST_PAGE - FIRST_PAGE) + 1);
    dev.rip_pages(FIRST_PAGE, LAST_PAGE, &path, &|n| bar.inc(n))?;
    bar.finish_and_clear();
    Ok(())
}

fn erase(opts: &Options) -> fuct::Result<()> {
    let mut dev = open_monitor(&opts.serial)?;

    info!("Erasing pages from 0x{:02x} to 0x{:02x}", FIRST_PAGE, LAST_PAGE);
    let bar = ProgressBar::new(u64::from(LAST_PAGE - FIRST_PAGE) + 1);
    dev.erase_pages(FIRST_PAGE, LAST_PAGE, &|n| bar.inc(n))?;
    bar.finish_and_clear();
    Ok(())
}
