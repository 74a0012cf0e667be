//! `fucttrigger` — adjust the decoder trigger offset on a live FreeEMS
//! install.
//!
//! Use a timing light and flat timing tables (eg. 10 deg BTDC) so the
//! reading is consistent; an initial offset can be pushed to the device as
//! the tool starts.

use log::{error, info};
use serialport::Parity;
use simplelog::{Config, LevelFilter, TermLogger, TerminalMode};
use structopt::StructOpt;

use fuct::interrogator::{FirmwareMeta, Interrogator};
use fuct::rx::{AppClient, RxThread, LOG_QUEUE_SIZE, RESPONSE_QUEUE_SIZE};
use fuct::trigger::{TriggerSession, ANGLE_MAX};
use std::io;
use std::process;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "fucttrigger",
    about = "Adjust the decoder trigger offset on a fresh FreeEMS install."
)]
struct Options {
    /// Initial trigger offset in degrees ATDC (0-719.98)
    #[structopt(short, long, parse(try_from_str = parse_offset))]
    offset: Option<f64>,

    /// Query firmware metadata before tuning
    #[structopt(short, long)]
    info: bool,

    /// Show debug information
    #[structopt(short, long)]
    debug: bool,

    /// Serial port device (eg. /dev/ttyUSB0, COM1)
    serial: String,
}

fn parse_offset(value: &str) -> Result<f64, String> {
    let degrees: f64 = value
        .parse()
        .map_err(|_| format!("value {} is not a number", value))?;
    if !(0.0..=ANGLE_MAX).contains(&degrees) {
        return Err(format!("value {} is invalid, use 0-{:.2}", degrees, ANGLE_MAX));
    }
    Ok(degrees)
}

fn main() {
    let opts = Options::from_args();
    let level = if opts.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    TermLogger::init(level, Config::default(), TerminalMode::Mixed).unwrap();

    if let Err(e) = run(opts) {
        error!("{}", e);
        process::exit(1);
    }
}

fn run(opts: Options) -> fuct::Result<()> {
    info!("Opening port {}", opts.serial);
    // The running firmware talks with odd parity, unlike the monitor.
    let port = fuct::open_port(&opts.serial, Parity::Odd)?;
    let reader = port.try_clone()?;

    let (response_tx, response_rx) = crossbeam_channel::bounded(RESPONSE_QUEUE_SIZE);
    let (log_tx, log_rx) = crossbeam_channel::bounded(LOG_QUEUE_SIZE);
    let rx_thread = RxThread::spawn(reader, response_tx, log_tx)?;

    let mut client = AppClient::new(port, response_rx);

    let result = (|| {
        if opts.info {
            let meta = Interrogator::new(&mut client).interrogate()?;
            print_meta(&meta);
        }

        let mut session = TriggerSession::new(client, log_rx);
        session.init(opts.offset)?;

        let stdin = io::stdin();
        let mut lines = stdin.lock();
        session.run(&mut lines)
    })();

    rx_thread.stop();
    result
}

fn print_meta(meta: &FirmwareMeta) {
    info!("Interface:  {}", meta.interface.as_deref().unwrap_or("?"));
    info!("Firmware:   {}", meta.firmware.as_deref().unwrap_or("?"));
    info!("Decoder:    {}", meta.decoder.as_deref().unwrap_or("?"));
    info!("Built:      {}", meta.build_date.as_deref().unwrap_or("?"));
    info!("Compiler:   {}", meta.compiler.as_deref().unwrap_or("?"));
    info!("OS:         {}", meta.operating_system.as_deref().unwrap_or("?"));
    info!("Built by:   {}", meta.built_by.as_deref().unwrap_or("?"));
    info!("Email:      {}", meta.email.as_deref().unwrap_or("?"));
    info!("Locations:  {} ids", meta.locations.len());
}
