//! `fuctlogger` — raw serial capture into rolling, size-capped files.

use chrono::Local;
use indicatif::ProgressBar;
use log::{error, info};
use serialport::Parity;
use simplelog::{Config, LevelFilter, TermLogger, TerminalMode};
use structopt::StructOpt;

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

const DEFAULT_SIZE_LIMIT: u64 = 128_000_000;
const READ_CHUNK: usize = 1024;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "fuctlogger",
    about = "Dump the raw FreeEMS serial stream into rolling binary logfiles."
)]
struct Options {
    /// Path for the logfiles (default ./)
    #[structopt(short, long)]
    path: Option<PathBuf>,

    /// Prefix for the logfile name
    #[structopt(short = "x", long)]
    prefix: Option<String>,

    /// Size of a single logfile with unit (xxM/xxG)
    #[structopt(short, long, parse(try_from_str = parse_size_limit))]
    size: Option<u64>,

    /// Show debug information
    #[structopt(short, long)]
    debug: bool,

    /// Serial port device (eg. /dev/ttyUSB0, COM1)
    serial: String,
}

fn parse_size_limit(value: &str) -> Result<u64, String> {
    if value.len() < 2 {
        return Err(format!("size ({}) has no unit", value));
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let size: u64 = digits
        .parse()
        .map_err(|_| format!("size ({}) is not a numeric value", digits))?;
    match unit {
        "M" => Ok(size * 1_000_000),
        "G" => Ok(size * 1_000_000_000),
        other => Err(format!("size has invalid unit ({})", other)),
    }
}

fn log_filename(prefix: Option<&str>, dir: Option<&Path>) -> PathBuf {
    let name = format!(
        "{}-{}.bin",
        prefix.unwrap_or("log"),
        Local::now().format("%Y%m%d-%H%M%S")
    );
    match dir {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
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
    let mut port = fuct::open_port(&opts.serial, Parity::None)?;

    let base = log_filename(opts.prefix.as_deref(), opts.path.as_deref());
    let limit = opts.size.unwrap_or(DEFAULT_SIZE_LIMIT);
    info!("Opening logfile: {}", base.display());
    info!("Setting logfile size to: {} bytes", limit);

    let mut file = File::create(&base)?;
    let mut written: u64 = 0;
    let mut counter: u32 = 1;

    info!("Start logging... (Ctrl+C to quit)");
    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(120));

    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = match port.read(&mut chunk) {
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            continue;
        }

        if written >= limit {
            let next = PathBuf::from(format!("{}.{}", base.display(), counter));
            file = File::create(&next)?;
            written = 0;
            counter += 1;
            spinner.println(format!("=> {}", next.display()));
        }

        file.write_all(&chunk[..n])?;
        written += n as u64;
    }
}
