//! Host-side console tools for FreeEMS engine control units.
//!
//! FreeEMS runs on Freescale S12X/XE parts whose banked flash is programmed
//! through the ROM-resident serial monitor (application note AN2548) and
//! whose running firmware speaks a framed, escaped, checksummed
//! request/response protocol over the same serial link. This crate
//! implements both sides of that toolchain:
//!
//! * [`srecord`], [`validator`] and [`pages`] handle Motorola S19 firmware
//!   images and turn them into programmable 16 KiB pages.
//! * [`monitor`] drives the serial monitor to erase, program, verify and rip
//!   banked flash.
//! * [`protocol`], [`rx`], [`interrogator`] and [`trigger`] implement the
//!   application protocol: a background receiver demultiplexes telemetry and
//!   command replies while the foreground interrogates the firmware or tunes
//!   the decoder trigger offset.

#![warn(missing_debug_implementations, rust_2018_idioms)]

mod error;
pub mod interrogator;
pub mod monitor;
pub mod pages;
pub mod protocol;
pub mod rx;
pub mod srecord;
pub mod trigger;
pub mod validator;

pub use crate::error::{Error, Result};

use serialport::{DataBits, Parity, SerialPort, StopBits};
use std::time::Duration;

/// Line rate shared by the serial monitor and the application protocol.
pub const BAUD_RATE: u32 = 115_200;

/// Port read timeout. Callers treat a short read after this as "nothing
/// more arrived", not as a failure.
pub const READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Opens a serial port the way every tool here expects it: 115200 baud,
/// 8 data bits, one stop bit, caller-chosen parity.
pub fn open_port(path: &str, parity: Parity) -> Result<Box<dyn SerialPort>> {
    let port = serialport::new(path, BAUD_RATE)
        .data_bits(DataBits::Eight)
        .parity(parity)
        .stop_bits(StopBits::One)
        .timeout(READ_TIMEOUT)
        .open()?;
    Ok(port)
}
