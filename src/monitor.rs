//! Client for the Freescale serial monitor (application note AN2548).
//!
//! The monitor is a 2 KiB ROM-resident debugger taking single-byte commands
//! at 115200 8-N-1. Transactions are strictly paced: write the command, give
//! the line time to carry the echoed bytes and the reply, then read and check
//! the three-byte `<response> <status> '>'` trailer.

use crate::pages::{MemoryPage, MAX_PAGE_SIZE, WINDOW_END, WINDOW_START};
use crate::srecord::{RecordKind, SRecord};
use crate::{Error, Result};
use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

/// Byte-granular, flushable link to the monitor.
///
/// `serialport` provides the production implementation; tests substitute a
/// scripted mock.
pub trait MonitorLink: io::Read + io::Write {
    /// Drops whatever is sitting in the receive buffer.
    fn discard_input(&mut self) -> io::Result<()>;
}

impl MonitorLink for Box<dyn serialport::SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Monitor command bytes.
#[allow(unused)]
enum Command {
    ReadByte = 0xA1,
    WriteByte = 0xA2,
    ReadWord = 0xA3,
    WriteWord = 0xA4,
    ReadNext = 0xA5,
    WriteNext = 0xA6,
    ReadBlock = 0xA7,
    WriteBlock = 0xA8,
    ReadRegs = 0xA9,
    WriteSp = 0xAA,
    WritePc = 0xAB,
    WriteIy = 0xAC,
    WriteIx = 0xAD,
    WriteD = 0xAE,
    WriteCcr = 0xAF,
    Go = 0xB1,
    TraceOne = 0xB2,
    Halt = 0xB3,
    Reset = 0xB4,
    EraseRange = 0xB5, // not implemented in the monitor
    EraseAll = 0xB6,
    DeviceInfo = 0xB7,
    ErasePage = 0xB8,
    EraseEeprom = 0xB9,
    /// Carriage return; opens the monitor session.
    Open = 0x0D,
}

// Response codes
const RC_NO_ERROR: u8 = 0xE0;
const RC_NOT_RECOGNISED: u8 = 0xE1;

// Status codes
const SC_MONITOR_ACTIVE: u8 = 0x00;
const SC_COLD_RESET_EXECUTED: u8 = 0x08;

/// The `>` prompt closing every reply.
const PROMPT: u8 = 0x3E;

/// PPAGE register address; writing it selects the bank in the window.
const PPAGE_ADDR: u16 = 0x0030;

const DEVICE_INFO_CONSTANT: u8 = 0xDC;
const BLOCK_SIZE: usize = 256;

// Metadata offsets inside the monitor image.
const SM_DEVICE_IDX: usize = 0x06F8;
const SM_MONTH_IDX: usize = 0x06FA;
const SM_DAY_IDX: usize = 0x06FB;
const SM_YEAR_IDX: usize = 0x06FC;
const SM_VERSION_IDX: usize = 0x06FE;

/// Line time of one 10-bit byte at 115200 baud.
pub const NS_PER_BYTE: u64 = 86_805;

/// Data bytes per S2 record in ripped images.
const RIP_RECORD_LEN: usize = 16;

/// The 16-bit part id word returned by the device-info command.
///
/// Bits 15-12 are the major family, 11-8 the minor family, 7-4 the major
/// mask revision and 3-0 the minor mask revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId(pub u16);

impl DeviceId {
    pub fn family(self) -> u8 {
        (self.0 >> 12) as u8
    }

    pub fn minor_family(self) -> u8 {
        (self.0 >> 8 & 0x0F) as u8
    }

    pub fn mask_major(self) -> u8 {
        (self.0 >> 4 & 0x0F) as u8
    }

    pub fn mask_minor(self) -> u8 {
        (self.0 & 0x0F) as u8
    }

    /// What the part id says about running FreeEMS on this chip.
    pub fn classify(self) -> DeviceClass {
        match self.family() {
            0x0C => {
                if self.minor_family() == 0x04 && self.mask_major() == 1 && self.mask_minor() <= 2 {
                    DeviceClass::FreeEms
                } else if self.minor_family() <= 1 && self.mask_major() == 0 {
                    DeviceClass::WrongMaskset
                } else if self.minor_family() == 0x0C
                    && (self.mask_major() == 8 || self.mask_major() == 9)
                    && self.mask_minor() <= 2
                {
                    DeviceClass::Xep100
                } else {
                    DeviceClass::UnknownS12
                }
            }
            0x03 => DeviceClass::S12C,
            _ => DeviceClass::Unknown,
        }
    }
}

/// Classification of a part id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// S12XE with the maskset FreeEMS targets.
    FreeEms,
    /// Plausible S12X/XE, unexpected maskset.
    WrongMaskset,
    /// XEP100 part (Megasquirt-III hardware).
    Xep100,
    /// S12X/XE family, unrecognized variant.
    UnknownS12,
    /// S12C family (Megasquirt-II / Microsquirt hardware).
    S12C,
    Unknown,
}

/// Driver for the serial monitor.
///
/// # Type Parameters
///
/// * **`L`**: the serial link the monitor answers on.
pub struct Monitor<L: MonitorLink> {
    link: L,
    ns_per_byte: u64,
}

impl<L: MonitorLink> Monitor<L> {
    pub fn new(link: L) -> Monitor<L> {
        Monitor {
            link,
            ns_per_byte: NS_PER_BYTE,
        }
    }

    /// Overrides the per-byte line time used for read pacing. Useful for
    /// adapters that buffer aggressively.
    pub fn set_byte_time(&mut self, ns_per_byte: u64) {
        self.ns_per_byte = ns_per_byte;
    }

    /// Resets the MCU and reopens the monitor session.
    pub fn reinit(&mut self) -> Result<()> {
        self.reset()?;
        self.open_comm()
    }

    /// Reads and decodes the part id word.
    pub fn identify(&mut self) -> Result<DeviceId> {
        let data = self.transact(Command::DeviceInfo as u8, &[], 6, Duration::from_millis(0))?;
        if data.len() != 3 {
            return Err(Error::Protocol(format!(
                "invalid device info size ({} bytes), should be 3 bytes",
                data.len()
            )));
        }
        if data[0] != DEVICE_INFO_CONSTANT {
            return Err(Error::Protocol(format!(
                "invalid device info constant (0x{:02x}), should be 0x{:02x}",
                data[0], DEVICE_INFO_CONSTANT
            )));
        }
        let id = DeviceId(u16::from_be_bytes([data[1], data[2]]));
        debug!("Device ID: 0x{:04x}", id.0);
        Ok(id)
    }

    /// Identifies the part and reports whether FreeEMS will run on it.
    pub fn check_device(&mut self) -> Result<bool> {
        let id = self.identify()?;
        match id.classify() {
            DeviceClass::FreeEms => {
                info!("Device is S12X/XE family");
                info!("Device looks FreeEMS compatible :)");
                return Ok(true);
            }
            DeviceClass::WrongMaskset => {
                info!("Device is S12X/XE family");
                warn!("Device looks FreeEMS compatible, but with wrong maskset :/");
            }
            DeviceClass::Xep100 => {
                info!("Device is S12X/XE family");
                warn!("Device looks XEP100 (Megasquirt-III?)");
            }
            DeviceClass::UnknownS12 => {
                info!("Device is S12X/XE family");
                warn!("Device is not FreeEMS compatible :(");
            }
            DeviceClass::S12C => warn!("Device is S12C family (Megasquirt-II/Microsquirt?)"),
            DeviceClass::Unknown => error!("Device is unknown family"),
        }
        Ok(false)
    }

    /// Reads the 2 KiB monitor image and logs what it says about itself.
    ///
    /// With `dump`, the image is also written to `serialmonitor.dat` as
    /// `addr:::hex` lines for offline analysis.
    pub fn analyse_monitor(&mut self, dump: bool) -> Result<()> {
        let mut file = if dump {
            let mut f = File::create("serialmonitor.dat")?;
            writeln!(f, "# Ripped serialmonitor range (F800-FF00)")?;
            writeln!(f, "# Format: <memory address>:::<hexdata (256 bytes)>")?;
            Some(f)
        } else {
            None
        };

        let mut image = Vec::with_capacity(2048);
        for index in 0..8u16 {
            let addr = 0xF800 + index * BLOCK_SIZE as u16;
            let block = self.read_block(addr, 0xFF)?;
            if let Some(f) = file.as_mut() {
                writeln!(f, "{:04x}:::{}", addr, hex::encode(&block))?;
            }
            image.extend_from_slice(&block);
        }

        if image.len() != 2048 {
            return Err(Error::Protocol(format!(
                "invalid SM size ({} bytes), should be 2k",
                image.len()
            )));
        }

        debug!("SM SHA-256: {}", hex::encode(Sha256::digest(&image)));
        debug!(
            "SM Device ID: 0x{:02x}{:02x}",
            image[SM_DEVICE_IDX],
            image[SM_DEVICE_IDX + 1]
        );
        debug!(
            "SM Date: {:02x}/{:02x}/{:02x}{:02x}",
            image[SM_MONTH_IDX],
            image[SM_DAY_IDX],
            image[SM_YEAR_IDX],
            image[SM_YEAR_IDX + 1]
        );
        info!(
            "SM Version: {:x}.{:x}",
            image[SM_VERSION_IDX],
            image[SM_VERSION_IDX + 1]
        );
        Ok(())
    }

    /// Programs one page image, optionally erasing the bank first and
    /// verifying every block by readback.
    pub fn erase_and_write(&mut self, mempage: &MemoryPage, erase: bool, verify: bool) -> Result<()> {
        if mempage.address < WINDOW_START || mempage.address >= WINDOW_END {
            return Err(Error::Range(format!(
                "address 0x{:04x} is out of range for page 0x{:02x}",
                mempage.address, mempage.page
            )));
        }
        if mempage.data.len() > (WINDOW_END - mempage.address) as usize {
            return Err(Error::Range(format!(
                "invalid amount of data ({} bytes), will overflow page 0x{:02x} @ 0x{:04x}",
                mempage.data.len(),
                mempage.page,
                mempage.address
            )));
        }

        if erase {
            self.set_page(mempage.page)?;
            self.erase_page()?;
        }

        let mut addr = mempage.address;
        for block in mempage.data.chunks(BLOCK_SIZE) {
            self.write_block(addr, block)?;
            if verify {
                let readback = self.read_block(addr, (block.len() - 1) as u8)?;
                if readback != block {
                    return Err(Error::Verify(addr));
                }
            }
            addr += block.len() as u16;
        }
        Ok(())
    }

    /// Rips banked pages `start..=end` into an S19 file: a banner header,
    /// 16-byte S2 records and an S8 terminator, CRLF line endings.
    /// `progress` is called once per finished page.
    pub fn rip_pages(
        &mut self,
        start: u8,
        end: u8,
        path: &Path,
        progress: &dyn Fn(u64),
    ) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);

        let header = SRecord::new(
            RecordKind::S0,
            vec![0x00, 0x00],
            b"S19 ripped by fuct".to_vec(),
        );
        write!(out, "{}\r\n", header.to_line())?;

        for page in start..=end {
            self.set_page(page)?;
            let data = self.read_page()?;

            let mut addr = WINDOW_START;
            for chunk in data.chunks(RIP_RECORD_LEN) {
                let record = SRecord::new(
                    RecordKind::S2,
                    vec![page, (addr >> 8) as u8, addr as u8],
                    chunk.to_vec(),
                );
                write!(out, "{}\r\n", record.to_line())?;
                addr += chunk.len() as u16;
            }
            progress(1);
        }

        let terminator = SRecord::new(RecordKind::S8, vec![0x00, 0xC0, 0x00], Vec::new());
        write!(out, "{}\r\n", terminator.to_line())?;
        out.flush()?;

        info!("Firmware ripped successfully");
        Ok(())
    }

    /// Erases banked pages `start..=end`. `progress` is called per page.
    pub fn erase_pages(&mut self, start: u8, end: u8, progress: &dyn Fn(u64)) -> Result<()> {
        for page in start..=end {
            self.set_page(page)?;
            self.erase_page()?;
            progress(1);
        }
        info!("Firmware erased successfully");
        Ok(())
    }

    /// Selects the 16 KiB bank mapped into the window.
    pub fn set_page(&mut self, page: u8) -> Result<()> {
        self.write_byte(PPAGE_ADDR, page)
    }

    // -----

    fn reset(&mut self) -> Result<()> {
        self.write_command(Command::Reset as u8, &[])?;
        // Whatever the dying session sends back is stale; drop it.
        let _ = self.read_after_wait(5, Duration::from_millis(2))?;
        Ok(())
    }

    fn open_comm(&mut self) -> Result<()> {
        self.write_command(Command::Open as u8, &[])?;
        // 3 or 4 bytes depending on whether the port shows us the CR echo.
        let reply = self.read_after_wait(4, Duration::from_millis(0))?;
        if reply.len() < 3 {
            return Err(Error::Protocol("invalid open response (too few bytes)".into()));
        }
        let trailer = &reply[reply.len() - 3..];
        let accepted = trailer == [RC_NO_ERROR, SC_COLD_RESET_EXECUTED, PROMPT]
            || trailer == [RC_NOT_RECOGNISED, SC_MONITOR_ACTIVE, PROMPT];
        if !accepted {
            return Err(Error::Protocol(
                "invalid open response, is the device in load/SM mode?".into(),
            ));
        }
        Ok(())
    }

    fn write_byte(&mut self, addr: u16, value: u8) -> Result<()> {
        let args = addr_args(addr, value);
        self.transact(Command::WriteByte as u8, &args, 3, Duration::from_millis(0))?;
        Ok(())
    }

    /// Reads `count + 1` bytes starting at `addr`.
    fn read_block(&mut self, addr: u16, count: u8) -> Result<Vec<u8>> {
        let args = addr_args(addr, count);
        self.transact(
            Command::ReadBlock as u8,
            &args,
            count as usize + 4,
            Duration::from_millis(0),
        )
    }

    fn write_block(&mut self, addr: u16, data: &[u8]) -> Result<()> {
        if data.is_empty() || data.len() > BLOCK_SIZE {
            return Err(Error::Range(format!(
                "block has {} bytes, needs to be 1-256 bytes",
                data.len()
            )));
        }
        let mut args = Vec::with_capacity(3 + data.len());
        args.extend_from_slice(&addr_args(addr, (data.len() - 1) as u8));
        args.extend_from_slice(data);
        self.transact(Command::WriteBlock as u8, &args, 3, Duration::from_millis(0))?;
        Ok(())
    }

    fn erase_page(&mut self) -> Result<()> {
        // Bulk erase needs real settling time on top of the line budget;
        // 330 ms could go a bit lower but is known safe.
        self.transact(Command::ErasePage as u8, &[], 3, Duration::from_millis(330))?;
        Ok(())
    }

    /// Reads the full 16 KiB window in 256-byte blocks.
    fn read_page(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(MAX_PAGE_SIZE);
        let mut addr = WINDOW_START;
        for _ in 0..MAX_PAGE_SIZE / BLOCK_SIZE {
            let block = self.read_block(addr, 0xFF)?;
            data.extend_from_slice(&block);
            addr = addr.wrapping_add(BLOCK_SIZE as u16);
        }
        Ok(data)
    }

    /// One paced command round trip. `resp_len` counts the reply including
    /// its trailer; the pacing budget additionally covers the echoed bytes.
    /// Returns the reply with the trailer stripped.
    fn transact(
        &mut self,
        cmd: u8,
        args: &[u8],
        resp_len: usize,
        extra: Duration,
    ) -> Result<Vec<u8>> {
        debug_assert!(resp_len >= 3);
        self.write_command(cmd, args)?;

        let total = 1 + args.len() + resp_len;
        let reply = self.read_after_wait(total, extra)?;
        if reply.len() < resp_len {
            return Err(Error::Protocol(format!(
                "short reply to command 0x{:02x} ({} of {} bytes)",
                cmd,
                reply.len(),
                resp_len
            )));
        }

        // Some adapters loop the written bytes back, some do not; the reply
        // proper is always the tail of what arrived.
        let resp = &reply[reply.len() - resp_len..];
        let (data, trailer) = resp.split_at(resp_len - 3);
        if trailer != [RC_NO_ERROR, SC_MONITOR_ACTIVE, PROMPT] {
            return Err(Error::Protocol(format!(
                "invalid response to command 0x{:02x} (no prompt or unrecognized command)",
                cmd
            )));
        }
        Ok(data.to_vec())
    }

    fn write_command(&mut self, cmd: u8, args: &[u8]) -> Result<()> {
        self.link.discard_input()?;
        debug!("--> 0x{:02x}", cmd);
        self.write_all(&[cmd])?;
        if !args.is_empty() {
            debug!("--> {}", hex::encode(args));
            self.write_all(args)?;
        }
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        match self.link.write_all(bytes) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Err(Error::Timeout(
                "serial timeout occurred when sending command, check port connection".into(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Sleeps out the pacing budget for `total` line bytes plus `extra`,
    /// then reads whatever arrives, up to `total` bytes.
    fn read_after_wait(&mut self, total: usize, extra: Duration) -> Result<Vec<u8>> {
        let budget = pacing(self.ns_per_byte, total, extra);
        debug!("~ {:.2} ms ({} bytes)", budget.as_secs_f64() * 1000.0, total);
        sleep_until(Instant::now() + budget);

        let mut buf = vec![0u8; total];
        let mut got = 0;
        while got < total {
            match self.link.read(&mut buf[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(got);
        debug!("<-- {}", hex::encode(&buf));
        Ok(buf)
    }
}

impl<L: MonitorLink> fmt::Debug for Monitor<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("ns_per_byte", &self.ns_per_byte)
            .finish()
    }
}

fn addr_args(addr: u16, value: u8) -> [u8; 3] {
    [(addr >> 8) as u8, addr as u8, value]
}

/// Pre-read delay for a transaction expected to move `total` bytes.
fn pacing(ns_per_byte: u64, total: usize, extra: Duration) -> Duration {
    let line = Duration::from_nanos(total as u64 * ns_per_byte) + extra;
    line.max(Duration::from_millis(1))
}

/// Sleeps to a monotonic deadline: coarse bulk sleep, then a spin tail, so
/// the budget holds even where the OS rounds sleeps up.
fn sleep_until(deadline: Instant) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let left = deadline - now;
        if left > Duration::from_millis(2) {
            thread::sleep(left - Duration::from_millis(1));
        } else {
            std::hint::spin_loop();
        }
    }
}
