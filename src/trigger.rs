//! Interactive tuning of the decoder trigger offset.
//!
//! The trigger offset is the angle between the crank reference tooth and
//! TDC, stored in flash as a big-endian word counting 0.02° steps. The
//! session reads the stored value, applies operator adjustments one write at
//! a time, and keeps an eye on the live datalog stream to tell the operator
//! whether the ignition advance is holding steady.

use crate::protocol::{self, FE_LOCATION_TRIGGER};
use crate::rx::AppClient;
use crate::{Error, Result};
use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use regex::Regex;
use std::fmt;
use std::io::{self, BufRead, Write};

/// Raw units per degree; the trigger word counts 0.02° steps.
pub const ANGLE_FACTOR: f64 = 50.0;
/// Largest expressible offset in degrees (two crank revolutions).
pub const ANGLE_MAX: f64 = 719.98;
/// Telemetry frames drained per prompt.
const LOG_DRAIN: usize = 50;
/// Offset of the ignition advance word in a datalog frame.
const ADVANCE_OFFSET: usize = 54;

pub fn to_angle(raw: u16) -> f64 {
    f64::from(raw) / ANGLE_FACTOR
}

pub fn to_raw_angle(degrees: f64) -> u16 {
    (degrees * ANGLE_FACTOR).round() as u16
}

/// Pattern for absolute offset input: up to three integer digits and an
/// optional two-digit fraction.
pub fn absolute_pattern() -> Regex {
    Regex::new(r"^\d{1,3}(\.\d{1,2})?$").expect("static pattern")
}

/// One line of operator input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// Relative adjustment in raw units.
    Adjust(i32),
    /// Absolute offset in raw units.
    Absolute(u16),
    /// Print the current advance and offset.
    Show,
    /// Leave the tool.
    Quit,
    /// Anything unrecognized or out of range.
    Unknown,
}

/// Parses one prompt line against the fixed command set.
pub fn parse_input(line: &str, absolute: &Regex) -> Input {
    match line {
        "a" => Input::Adjust(50),
        "z" => Input::Adjust(-50),
        "s" => Input::Adjust(500),
        "x" => Input::Adjust(-500),
        "d" => Input::Adjust(5),
        "c" => Input::Adjust(-5),
        "" => Input::Show,
        "exit" | "quit" => Input::Quit,
        other => {
            if absolute.is_match(other) {
                let value: f64 = other.parse().unwrap_or(-1.0);
                if (0.0..=ANGLE_MAX).contains(&value) {
                    return Input::Absolute(to_raw_angle(value));
                }
                warn!("Invalid value, use 0-{:.2}", ANGLE_MAX);
            }
            Input::Unknown
        }
    }
}

/// Min/max ignition advance across a batch of datalog frames. Frames too
/// short to carry the advance word are skipped.
pub fn advance_span(frames: &[Vec<u8>]) -> Option<(f64, f64)> {
    let mut span: Option<(u16, u16)> = None;
    for frame in frames {
        if frame.len() < ADVANCE_OFFSET + 2 {
            continue;
        }
        let raw = u16::from_be_bytes([frame[ADVANCE_OFFSET], frame[ADVANCE_OFFSET + 1]]);
        span = Some(match span {
            None => (raw, raw),
            Some((lo, hi)) => (lo.min(raw), hi.max(raw)),
        });
    }
    span.map(|(lo, hi)| (to_angle(lo), to_angle(hi)))
}

/// Interactive session state: the app link, the telemetry queue and the
/// last offset the device acknowledged.
pub struct TriggerSession<W: Write> {
    client: AppClient<W>,
    telemetry: Receiver<Vec<u8>>,
    offset_raw: u16,
    absolute: Regex,
}

impl<W: Write> TriggerSession<W> {
    pub fn new(client: AppClient<W>, telemetry: Receiver<Vec<u8>>) -> TriggerSession<W> {
        TriggerSession {
            client,
            telemetry,
            offset_raw: 0,
            absolute: absolute_pattern(),
        }
    }

    /// Queries the decoder and the stored offset, then applies an initial
    /// override when one was given on the command line.
    pub fn init(&mut self, initial: Option<f64>) -> Result<()> {
        let decoder = self.client.request(
            &protocol::create_packet(protocol::FE_CMD_DECODER, None, None, None, false),
            protocol::FE_CMD_DECODER,
        )?;
        if let Some(name) = decoder {
            info!("Decoder: {}", protocol::decode_text(&name));
        }

        let body = self
            .client
            .request(&read_trigger_packet(), protocol::FE_CMD_FLASH_READ)?
            .ok_or_else(|| Error::Protocol("trigger read reply carried no body".into()))?;
        if body.len() < 2 {
            return Err(Error::Protocol("trigger read reply too short".into()));
        }
        self.offset_raw = u16::from_be_bytes([body[0], body[1]]);
        info!(
            "Current trigger offset in flash: {:.2} deg",
            to_angle(self.offset_raw)
        );

        if let Some(degrees) = initial {
            info!("Initial trigger offset: {:.2} deg", degrees);
            self.write_offset(to_raw_angle(degrees))?;
        }

        info!("Type a new value (0-{:.2}) or use predefined commands", ANGLE_MAX);
        info!("Commands: 'a' => +1, 'z' => -1, 's' => +10, 'x' => -10, 'd' => +0.1, 'c' => -0.1");
        info!("          'quit' or 'exit' => Exit program");
        Ok(())
    }

    /// Prompt loop; returns when the operator quits or input ends.
    pub fn run(&mut self, input: &mut dyn BufRead) -> Result<()> {
        loop {
            let advance = self.check_advance();

            print!(">>> ");
            io::stdout().flush()?;
            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                info!("Exiting...");
                return Ok(());
            }
            let line = line.trim_end_matches(|c| c == '\r' || c == '\n');

            match parse_input(line, &self.absolute) {
                Input::Adjust(delta) => {
                    let next = i32::from(self.offset_raw) + delta;
                    if next >= 0 && next <= i32::from(to_raw_angle(ANGLE_MAX)) {
                        if next as u16 != self.offset_raw {
                            self.write_offset(next as u16)?;
                        }
                    } else {
                        warn!("Invalid value, use 0-{:.2}", ANGLE_MAX);
                    }
                }
                Input::Absolute(raw) => {
                    if raw != self.offset_raw {
                        self.write_offset(raw)?;
                    }
                }
                Input::Show => match advance {
                    Some((lo, _)) => info!(
                        "Advance: {:.2} deg, Trigger offset: {:.2}",
                        lo,
                        to_angle(self.offset_raw)
                    ),
                    None => info!("Trigger offset: {:.2}", to_angle(self.offset_raw)),
                },
                Input::Quit => {
                    info!("Exiting...");
                    return Ok(());
                }
                Input::Unknown => {}
            }
        }
    }

    /// Sends the new offset and waits for the flash-write acknowledgment.
    fn write_offset(&mut self, raw: u16) -> Result<()> {
        debug!("Raw offset value: {}", raw);
        let packet = protocol::create_packet(
            protocol::FE_CMD_FLASH_WRITE,
            Some(FE_LOCATION_TRIGGER),
            None,
            Some(&raw.to_be_bytes()),
            true,
        );
        self.client.request(&packet, protocol::FE_CMD_FLASH_WRITE)?;
        self.offset_raw = raw;
        info!("Trigger offset set to: {:.2} deg", to_angle(raw));
        Ok(())
    }

    /// Drains the telemetry queue and warns when the advance wanders.
    fn check_advance(&mut self) -> Option<(f64, f64)> {
        let mut rows = Vec::with_capacity(LOG_DRAIN);
        for _ in 0..LOG_DRAIN {
            match self.telemetry.try_recv() {
                Ok(row) => rows.push(row),
                Err(_) => break,
            }
        }
        let span = advance_span(&rows);
        if let Some((lo, hi)) = span {
            if lo != hi {
                warn!(
                    "Ignition advance is not steady, travels between {:.2} <-> {:.2} deg",
                    lo, hi
                );
            }
        }
        span
    }
}

impl<W: Write> fmt::Debug for TriggerSession<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerSession")
            .field("offset_raw", &self.offset_raw)
            .finish()
    }
}

fn read_trigger_packet() -> Vec<u8> {
    protocol::create_packet(
        protocol::FE_CMD_FLASH_READ,
        Some(FE_LOCATION_TRIGGER),
        Some(2),
        None,
        false,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::io::Cursor;
    use std::time::Duration;

    fn reply(id: u16, body: &[u8]) -> Vec<u8> {
        let mut frame = vec![if body.is_empty() { 0x00 } else { 0x01 }];
        frame.extend_from_slice(&id.to_be_bytes());
        if !body.is_empty() {
            frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
            frame.extend_from_slice(body);
        }
        frame
    }

    fn log_row(raw_advance: u16) -> Vec<u8> {
        let mut row = vec![0u8; 64];
        row[ADVANCE_OFFSET..ADVANCE_OFFSET + 2].copy_from_slice(&raw_advance.to_be_bytes());
        row
    }

    #[test]
    fn angle_conversions_round_trip() {
        for raw in 0..=35999u16 {
            assert_eq!(to_raw_angle(to_angle(raw)), raw);
        }
        assert!((to_angle(to_raw_angle(719.98)) - 719.98).abs() < 0.01);
        assert_eq!(to_raw_angle(1.0), 50);
        assert_eq!(to_angle(50), 1.0);
    }

    #[test]
    fn parses_the_command_set() {
        let re = absolute_pattern();
        assert_eq!(parse_input("a", &re), Input::Adjust(50));
        assert_eq!(parse_input("z", &re), Input::Adjust(-50));
        assert_eq!(parse_input("s", &re), Input::Adjust(500));
        assert_eq!(parse_input("x", &re), Input::Adjust(-500));
        assert_eq!(parse_input("d", &re), Input::Adjust(5));
        assert_eq!(parse_input("c", &re), Input::Adjust(-5));
        assert_eq!(parse_input("", &re), Input::Show);
        assert_eq!(parse_input("exit", &re), Input::Quit);
        assert_eq!(parse_input("quit", &re), Input::Quit);
    }

    #[test]
    fn parses_absolute_values() {
        let re = absolute_pattern();
        assert_eq!(parse_input("90", &re), Input::Absolute(4500));
        assert_eq!(parse_input("0", &re), Input::Absolute(0));
        assert_eq!(parse_input("719.98", &re), Input::Absolute(35999));
        assert_eq!(parse_input("10.5", &re), Input::Absolute(525));

        assert_eq!(parse_input("720", &re), Input::Unknown);
        assert_eq!(parse_input("1234", &re), Input::Unknown);
        assert_eq!(parse_input("10.123", &re), Input::Unknown);
        assert_eq!(parse_input("-5", &re), Input::Unknown);
        assert_eq!(parse_input("abc", &re), Input::Unknown);
    }

    #[test]
    fn advance_span_tracks_extremes_and_skips_runts() {
        let rows = vec![log_row(500), log_row(505), vec![0u8; 10], log_row(495)];
        let (lo, hi) = advance_span(&rows).unwrap();
        assert!((lo - 9.9).abs() < 1e-9);
        assert!((hi - 10.1).abs() < 1e-9);

        assert_eq!(advance_span(&[]), None);
        assert_eq!(advance_span(&[vec![0u8; 20]]), None);
    }

    #[test]
    fn init_reads_the_stored_offset() {
        let (tx, rx) = bounded(8);
        tx.send(reply(protocol::FE_CMD_DECODER + 1, b"JimStim\x00"))
            .unwrap();
        tx.send(reply(protocol::FE_CMD_FLASH_READ + 1, &[0x11, 0x94]))
            .unwrap();

        let (_log_tx, log_rx) = bounded(4);
        let mut session = TriggerSession::new(AppClient::new(Vec::new(), rx), log_rx);
        session.client.reply_timeout = Duration::from_millis(200);

        session.init(None).unwrap();
        assert_eq!(session.offset_raw, 0x1194);
    }

    #[test]
    fn init_applies_an_initial_override() {
        let (tx, rx) = bounded(8);
        tx.send(reply(protocol::FE_CMD_DECODER + 1, b"JimStim\x00"))
            .unwrap();
        tx.send(reply(protocol::FE_CMD_FLASH_READ + 1, &[0x00, 0x00]))
            .unwrap();
        tx.send(reply(protocol::FE_CMD_FLASH_WRITE + 1, &[])).unwrap();

        let (_log_tx, log_rx) = bounded(4);
        let mut session = TriggerSession::new(AppClient::new(Vec::new(), rx), log_rx);
        session.client.reply_timeout = Duration::from_millis(200);

        session.init(Some(90.0)).unwrap();
        assert_eq!(session.offset_raw, 4500);
    }

    #[test]
    fn adjustments_write_and_track_the_ack() {
        let (tx, rx) = bounded(8);
        tx.send(reply(protocol::FE_CMD_FLASH_WRITE + 1, &[])).unwrap();

        let (_log_tx, log_rx) = bounded(4);
        let mut session = TriggerSession::new(AppClient::new(Vec::new(), rx), log_rx);
        session.client.reply_timeout = Duration::from_millis(200);
        session.offset_raw = 4500;

        let mut input = Cursor::new(b"a\nquit\n".to_vec());
        session.run(&mut input).unwrap();
        assert_eq!(session.offset_raw, 4550);
    }

    #[test]
    fn out_of_range_adjustments_are_refused() {
        let (_tx, rx) = bounded::<Vec<u8>>(1);
        let (_log_tx, log_rx) = bounded(4);
        let mut session = TriggerSession::new(AppClient::new(Vec::new(), rx), log_rx);
        session.client.reply_timeout = Duration::from_millis(50);
        session.offset_raw = 10;

        // Would go negative: refused without any write, so no reply is
        // needed and the session must not time out.
        let mut input = Cursor::new(b"z\nexit\n".to_vec());
        session.run(&mut input).unwrap();
        assert_eq!(session.offset_raw, 10);
    }
}
