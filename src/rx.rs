//! Background receiver and foreground driver for the application link.
//!
//! Exactly one thread owns the read side of the port. It reassembles
//! `0xAA … 0xCC` frames byte by byte, undoing `0xBB` escapes, and
//! demultiplexes finished frames into two bounded queues: datalog frames go
//! to the telemetry queue (dropped when the consumer lags), everything else
//! to the response queue the foreground blocks on.

use crate::protocol::{self, HeaderFlags};
use crate::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, warn};
use serialport::SerialPort;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Datalog payload id; everything else is treated as a command response.
pub const LOG_PAYLOAD_ID: u16 = 0x0191;

/// Chunk size for port reads.
const READ_CHUNK: usize = 1024;

/// Capacity of the response queue. Commands go out one at a time, so this
/// only needs to absorb stray frames.
pub const RESPONSE_QUEUE_SIZE: usize = 8;
/// Capacity of the telemetry queue, sized to one datalog burst.
pub const LOG_QUEUE_SIZE: usize = 64;

/// A finished, unescaped frame with its checksum stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Body of a datalog frame, header stripped.
    Log(Vec<u8>),
    /// Any other frame: flag byte, payload id, optional length and body.
    Response(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    InFrame,
    InEscape,
}

/// Byte-at-a-time frame reassembler.
#[derive(Debug)]
pub struct Framer {
    state: State,
    buf: Vec<u8>,
}

impl Default for Framer {
    fn default() -> Framer {
        Framer::new()
    }
}

impl Framer {
    pub fn new() -> Framer {
        Framer {
            state: State::Idle,
            buf: Vec::new(),
        }
    }

    /// Feeds one wire byte; returns a frame when this byte completed one.
    pub fn feed(&mut self, byte: u8) -> Option<Inbound> {
        match self.state {
            State::Idle => {
                if byte == protocol::START {
                    self.buf.clear();
                    self.state = State::InFrame;
                }
                None
            }
            State::InFrame => match byte {
                // Start byte mid-frame: the sender restarted, resync.
                protocol::START => {
                    self.buf.clear();
                    None
                }
                protocol::STOP => {
                    self.state = State::Idle;
                    self.finish()
                }
                protocol::ESCAPE => {
                    self.state = State::InEscape;
                    None
                }
                other => {
                    self.buf.push(other);
                    None
                }
            },
            State::InEscape => {
                self.state = State::InFrame;
                match byte {
                    protocol::ESCAPED_START => self.buf.push(protocol::START),
                    protocol::ESCAPED_ESCAPE => self.buf.push(protocol::ESCAPE),
                    protocol::ESCAPED_STOP => self.buf.push(protocol::STOP),
                    other => {
                        warn!("invalid escape pair 0x{:02x}, dropping frame", other);
                        self.buf.clear();
                        self.state = State::Idle;
                    }
                }
                None
            }
        }
    }

    fn finish(&mut self) -> Option<Inbound> {
        let mut frame = std::mem::replace(&mut self.buf, Vec::new());
        if frame.len() < 4 {
            warn!("runt frame ({} bytes), dropping", frame.len());
            return None;
        }

        let wire_checksum = match frame.pop() {
            Some(b) => b,
            None => return None,
        };
        let computed = frame.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));

        let flags = HeaderFlags::from_bits_truncate(frame[0]);
        let payload_id = u16::from_be_bytes([frame[1], frame[2]]);
        let length = if flags.contains(HeaderFlags::HAS_LENGTH) && frame.len() >= 5 {
            u16::from_be_bytes([frame[3], frame[4]]) as usize
        } else {
            0
        };

        // A frame is sized right when it is exactly its header plus the
        // declared body; a frame may pass on size OR checksum alone, the
        // protocol has always been tolerant here.
        let expected = if flags.contains(HeaderFlags::HAS_LENGTH) {
            5 + length
        } else {
            3
        };
        let size_ok = frame.len() == expected;
        let checksum_ok = wire_checksum == computed;
        if !size_ok && !checksum_ok {
            warn!(
                "frame 0x{:04x} failed both size and checksum checks, dropping",
                payload_id
            );
            return None;
        }
        if size_ok != checksum_ok {
            warn!(
                "frame 0x{:04x}: size and checksum disagree, accepting anyway",
                payload_id
            );
        }

        if payload_id == LOG_PAYLOAD_ID {
            let body = if frame.len() > 5 {
                frame.split_off(5)
            } else {
                Vec::new()
            };
            Some(Inbound::Log(body))
        } else {
            Some(Inbound::Response(frame))
        }
    }
}

/// Handle to the background receiver thread.
#[derive(Debug)]
pub struct RxThread {
    active: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RxThread {
    /// Starts the receiver on its own clone of the port.
    ///
    /// The thread runs until [`RxThread::stop`] is called or the port dies;
    /// read timeouts are ordinary idle ticks.
    pub fn spawn(
        mut port: Box<dyn SerialPort>,
        responses: Sender<Vec<u8>>,
        telemetry: Sender<Vec<u8>>,
    ) -> Result<RxThread> {
        let active = Arc::new(AtomicBool::new(true));
        let flag = active.clone();

        let handle = thread::Builder::new()
            .name("fuct-rx".into())
            .spawn(move || {
                let mut framer = Framer::new();
                let mut chunk = [0u8; READ_CHUNK];
                while flag.load(Ordering::Relaxed) {
                    let n = match port.read(&mut chunk) {
                        Ok(n) => n,
                        Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            error!("serial read failed, stopping receiver: {}", e);
                            break;
                        }
                    };
                    for &byte in &chunk[..n] {
                        match framer.feed(byte) {
                            Some(Inbound::Log(body)) => {
                                // A lagging consumer sheds telemetry; it must
                                // never back the port up.
                                let _ = telemetry.try_send(body);
                            }
                            Some(Inbound::Response(frame)) => {
                                if responses.send(frame).is_err() {
                                    return;
                                }
                            }
                            None => {}
                        }
                    }
                }
            })?;

        Ok(RxThread {
            active,
            handle: Some(handle),
        })
    }

    /// Asks the thread to stop and waits for it to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.active.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RxThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Foreground half of the application link.
///
/// Owns the write side of the port and the response queue; pairing is by
/// payload id, replies carrying the request id plus one.
pub struct AppClient<W: Write> {
    port: W,
    responses: Receiver<Vec<u8>>,
    /// How long to wait for a matching reply before declaring the link dead.
    pub reply_timeout: Duration,
}

impl<W: Write> AppClient<W> {
    pub fn new(port: W, responses: Receiver<Vec<u8>>) -> AppClient<W> {
        AppClient {
            port,
            responses,
            reply_timeout: Duration::from_secs(5),
        }
    }

    /// Writes one framed packet.
    pub fn send(&mut self, packet: &[u8]) -> Result<()> {
        debug!("--> {}", hex::encode(&packet[1..packet.len() - 1]));
        self.port.write_all(packet)?;
        self.port.flush()?;
        Ok(())
    }

    /// Gives the underlying port back, dropping the queue side.
    pub fn free(self) -> W {
        self.port
    }

    /// Takes the next response frame off the queue.
    pub fn recv_frame(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        self.responses
            .recv_timeout(timeout)
            .map_err(|_| Error::Timeout("no response from device, check the link".into()))
    }

    /// Sends a request and blocks until the device acknowledges it with the
    /// matching reply; unmatched frames are discarded.
    pub fn request(&mut self, packet: &[u8], payload_id: u16) -> Result<Option<Vec<u8>>> {
        self.send(packet)?;
        let deadline = Instant::now() + self.reply_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(format!(
                    "no reply to request 0x{:04x}",
                    payload_id
                )));
            }
            let frame = self.recv_frame(deadline - now)?;
            debug!("<-- {}", hex::encode(&frame));
            match protocol::decode_packet(&frame) {
                Ok((id, body)) if id == payload_id.wrapping_add(1) => return Ok(body),
                Ok((id, _)) => debug!("discarding unmatched reply 0x{:04x}", id),
                Err(e) => warn!("discarding undecodable frame: {}", e),
            }
        }
    }
}

impl<W: Write> fmt::Debug for AppClient<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppClient")
            .field("reply_timeout", &self.reply_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::create_packet;
    use crossbeam_channel::bounded;

    fn feed_all(framer: &mut Framer, bytes: &[u8]) -> Vec<Inbound> {
        bytes.iter().filter_map(|&b| framer.feed(b)).collect()
    }

    fn checksum(header: &[u8]) -> u8 {
        header.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
    }

    #[test]
    fn reassembles_a_checksummed_frame() {
        let mut framer = Framer::new();
        let header = [0x00, 0x01, 0x07];
        let mut wire = vec![0xAA];
        wire.extend_from_slice(&header);
        wire.push(checksum(&header));
        wire.push(0xCC);

        let frames = feed_all(&mut framer, &wire);
        assert_eq!(frames, vec![Inbound::Response(vec![0x00, 0x01, 0x07])]);
    }

    #[test]
    fn reassembly_matches_the_sent_packet() {
        let mut framer = Framer::new();
        // Body bytes chosen to force every escape pair onto the wire.
        let body = [0xAA, 0xBB, 0xCC, 0x01];
        let packet = create_packet(0xEEF0, None, None, Some(&body), true);

        let frames = feed_all(&mut framer, &packet);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Inbound::Response(frame) => {
                let (id, decoded) = protocol::decode_packet(frame).unwrap();
                assert_eq!(id, 0xEEF0);
                assert_eq!(decoded.unwrap(), body.to_vec());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn reassembly_is_chunking_independent() {
        let body = [0xAA, 0x10, 0xCC, 0xBB];
        let packet = create_packet(0x0104, None, None, Some(&body), true);

        for split in 1..packet.len() {
            let mut framer = Framer::new();
            let mut frames = feed_all(&mut framer, &packet[..split]);
            frames.extend(feed_all(&mut framer, &packet[split..]));
            assert_eq!(frames.len(), 1, "split at {}", split);
        }
    }

    #[test]
    fn start_byte_mid_frame_resyncs() {
        let mut framer = Framer::new();
        let wire = [0xAA, 0x00, 0x01, 0x06, 0xAA, 0x00, 0x01, 0x07, 0x08, 0xCC];
        let frames = feed_all(&mut framer, &wire);

        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Inbound::Response(frame) => {
                let (id, body) = protocol::decode_packet(frame).unwrap();
                assert_eq!(id, 0x0107);
                assert!(body.is_none());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn log_frames_go_out_as_bodies() {
        let mut framer = Framer::new();
        let header = [0x01, 0x01, 0x91, 0x00, 0x03, 0x10, 0x20, 0x30];
        let mut wire = vec![0xAA];
        wire.extend_from_slice(&header);
        wire.push(checksum(&header));
        wire.push(0xCC);

        let frames = feed_all(&mut framer, &wire);
        assert_eq!(frames, vec![Inbound::Log(vec![0x10, 0x20, 0x30])]);
    }

    #[test]
    fn tolerates_size_checksum_disagreement() {
        // Correctly sized bare header with a deliberately wrong checksum
        // byte: still accepted.
        let wire = [0xAA, 0x00, 0x01, 0x07, 0x99, 0xCC];
        let mut framer = Framer::new();
        let frames = feed_all(&mut framer, &wire);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn drops_frames_failing_both_checks() {
        let wire = [0xAA, 0x00, 0x01, 0x07, 0x55, 0x99, 0xCC];
        let mut framer = Framer::new();
        assert!(feed_all(&mut framer, &wire).is_empty());
    }

    #[test]
    fn drops_runts_and_bad_escapes_then_recovers() {
        let mut framer = Framer::new();
        assert!(feed_all(&mut framer, &[0xAA, 0x01, 0xCC]).is_empty());
        assert!(feed_all(&mut framer, &[0xAA, 0x00, 0xBB, 0x99, 0x01, 0xCC]).is_empty());

        let header = [0x00, 0x01, 0x07];
        let mut wire = vec![0xAA];
        wire.extend_from_slice(&header);
        wire.push(checksum(&header));
        wire.push(0xCC);
        assert_eq!(feed_all(&mut framer, &wire).len(), 1);
    }

    #[test]
    fn noise_outside_frames_is_ignored() {
        let mut framer = Framer::new();
        assert!(feed_all(&mut framer, &[0x00, 0xFF, 0xCC, 0x42]).is_empty());
    }

    #[test]
    fn request_matches_the_incremented_id() {
        let (tx, rx) = bounded(4);
        // A stale frame ahead of the real reply; both already unescaped.
        tx.send(vec![0x00, 0x30, 0x00]).unwrap();
        tx.send(vec![0x00, 0xEE, 0xEF]).unwrap();

        let mut client = AppClient::new(Vec::new(), rx);
        client.reply_timeout = Duration::from_millis(200);

        let packet = create_packet(0xEEEE, None, None, None, false);
        let body = client.request(&packet, 0xEEEE).unwrap();
        assert!(body.is_none());
        assert_eq!(client.port, packet);
    }

    #[test]
    fn request_times_out_without_a_reply() {
        let (_tx, rx) = bounded::<Vec<u8>>(1);
        let mut client = AppClient::new(Vec::new(), rx);
        client.reply_timeout = Duration::from_millis(50);

        let packet = create_packet(0xEEEE, None, None, None, false);
        match client.request(&packet, 0xEEEE) {
            Err(Error::Timeout(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
