//! Application-protocol packets: framing markers, escaping, construction and
//! decoding.
//!
//! On the wire a packet is `0xAA <header+body+checksum, escaped> 0xCC`. The
//! header is a flag byte and a big-endian payload id, optionally followed by
//! a 16-bit body length when the flag byte says so. The checksum is the
//! byte-sum of everything between the markers, before escaping.

use crate::{Error, Result};
use bitflags::bitflags;

/// Frame start marker.
pub const START: u8 = 0xAA;
/// Frame end marker.
pub const STOP: u8 = 0xCC;
/// Escape prefix for interior marker bytes.
pub const ESCAPE: u8 = 0xBB;
/// Second escape byte standing in for `0xAA`.
pub const ESCAPED_START: u8 = 0x55;
/// Second escape byte standing in for `0xBB`.
pub const ESCAPED_ESCAPE: u8 = 0x44;
/// Second escape byte standing in for `0xCC`.
pub const ESCAPED_STOP: u8 = 0x33;

bitflags! {
    /// The header flag byte.
    pub struct HeaderFlags: u8 {
        /// A 16-bit body length follows the payload id.
        const HAS_LENGTH = 0x01;
    }
}

// Request payload ids. Replies carry the request id plus one.
pub const FE_CMD_INTERFACE: u16 = 0x0000;
pub const FE_CMD_FIRMWARE: u16 = 0x0002;
pub const FE_CMD_RAM_WRITE: u16 = 0x0100;
pub const FE_CMD_FLASH_WRITE: u16 = 0x0102;
pub const FE_CMD_RAM_READ: u16 = 0x0104;
pub const FE_CMD_FLASH_READ: u16 = 0x0106;
pub const FE_CMD_DATALOG_DESC: u16 = 0x0300;
pub const FE_CMD_LOCATION_ID_LIST: u16 = 0xDA5E;
pub const FE_CMD_LOCATION_ID_INFO: u16 = 0xF8E0;
pub const FE_CMD_DECODER: u16 = 0xEEEE;
pub const FE_CMD_BUILDDATE: u16 = 0xEEF0;
pub const FE_CMD_COMPILER: u16 = 0xEEF2;
pub const FE_CMD_OSNAME: u16 = 0xEEF4;
pub const FE_CMD_USER: u16 = 0xEEF6;
pub const FE_CMD_EMAIL: u16 = 0xEEF8;

/// A (location id, offset) pair addressing firmware memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub id: u16,
    pub offset: u16,
}

/// The decoder trigger offset word inside the small-tables location.
pub const FE_LOCATION_TRIGGER: Location = Location {
    id: 0xC003,
    offset: 0x0060,
};

/// Escapes interior marker bytes.
pub fn escape(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            START => out.extend_from_slice(&[ESCAPE, ESCAPED_START]),
            ESCAPE => out.extend_from_slice(&[ESCAPE, ESCAPED_ESCAPE]),
            STOP => out.extend_from_slice(&[ESCAPE, ESCAPED_STOP]),
            other => out.push(other),
        }
    }
    out
}

/// Reverses [`escape`]. Fails on a dangling or unknown escape pair.
pub fn unescape(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter();
    while let Some(&b) = iter.next() {
        if b != ESCAPE {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(&ESCAPED_START) => out.push(START),
            Some(&ESCAPED_ESCAPE) => out.push(ESCAPE),
            Some(&ESCAPED_STOP) => out.push(STOP),
            _ => {
                return Err(Error::Protocol(
                    "truncated or invalid escape sequence".into(),
                ))
            }
        }
    }
    Ok(out)
}

/// Builds a complete wire frame.
///
/// The body is `location || size || data`, every part optional; when `size`
/// is absent but `data` is present, the data length takes its place.
/// `use_length` adds the explicit body-length field and sets the header flag
/// (only meaningful for a non-empty body).
pub fn create_packet(
    payload_id: u16,
    location: Option<Location>,
    size: Option<u16>,
    data: Option<&[u8]>,
    use_length: bool,
) -> Vec<u8> {
    let mut body = Vec::new();
    if let Some(loc) = location {
        body.extend_from_slice(&loc.id.to_be_bytes());
        body.extend_from_slice(&loc.offset.to_be_bytes());
    }
    match (size, data) {
        (Some(size), _) => body.extend_from_slice(&size.to_be_bytes()),
        (None, Some(data)) => body.extend_from_slice(&(data.len() as u16).to_be_bytes()),
        (None, None) => {}
    }
    if let Some(data) = data {
        body.extend_from_slice(data);
    }

    let flags = if use_length && !body.is_empty() {
        HeaderFlags::HAS_LENGTH
    } else {
        HeaderFlags::empty()
    };

    let mut header = Vec::with_capacity(5 + body.len() + 1);
    header.push(flags.bits());
    header.extend_from_slice(&payload_id.to_be_bytes());
    if flags.contains(HeaderFlags::HAS_LENGTH) {
        header.extend_from_slice(&(body.len() as u16).to_be_bytes());
    }
    header.extend_from_slice(&body);

    let checksum = header.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    header.push(checksum);

    let mut packet = Vec::with_capacity(header.len() + 2);
    packet.push(START);
    packet.extend_from_slice(&escape(&header));
    packet.push(STOP);
    packet
}

/// Decodes an unescaped, checksum-stripped frame into payload id and body.
pub fn decode_packet(frame: &[u8]) -> Result<(u16, Option<Vec<u8>>)> {
    if frame.len() < 3 {
        return Err(Error::Protocol(format!(
            "frame too short ({} bytes)",
            frame.len()
        )));
    }
    let flags = HeaderFlags::from_bits_truncate(frame[0]);
    let payload_id = u16::from_be_bytes([frame[1], frame[2]]);

    let length = if flags.contains(HeaderFlags::HAS_LENGTH) {
        if frame.len() < 5 {
            return Err(Error::Protocol(
                "length flag set on a frame with no length field".into(),
            ));
        }
        u16::from_be_bytes([frame[3], frame[4]]) as usize
    } else {
        0
    };

    if length == 0 {
        return Ok((payload_id, None));
    }
    if frame.len() < 5 + length {
        return Err(Error::Protocol(format!(
            "frame body truncated ({} of {} bytes)",
            frame.len().saturating_sub(5),
            length
        )));
    }
    Ok((payload_id, Some(frame[5..5 + length].to_vec())))
}

/// Decodes a NUL-padded ASCII payload, trailing NULs stripped.
pub fn decode_text(body: &[u8]) -> String {
    let end = body.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&body[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_trigger_read_request() {
        let packet = create_packet(FE_CMD_FLASH_READ, Some(FE_LOCATION_TRIGGER), Some(2), None, false);
        assert_eq!(
            packet,
            vec![0xAA, 0x00, 0x01, 0x06, 0xC0, 0x03, 0x00, 0x60, 0x00, 0x02, 0x2C, 0xCC]
        );
    }

    #[test]
    fn builds_a_trigger_write_request() {
        // Matches a frame captured from the original tooling: +1 degree.
        let packet = create_packet(
            FE_CMD_FLASH_WRITE,
            Some(FE_LOCATION_TRIGGER),
            None,
            Some(&[0x00, 0x32]),
            true,
        );
        assert_eq!(
            packet,
            vec![
                0xAA, 0x01, 0x01, 0x02, 0x00, 0x08, 0xC0, 0x03, 0x00, 0x60, 0x00, 0x02, 0x00,
                0x32, 0x63, 0xCC
            ]
        );
    }

    #[test]
    fn a_bare_request_has_no_body() {
        let packet = create_packet(FE_CMD_DECODER, None, None, None, true);
        assert_eq!(packet, vec![0xAA, 0x00, 0xEE, 0xEE, 0xDC, 0xCC]);
    }

    #[test]
    fn size_and_data_are_both_carried() {
        let packet = create_packet(0x0100, None, Some(2), Some(&[0x01, 0x02]), false);
        // flags, id, size, data, checksum between the markers
        assert_eq!(
            packet,
            vec![0xAA, 0x00, 0x01, 0x00, 0x00, 0x02, 0x01, 0x02, 0x06, 0xCC]
        );
    }

    #[test]
    fn checksum_covers_the_whole_header() {
        for packet in [
            create_packet(FE_CMD_DECODER, None, None, None, false),
            create_packet(FE_CMD_FLASH_READ, Some(FE_LOCATION_TRIGGER), Some(2), None, false),
            create_packet(0xEEF0, None, None, Some(&[0xAA, 0xBB, 0xCC]), true),
        ]
        .iter()
        {
            let inner = unescape(&packet[1..packet.len() - 1]).unwrap();
            let (header, checksum) = inner.split_at(inner.len() - 1);
            let sum = header.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
            assert_eq!(checksum[0], sum);
        }
    }

    #[test]
    fn escape_round_trips() {
        let samples: [&[u8]; 4] = [
            &[],
            &[0x01, 0x02, 0x03],
            &[0xAA, 0xBB, 0xCC],
            &[0xBB, 0x55, 0xAA, 0x44, 0xCC, 0x33],
        ];
        for sample in samples.iter() {
            let escaped = escape(sample);
            assert!(!escaped.iter().any(|&b| b == START || b == STOP));
            assert_eq!(unescape(&escaped).unwrap(), sample.to_vec());
        }
    }

    #[test]
    fn unescape_rejects_dangling_escapes() {
        assert!(unescape(&[0x01, ESCAPE]).is_err());
        assert!(unescape(&[ESCAPE, 0x99]).is_err());
    }

    #[test]
    fn decodes_headers_and_bodies() {
        let (id, body) = decode_packet(&[0x00, 0x01, 0x07]).unwrap();
        assert_eq!(id, 0x0107);
        assert!(body.is_none());

        let (id, body) = decode_packet(&[0x01, 0xEE, 0xEF, 0x00, 0x02, 0x41, 0x42]).unwrap();
        assert_eq!(id, 0xEEEF);
        assert_eq!(body.unwrap(), b"AB".to_vec());

        assert!(decode_packet(&[0x00]).is_err());
        assert!(decode_packet(&[0x01, 0xEE, 0xEF, 0x00, 0x05, 0x41]).is_err());
    }

    #[test]
    fn strips_trailing_nuls_only() {
        assert_eq!(decode_text(b"JimStim\x00\x00"), "JimStim");
        assert_eq!(decode_text(b"\x00a\x00b\x00\x00"), "\u{0}a\u{0}b");
        assert_eq!(decode_text(b"\x00\x00"), "");
    }
}
