//! Motorola S-record lines: classification, parsing and emission.
//!
//! FreeEMS firmware ships as S19/S28 text. Data lives in S1/S2 records; the
//! loader cares almost exclusively about S2, whose 3-byte address carries the
//! flash page number in its first byte.

use crate::{Error, Result};

/// The record kinds appearing in S19/S28 files (S4 and S6 do not exist).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    S0,
    S1,
    S2,
    S3,
    S5,
    S7,
    S8,
    S9,
}

impl RecordKind {
    /// Looks up a kind from a two-character line prefix. Prefixes are
    /// uppercase on the wire; anything else misses.
    pub fn from_prefix(prefix: &str) -> Option<RecordKind> {
        match prefix {
            "S0" => Some(RecordKind::S0),
            "S1" => Some(RecordKind::S1),
            "S2" => Some(RecordKind::S2),
            "S3" => Some(RecordKind::S3),
            "S5" => Some(RecordKind::S5),
            "S7" => Some(RecordKind::S7),
            "S8" => Some(RecordKind::S8),
            "S9" => Some(RecordKind::S9),
            _ => None,
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            RecordKind::S0 => "S0",
            RecordKind::S1 => "S1",
            RecordKind::S2 => "S2",
            RecordKind::S3 => "S3",
            RecordKind::S5 => "S5",
            RecordKind::S7 => "S7",
            RecordKind::S8 => "S8",
            RecordKind::S9 => "S9",
        }
    }

    /// Width of the address field in bytes.
    pub fn address_width(self) -> usize {
        match self {
            RecordKind::S0 | RecordKind::S1 | RecordKind::S5 | RecordKind::S9 => 2,
            RecordKind::S2 | RecordKind::S8 => 3,
            RecordKind::S3 | RecordKind::S7 => 4,
        }
    }

    /// Whether a data field sits between the address and the checksum.
    pub fn carries_data(self) -> bool {
        matches!(
            self,
            RecordKind::S0 | RecordKind::S1 | RecordKind::S2 | RecordKind::S3
        )
    }
}

/// One decoded S-record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SRecord {
    pub kind: RecordKind,
    /// Raw big-endian address bytes, `kind.address_width()` of them.
    pub address: Vec<u8>,
    /// Payload bytes; empty for kinds that carry no data.
    pub data: Vec<u8>,
}

impl SRecord {
    pub fn new(kind: RecordKind, address: Vec<u8>, data: Vec<u8>) -> SRecord {
        SRecord {
            kind,
            address,
            data,
        }
    }

    /// Flash page number of an S2 record.
    pub fn page(&self) -> Result<u8> {
        self.paged_address_bytes().map(|a| a[0])
    }

    /// 16-bit in-page address of an S2 record.
    pub fn page_address(&self) -> Result<u16> {
        self.paged_address_bytes()
            .map(|a| u16::from_be_bytes([a[1], a[2]]))
    }

    fn paged_address_bytes(&self) -> Result<&[u8]> {
        if self.kind != RecordKind::S2 || self.address.len() != 3 {
            return Err(Error::Record(format!(
                "paging in {} records is not supported or not enough address bytes",
                self.kind.prefix()
            )));
        }
        Ok(&self.address)
    }

    /// Formats the record back into an uppercase S19 line.
    pub fn to_line(&self) -> String {
        // The count field covers address, data and checksum bytes.
        let count = self.kind.address_width() + self.data.len() + 1;
        let sum = count
            + self.address.iter().map(|&b| b as usize).sum::<usize>()
            + self.data.iter().map(|&b| b as usize).sum::<usize>();
        let checksum = ((sum & 0xFF) as u8) ^ 0xFF;

        format!(
            "{}{:02X}{}{}{:02X}",
            self.kind.prefix(),
            count,
            hex::encode_upper(&self.address),
            hex::encode_upper(&self.data),
            checksum
        )
    }
}

/// Parses one S19 line into a record.
pub fn parse_line(line: &str) -> Result<SRecord> {
    if line.is_empty() {
        return Err(Error::Record("blank line detected".into()));
    }
    if line.len() < 10 {
        return Err(Error::Record(
            "not enough characters to make up a minimal S19 record".into(),
        ));
    }
    if line.len() % 2 != 0 {
        return Err(Error::Record(
            "length of line is not even, must contain 2-byte hex pairs".into(),
        ));
    }
    let has_upper = line.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = line.chars().any(|c| c.is_ascii_lowercase());
    if has_upper && has_lower {
        return Err(Error::Record("line contains mixed case characters".into()));
    }

    let kind = line
        .get(..2)
        .and_then(RecordKind::from_prefix)
        .ok_or_else(|| Error::Record("line does not begin with a known record type".into()))?;

    let decoded = hex::decode(&line[2..])
        .map_err(|_| Error::Record("line contains non-hex characters".into()))?;

    let width = kind.address_width();
    if decoded.len() < width + 2 {
        return Err(Error::Record(format!(
            "record too short for a {}-byte address field",
            width
        )));
    }

    let count = decoded[0] as usize;
    let address = decoded[1..width + 1].to_vec();
    let data = decoded[width + 1..decoded.len() - 1].to_vec();
    let checksum = decoded[decoded.len() - 1];

    if data.len() > 256 {
        return Err(Error::Record("data too long (>256 bytes)".into()));
    }

    let lrc = decoded[..decoded.len() - 1]
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        ^ 0xFF;
    if lrc != checksum {
        return Err(Error::Record("checksum mismatch".into()));
    }

    if count != decoded.len() - 1 {
        return Err(Error::Record("count field mismatch".into()));
    }

    if kind == RecordKind::S5 && data.len() > 4 {
        return Err(Error::Record(
            "S5 records may only have 16, 24 or 32 bit unsigned byte count".into(),
        ));
    } else if kind.carries_data() && data.is_empty() {
        return Err(Error::Record(format!(
            "{} records need at least {} address bytes and data byte(s)",
            kind.prefix(),
            width
        )));
    } else if !kind.carries_data() && !data.is_empty() {
        return Err(Error::Record(format!(
            "{} records must only have {} bytes for its address",
            kind.prefix(),
            width
        )));
    }

    Ok(SRecord::new(kind, address, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(result: Result<SRecord>) -> String {
        match result.unwrap_err() {
            Error::Record(reason) => reason,
            other => panic!("unexpected error kind: {:?}", other),
        }
    }

    #[test]
    fn parses_a_data_record() {
        let rec = parse_line("S1137AF0000102030405060708090A0B0C0D0E0F0A").unwrap();
        assert_eq!(rec.kind, RecordKind::S1);
        assert_eq!(rec.address, vec![0x7A, 0xF0]);
        assert_eq!(rec.data.len(), 16);
        assert_eq!(rec.data[15], 0x0F);
    }

    #[test]
    fn rejects_checksum_mismatch() {
        let err = reason(parse_line("S1137AF0000102030405060708090A0B0C0D0E0F0B"));
        assert_eq!(err, "checksum mismatch");
    }

    #[test]
    fn rejects_count_field_mismatch() {
        // LRC deliberately recomputed so only the count check can fire.
        let err = reason(parse_line("S1127AF0000102030405060708090A0B0C0D0E0F0B"));
        assert_eq!(err, "count field mismatch");
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(reason(parse_line("")), "blank line detected");
        assert_eq!(
            reason(parse_line("S20600FF")),
            "not enough characters to make up a minimal S19 record"
        );
        assert_eq!(
            reason(parse_line("S206E08000A0A15")),
            "length of line is not even, must contain 2-byte hex pairs"
        );
        assert_eq!(
            reason(parse_line("S206e08000A0A158")),
            "line contains mixed case characters"
        );
        assert_eq!(
            reason(parse_line("S406E08000A0A158")),
            "line does not begin with a known record type"
        );
        // All-lowercase lines miss the prefix table as well.
        assert_eq!(
            reason(parse_line("s206e08000a0a158")),
            "line does not begin with a known record type"
        );
    }

    #[test]
    fn rejects_wrong_data_presence() {
        // S9 with a data byte; checksum is valid for the bytes given.
        let line = SRecord::new(RecordKind::S9, vec![0x00, 0x00], vec![0xAB]).to_line();
        assert!(reason(parse_line(&line)).contains("S9 records must only have"));

        // S1 with an empty data field.
        let line = SRecord::new(RecordKind::S1, vec![0x12, 0x34], Vec::new()).to_line();
        assert!(reason(parse_line(&line)).contains("S1 records need at least"));
    }

    #[test]
    fn rejects_oversized_s5() {
        let line = SRecord::new(RecordKind::S5, vec![0x00, 0x03], vec![1, 2, 3, 4, 5]).to_line();
        assert!(reason(parse_line(&line)).contains("S5 records may only have"));
    }

    #[test]
    fn emits_known_lines() {
        let header = SRecord::new(
            RecordKind::S0,
            vec![0x00, 0x00],
            b"hello    \x00\x00".to_vec(),
        );
        assert_eq!(header.to_line(), "S00E000068656C6C6F2020202000005D");

        let terminator = SRecord::new(RecordKind::S8, vec![0x00, 0xC0, 0x00], Vec::new());
        assert_eq!(terminator.to_line(), "S80400C0003B");
    }

    #[test]
    fn round_trips_accepted_lines() {
        let lines = [
            "S00E000068656C6C6F2020202000005D",
            "S1137AF0000102030405060708090A0B0C0D0E0F0A",
            "S206E08000A0A158",
            "S214E08000000102030405060708090A0B0C0D0E0F13",
            "S80400C0003B",
            "S9030000FC",
            "S5030003F9",
        ];
        for line in lines.iter() {
            let rec = parse_line(line).unwrap();
            assert_eq!(&rec.to_line(), line, "round trip of {}", line);
        }
    }

    #[test]
    fn page_accessors_are_s2_only() {
        let rec = parse_line("S206E08000A0A158").unwrap();
        assert_eq!(rec.page().unwrap(), 0xE0);
        assert_eq!(rec.page_address().unwrap(), 0x8000);

        let rec = parse_line("S1137AF0000102030405060708090A0B0C0D0E0F0A").unwrap();
        assert!(rec.page().is_err());
        assert!(rec.page_address().is_err());
    }
}
