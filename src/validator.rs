//! Whole-file validation of S19 firmware images.

use crate::srecord::{self, SRecord};
use crate::{Error, Result};
use log::{info, warn};
use std::fs;
use std::path::Path;

/// Line-terminator census of a firmware file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EolStyle {
    Unix,
    Mac,
    Windows,
    Mixed,
    None,
}

/// Classifies a file's line endings from its raw CR/LF counts.
pub fn classify_eol(cr: usize, lf: usize) -> EolStyle {
    if lf > 0 && cr == 0 {
        EolStyle::Unix
    } else if lf == 0 && cr > 0 {
        EolStyle::Mac
    } else if cr > 0 && cr == lf {
        EolStyle::Windows
    } else if cr > 0 && lf > 0 {
        EolStyle::Mixed
    } else {
        EolStyle::None
    }
}

/// Reads and parses a firmware file, failing on the first bad line.
///
/// Odd line endings are only warned about; the file may still be perfectly
/// loadable.
pub fn verify_firmware(path: &Path) -> Result<Vec<SRecord>> {
    let raw = fs::read(path)?;
    let content = String::from_utf8_lossy(&raw);
    let text: &str = &content;

    let cr = raw.iter().filter(|&&b| b == b'\r').count();
    let lf = raw.iter().filter(|&&b| b == b'\n').count();
    match classify_eol(cr, lf) {
        EolStyle::Unix => info!("S19 file contains {} lines (Unix)", lf),
        EolStyle::Mac => info!("S19 file contains {} lines (old Macintosh)", cr),
        EolStyle::Windows => info!("S19 file contains {} lines (Windows)", lf),
        EolStyle::Mixed => warn!("S19 file contains mixed EOL characters?!"),
        EolStyle::None => warn!("S19 file contains no EOL characters?!"),
    }

    let mut records = Vec::new();
    for (index, line) in split_lines(text).into_iter().enumerate() {
        match srecord::parse_line(line) {
            Ok(rec) => records.push(rec),
            Err(Error::Record(reason)) => {
                return Err(Error::Firmware {
                    line: index + 1,
                    reason,
                });
            }
            Err(other) => return Err(other),
        }
    }
    Ok(records)
}

/// Splits on `\n`, `\r\n` or bare `\r`, without a phantom empty line after a
/// trailing terminator.
fn split_lines(content: &str) -> Vec<&str> {
    let bytes = content.as_bytes();
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\n' => {
                lines.push(&content[start..i]);
                i += 1;
                start = i;
            }
            b'\r' => {
                lines.push(&content[start..i]);
                i += 1;
                if bytes.get(i) == Some(&b'\n') {
                    i += 1;
                }
                start = i;
            }
            _ => i += 1,
        }
    }
    if start < bytes.len() {
        lines.push(&content[start..]);
    }
    lines
}
