//! Grouping of S2 records into contiguous banked-flash page images.

use crate::srecord::{RecordKind, SRecord};
use crate::{Error, Result};
use log::warn;

/// Bottom of the banked window selected by PPAGE.
pub const WINDOW_START: u16 = 0x8000;
/// First address past the banked window.
pub const WINDOW_END: u16 = 0xC000;
/// Width of the window, and the most data one page can hold.
pub const MAX_PAGE_SIZE: usize = 16 * 1024;

/// A contiguous run of bytes inside one 16 KiB flash page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPage {
    pub page: u8,
    /// Start address inside the banked window.
    pub address: u16,
    pub data: Vec<u8>,
}

impl MemoryPage {
    pub fn new(page: u8, address: u16) -> MemoryPage {
        MemoryPage {
            page,
            address,
            data: Vec::new(),
        }
    }

    /// Appends bytes at the current end of the page.
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        let len = self.data.len() + bytes.len();
        if len > MAX_PAGE_SIZE || self.address as usize + len > WINDOW_END as usize {
            return Err(Error::Range(format!(
                "{} bytes will overflow page 0x{:02x} @ 0x{:04x}",
                bytes.len(),
                self.page,
                self.address
            )));
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// First address past the data added so far.
    pub fn end_address(&self) -> u16 {
        self.address + self.data.len() as u16
    }
}

/// Folds S2 records into page images, splitting whenever the page number
/// changes or the address is not the continuation of the previous record.
///
/// The caller is expected to have stripped the S0 header and S8 terminator;
/// anything else that is not an S2 data record is skipped with a warning.
/// Returns the pages and the total number of data bytes they hold.
pub fn records_to_pages(records: &[SRecord]) -> Result<(Vec<MemoryPage>, usize)> {
    let mut pages = Vec::new();
    let mut current: Option<MemoryPage> = None;
    let mut total = 0usize;

    for rec in records {
        if rec.kind != RecordKind::S2 {
            warn!("{} records are not supported, skipping...", rec.kind.prefix());
            continue;
        }
        if rec.data.is_empty() {
            warn!("Record has no data, skipping...");
            continue;
        }

        let page = rec.page()?;
        let address = rec.page_address()?;

        match current.as_mut() {
            Some(open) if open.page == page && open.end_address() == address => {
                open.push(&rec.data)?;
            }
            _ => {
                if let Some(done) = current.take() {
                    pages.push(done);
                }
                let mut fresh = MemoryPage::new(page, address);
                fresh.push(&rec.data)?;
                current = Some(fresh);
            }
        }
        total += rec.data.len();
    }

    if let Some(done) = current.take() {
        pages.push(done);
    }

    Ok((pages, total))
}
