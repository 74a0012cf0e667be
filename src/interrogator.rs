//! Firmware metadata and location-id queries over the application link.
//!
//! The firmware answers a handful of identity queries (who built it, when,
//! for which decoder) and enumerates the location ids its tables live under.
//! All requests go out back to back; replies are collected as they arrive.

use crate::protocol::{self, Location};
use crate::rx::AppClient;
use crate::{Error, Result};
use log::{debug, info, warn};
use std::fmt;
use std::io::Write;
use std::time::{Duration, Instant};

/// How long the firmware gets to answer the full interrogation.
const INTERROGATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the firmware will say about itself.
#[derive(Debug, Default, Clone)]
pub struct FirmwareMeta {
    pub interface: Option<String>,
    pub firmware: Option<String>,
    pub decoder: Option<String>,
    pub build_date: Option<String>,
    pub compiler: Option<String>,
    pub operating_system: Option<String>,
    pub built_by: Option<String>,
    pub email: Option<String>,
    /// Location ids known to the firmware.
    pub locations: Vec<u16>,
}

impl FirmwareMeta {
    fn complete(&self) -> bool {
        self.interface.is_some()
            && self.firmware.is_some()
            && self.decoder.is_some()
            && self.build_date.is_some()
            && self.compiler.is_some()
            && self.operating_system.is_some()
            && self.built_by.is_some()
            && self.email.is_some()
            && !self.locations.is_empty()
    }
}

/// Layout descriptor for one location id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationInfo {
    pub flags: u16,
    pub parent: u16,
    pub ram_page: u8,
    pub flash_page: u8,
    pub ram_address: u16,
    pub flash_address: u16,
    pub size: u16,
}

impl LocationInfo {
    /// Decodes the 12-byte reply body.
    pub fn decode(body: &[u8]) -> Result<LocationInfo> {
        if body.len() < 12 {
            return Err(Error::Protocol(format!(
                "location info too short ({} bytes)",
                body.len()
            )));
        }
        Ok(LocationInfo {
            flags: u16::from_be_bytes([body[0], body[1]]),
            parent: u16::from_be_bytes([body[2], body[3]]),
            ram_page: body[4],
            flash_page: body[5],
            ram_address: u16::from_be_bytes([body[6], body[7]]),
            flash_address: u16::from_be_bytes([body[8], body[9]]),
            size: u16::from_be_bytes([body[10], body[11]]),
        })
    }
}

/// Runs identity and layout queries against a live firmware.
pub struct Interrogator<'a, W: Write> {
    client: &'a mut AppClient<W>,
}

impl<'a, W: Write> Interrogator<'a, W> {
    pub fn new(client: &'a mut AppClient<W>) -> Interrogator<'a, W> {
        Interrogator { client }
    }

    /// Fires every metadata request plus the location-id list request, then
    /// collects replies until all have arrived.
    pub fn interrogate(&mut self) -> Result<FirmwareMeta> {
        const META_IDS: [u16; 8] = [
            protocol::FE_CMD_INTERFACE,
            protocol::FE_CMD_FIRMWARE,
            protocol::FE_CMD_DECODER,
            protocol::FE_CMD_BUILDDATE,
            protocol::FE_CMD_COMPILER,
            protocol::FE_CMD_OSNAME,
            protocol::FE_CMD_USER,
            protocol::FE_CMD_EMAIL,
        ];

        for &id in META_IDS.iter() {
            self.client
                .send(&protocol::create_packet(id, None, None, None, false))?;
        }
        // List type 0 with an open mask.
        self.client.send(&protocol::create_packet(
            protocol::FE_CMD_LOCATION_ID_LIST,
            None,
            None,
            Some(&[0x00, 0x00, 0x00]),
            false,
        ))?;

        let mut meta = FirmwareMeta::default();
        let deadline = Instant::now() + INTERROGATE_TIMEOUT;
        while !meta.complete() {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(
                    "device did not answer all metadata queries".into(),
                ));
            }

            let frame = self.client.recv_frame(deadline - now)?;
            let (id, body) = match protocol::decode_packet(&frame) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("discarding undecodable frame: {}", e);
                    continue;
                }
            };
            let body = body.unwrap_or_default();

            if id == protocol::FE_CMD_LOCATION_ID_LIST + 1 {
                info!("Received location ID list");
                meta.locations = body
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                continue;
            }

            let (name, slot) = match id.wrapping_sub(1) {
                protocol::FE_CMD_INTERFACE => ("interface", &mut meta.interface),
                protocol::FE_CMD_FIRMWARE => ("firmware", &mut meta.firmware),
                protocol::FE_CMD_DECODER => ("decoder", &mut meta.decoder),
                protocol::FE_CMD_BUILDDATE => ("build_date", &mut meta.build_date),
                protocol::FE_CMD_COMPILER => ("compiler", &mut meta.compiler),
                protocol::FE_CMD_OSNAME => ("os", &mut meta.operating_system),
                protocol::FE_CMD_USER => ("build_by", &mut meta.built_by),
                protocol::FE_CMD_EMAIL => ("email", &mut meta.email),
                other => {
                    debug!("ignoring frame 0x{:04x}", other.wrapping_add(1));
                    continue;
                }
            };
            info!("Received meta: {}", name);
            *slot = Some(protocol::decode_text(&body));
        }
        Ok(meta)
    }

    /// Fetches the layout descriptor for one location id.
    pub fn location_info(&mut self, id: u16) -> Result<LocationInfo> {
        let packet = protocol::create_packet(
            protocol::FE_CMD_LOCATION_ID_INFO,
            None,
            None,
            Some(&id.to_be_bytes()),
            false,
        );
        let body = self
            .client
            .request(&packet, protocol::FE_CMD_LOCATION_ID_INFO)?
            .ok_or_else(|| Error::Protocol("location info reply carried no body".into()))?;
        LocationInfo::decode(&body)
    }

    /// Reads raw bytes from a location, from flash or its RAM copy.
    pub fn read_location(&mut self, location: Location, size: u16, flash: bool) -> Result<Vec<u8>> {
        let id = if flash {
            protocol::FE_CMD_FLASH_READ
        } else {
            protocol::FE_CMD_RAM_READ
        };
        let packet = protocol::create_packet(id, Some(location), Some(size), None, false);
        self.client
            .request(&packet, id)?
            .ok_or_else(|| Error::Protocol("read reply carried no body".into()))
    }
}

impl<'a, W: Write> fmt::Debug for Interrogator<'a, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrogator").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn reply(id: u16, body: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x01];
        frame.extend_from_slice(&id.to_be_bytes());
        frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
        frame.extend_from_slice(body);
        frame
    }

    #[test]
    fn decodes_location_info() {
        let body = [
            0x00, 0x05, 0xC0, 0x01, 0x00, 0xE0, 0x40, 0x00, 0x80, 0x60, 0x04, 0x00,
        ];
        let info = LocationInfo::decode(&body).unwrap();
        assert_eq!(info.flags, 0x0005);
        assert_eq!(info.parent, 0xC001);
        assert_eq!(info.ram_page, 0x00);
        assert_eq!(info.flash_page, 0xE0);
        assert_eq!(info.ram_address, 0x4000);
        assert_eq!(info.flash_address, 0x8060);
        assert_eq!(info.size, 0x0400);

        assert!(LocationInfo::decode(&body[..11]).is_err());
    }

    #[test]
    fn collects_the_full_interrogation() {
        let (tx, rx) = bounded(16);
        let names: [(u16, &[u8]); 8] = [
            (protocol::FE_CMD_INTERFACE, b"IFreeEMS Vanilla\x00"),
            (protocol::FE_CMD_FIRMWARE, b"FreeEMS\x00"),
            (protocol::FE_CMD_DECODER, b"JimStim\x00"),
            (protocol::FE_CMD_BUILDDATE, b"2014-05-02\x00"),
            (protocol::FE_CMD_COMPILER, b"GCC\x00"),
            (protocol::FE_CMD_OSNAME, b"Linux\x00"),
            (protocol::FE_CMD_USER, b"ari\x00"),
            (protocol::FE_CMD_EMAIL, b"ari@example.org\x00"),
        ];
        // Replies arrive out of order, with a stray frame mixed in.
        tx.send(reply(0x3000, b"noise")).unwrap();
        for (id, text) in names.iter().rev() {
            tx.send(reply(id.wrapping_add(1), text)).unwrap();
        }
        tx.send(reply(
            protocol::FE_CMD_LOCATION_ID_LIST + 1,
            &[0xC0, 0x03, 0x90, 0x00],
        ))
        .unwrap();

        let mut client = AppClient::new(Vec::new(), rx);
        let meta = Interrogator::new(&mut client).interrogate().unwrap();

        assert_eq!(meta.decoder.as_deref(), Some("JimStim"));
        assert_eq!(meta.built_by.as_deref(), Some("ari"));
        assert_eq!(meta.locations, vec![0xC003, 0x9000]);

        // Nine requests went out before any reply was consumed.
        let writes = client.free();
        assert_eq!(writes.iter().filter(|&&b| b == 0xCC).count(), 9);
    }
}
