//! Definitions and implementations of extended messages.
//!
//! See USB PD spec, [6.5].
pub mod chunked;
pub mod extended_control;

use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;
use proc_bitfield::bitfield;

use crate::protocol_layer::message::data::sink_capabilities::{SinkCapabilities, SinkPowerDataObject};
use crate::protocol_layer::message::data::source_capabilities::{self, PowerDataObject};
use crate::protocol_layer::message::header::ExtendedMessageType;

/// Maximum number of PDOs in an EPR capabilities message: 7 SPR positions,
/// a zero separator would be padding, and up to 6 EPR positions.
pub const MAX_EPR_CAPABILITY_PDOS: usize = 13;

/// Maximum manufacturer-info string length.
pub const MAX_MANUFACTURER_STRING: usize = 26;

bitfield! {
    /// The extended message header, following the message header of every
    /// extended message.
    ///
    /// See [6.2.1.2].
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ExtendedHeader(pub u16): Debug, FromStorage, IntoStorage {
        /// Whether the message is sent in chunks.
        pub chunked: bool @ 15,
        /// Number of the present chunk.
        pub chunk_number: u8 @ 11..=14,
        /// Set on a request for the chunk in `chunk_number`.
        pub request_chunk: bool @ 10,
        /// Total payload size in bytes, across all chunks.
        pub data_size: u16 @ 0..=8,
    }
}

impl ExtendedHeader {
    /// Create a header for a payload of the given total size.
    pub fn new(data_size: u16) -> Self {
        Self(0).with_data_size(data_size)
    }

    /// Parse an extended header from its binary representation.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self(LittleEndian::read_u16(buf))
    }

    /// Serialize the extended header, returning the written size.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u16(buf, self.0);
        2
    }
}

/// Content of a Get_Manufacturer_Info message.
///
/// See [6.5.6].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GetManufacturerInfo {
    /// 0 = port, 1 = battery.
    pub target: u8,
    /// Battery reference, when the target is a battery.
    pub reference: u8,
}

/// Content of a Manufacturer_Info message.
///
/// See [6.5.7].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ManufacturerInfo {
    /// USB-IF vendor ID.
    pub vid: u16,
    /// Product ID.
    pub pid: u16,
    /// Manufacturer string, not null-terminated.
    pub string: Vec<u8, MAX_MANUFACTURER_STRING>,
}

impl ManufacturerInfo {
    /// Serialized length in bytes.
    pub fn len(&self) -> usize {
        4 + self.string.len()
    }

    /// Whether the info carries no string.
    pub fn is_empty(&self) -> bool {
        self.string.is_empty()
    }

    /// Serialize, returning the written size.
    pub fn to_bytes(&self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u16(buf, self.vid);
        LittleEndian::write_u16(&mut buf[2..], self.pid);
        buf[4..4 + self.string.len()].copy_from_slice(&self.string);
        self.len()
    }

    /// Parse from an assembled payload.
    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut string = Vec::new();
        if buf.len() > 4 {
            let take = (buf.len() - 4).min(MAX_MANUFACTURER_STRING);
            _ = string.extend_from_slice(&buf[4..4 + take]);
        }

        Self {
            vid: LittleEndian::read_u16(buf),
            pid: LittleEndian::read_u16(&buf[2..]),
            string,
        }
    }
}

/// Assembled payloads of extended messages.
#[derive(Debug, Clone)]
#[non_exhaustive]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Extended {
    /// Extended control message.
    ExtendedControl(extended_control::ExtendedControl),
    /// EPR source capabilities (SPR PDOs in positions 1-7, EPR above).
    EprSourceCapabilities(Vec<PowerDataObject, MAX_EPR_CAPABILITY_PDOS>),
    /// EPR sink capabilities.
    EprSinkCapabilities(Vec<SinkPowerDataObject, MAX_EPR_CAPABILITY_PDOS>),
    /// Request for manufacturer information.
    GetManufacturerInfo(GetManufacturerInfo),
    /// Manufacturer information.
    ManufacturerInfo(ManufacturerInfo),
    /// Opaque extended source capabilities blob.
    SourceCapabilitiesExtended(Vec<u8, 26>),
    /// Opaque extended sink capabilities blob.
    SinkCapabilitiesExtended(Vec<u8, 26>),
    /// Unknown payload kind.
    Unknown,
}

impl Extended {
    /// Parse an assembled extended payload of the given message type.
    pub fn parse(message_type: ExtendedMessageType, payload: &[u8]) -> Self {
        match message_type {
            ExtendedMessageType::ExtendedControl => {
                Extended::ExtendedControl(extended_control::ExtendedControl::from_bytes(payload))
            }
            ExtendedMessageType::EprSourceCapabilities => Extended::EprSourceCapabilities(
                payload
                    .chunks_exact(4)
                    .take(MAX_EPR_CAPABILITY_PDOS)
                    .map(|buf| source_capabilities::parse_raw_pdo(LittleEndian::read_u32(buf)))
                    .collect(),
            ),
            ExtendedMessageType::EprSinkCapabilities => Extended::EprSinkCapabilities(
                payload
                    .chunks_exact(4)
                    .take(MAX_EPR_CAPABILITY_PDOS)
                    .map(|buf| SinkPowerDataObject::parse_raw(LittleEndian::read_u32(buf)))
                    .collect(),
            ),
            ExtendedMessageType::GetManufacturerInfo => Extended::GetManufacturerInfo(GetManufacturerInfo {
                target: payload.first().copied().unwrap_or_default(),
                reference: payload.get(1).copied().unwrap_or_default(),
            }),
            ExtendedMessageType::ManufacturerInfo => Extended::ManufacturerInfo(ManufacturerInfo::from_bytes(payload)),
            ExtendedMessageType::SourceCapabilitiesExtended => {
                let mut blob = Vec::new();
                _ = blob.extend_from_slice(&payload[..payload.len().min(26)]);
                Extended::SourceCapabilitiesExtended(blob)
            }
            ExtendedMessageType::SinkCapabilitiesExtended => {
                let mut blob = Vec::new();
                _ = blob.extend_from_slice(&payload[..payload.len().min(26)]);
                Extended::SinkCapabilitiesExtended(blob)
            }
            _ => Extended::Unknown,
        }
    }

    /// Serialize the payload into `buf`, returning the written size.
    pub fn to_bytes(&self, buf: &mut [u8]) -> usize {
        match self {
            Extended::ExtendedControl(control) => control.to_bytes(buf),
            Extended::EprSourceCapabilities(pdos) => {
                let mut offset = 0;
                for pdo in pdos {
                    LittleEndian::write_u32(&mut buf[offset..], pdo.raw());
                    offset += 4;
                }
                offset
            }
            Extended::EprSinkCapabilities(pdos) => {
                let mut offset = 0;
                for pdo in pdos {
                    LittleEndian::write_u32(&mut buf[offset..], pdo.to_raw());
                    offset += 4;
                }
                offset
            }
            Extended::GetManufacturerInfo(request) => {
                buf[0] = request.target;
                buf[1] = request.reference;
                2
            }
            Extended::ManufacturerInfo(info) => info.to_bytes(buf),
            Extended::SourceCapabilitiesExtended(blob) | Extended::SinkCapabilitiesExtended(blob) => {
                buf[..blob.len()].copy_from_slice(blob);
                blob.len()
            }
            Extended::Unknown => 0,
        }
    }

    /// Build EPR sink capabilities from the sink capability set.
    pub fn from_sink_capabilities(capabilities: &SinkCapabilities) -> Self {
        Extended::EprSinkCapabilities(capabilities.pdos().iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_header_fields() {
        let header = ExtendedHeader::new(30).with_chunked(true).with_chunk_number(1);

        assert_eq!(header.data_size(), 30);
        assert!(header.chunked());
        assert!(!header.request_chunk());
        assert_eq!(header.chunk_number(), 1);

        let mut buf = [0u8; 2];
        header.to_bytes(&mut buf);
        assert_eq!(ExtendedHeader::from_bytes(&buf), header);
    }

    #[test]
    fn manufacturer_info_codec() {
        let mut info = ManufacturerInfo {
            vid: 0x04B4,
            pid: 0xF500,
            string: Vec::new(),
        };
        info.string.extend_from_slice(b"ACME PD").unwrap();

        let mut buf = [0u8; 32];
        let size = info.to_bytes(&mut buf);
        assert_eq!(size, 11);

        let parsed = ManufacturerInfo::from_bytes(&buf[..size]);
        assert_eq!(parsed, info);
    }
}
