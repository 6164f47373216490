//! Definitions and implementations of data messages.
//!
//! See USB PD spec, [6.4].
pub mod alert;
pub mod bist;
pub mod epr_mode;
pub mod request;
pub mod sink_capabilities;
pub mod source_capabilities;
pub mod vendor_defined;

use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;

use crate::protocol_layer::message::ParseError;
use crate::protocol_layer::message::header::DataMessageType;

/// Payloads of data messages.
#[derive(Debug, Clone)]
#[non_exhaustive]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Data {
    /// Source capabilities.
    SourceCapabilities(source_capabilities::SourceCapabilities),
    /// Sink capabilities.
    SinkCapabilities(sink_capabilities::SinkCapabilities),
    /// Request for a power level from the source.
    ///
    /// Received requests arrive untyped ([`request::PowerSource::Unknown`])
    /// because typing one needs the capabilities it answers; the policy
    /// engine interprets it against its own advertisement.
    Request(request::PowerSource),
    /// Used to enter, acknowledge or exit EPR mode.
    EprMode(epr_mode::EprModeDataObject),
    /// Asynchronous alert from the partner.
    Alert(alert::AlertDataObject),
    /// Built-in self test control.
    Bist(bist::BistDataObject),
    /// Enter_USB data object, passed through opaquely.
    EnterUsb(u32),
    /// Source_Info response word.
    SourceInfo(u32),
    /// Get_Revision response word.
    Revision(u32),
    /// Vendor defined message: header plus up to 6 VDOs.
    VendorDefined((vendor_defined::VdmHeader, Vec<u32, 6>)),
    /// Unknown data type.
    Unknown,
}

impl Data {
    /// Parse the payload of a data message.
    pub fn parse(message_type: DataMessageType, num_objects: usize, payload: &[u8]) -> Result<Self, ParseError> {
        if payload.len() < 4 * num_objects {
            return Err(ParseError::InvalidLength {
                expected: 4 * num_objects,
                found: payload.len(),
            });
        }

        Ok(match message_type {
            DataMessageType::SourceCapabilities => {
                Data::SourceCapabilities(source_capabilities::SourceCapabilities::from_raw_pdos(
                    payload.chunks_exact(4).take(num_objects).map(LittleEndian::read_u32),
                ))
            }
            DataMessageType::SinkCapabilities => {
                Data::SinkCapabilities(sink_capabilities::SinkCapabilities::from_raw_pdos(
                    payload.chunks_exact(4).take(num_objects).map(LittleEndian::read_u32),
                ))
            }
            DataMessageType::Request => Data::Request(request::PowerSource::Unknown(request::RawDataObject(
                LittleEndian::read_u32(payload),
            ))),
            DataMessageType::EprRequest => {
                if num_objects < 2 {
                    return Err(ParseError::InvalidLength {
                        expected: 8,
                        found: payload.len(),
                    });
                }

                Data::Request(request::PowerSource::EprRequest(request::EprRequestDataObject {
                    rdo: LittleEndian::read_u32(payload),
                    pdo: source_capabilities::parse_raw_pdo(LittleEndian::read_u32(&payload[4..])),
                }))
            }
            DataMessageType::EprMode => Data::EprMode(epr_mode::EprModeDataObject(LittleEndian::read_u32(payload))),
            DataMessageType::Alert => Data::Alert(alert::AlertDataObject(LittleEndian::read_u32(payload))),
            DataMessageType::Bist => Data::Bist(bist::BistDataObject(LittleEndian::read_u32(payload))),
            DataMessageType::EnterUsb => Data::EnterUsb(LittleEndian::read_u32(payload)),
            DataMessageType::SourceInfo => Data::SourceInfo(LittleEndian::read_u32(payload)),
            DataMessageType::Revision => Data::Revision(LittleEndian::read_u32(payload)),
            DataMessageType::VendorDefined => {
                let header = vendor_defined::VdmHeader::from(LittleEndian::read_u32(payload));
                let objects = payload[4..4 * num_objects]
                    .chunks_exact(4)
                    .map(LittleEndian::read_u32)
                    .collect::<Vec<u32, 6>>();

                trace!("VDM RX: {:?} {:?}", header, objects);
                Data::VendorDefined((header, objects))
            }
            _ => {
                warn!("Unhandled data message type {:?}", message_type);
                Data::Unknown
            }
        })
    }

    /// Serialize message data to a slice, returning the number of written bytes.
    pub fn to_bytes(&self, payload: &mut [u8]) -> usize {
        match self {
            Self::SourceCapabilities(capabilities) => capabilities.to_bytes(payload),
            Self::SinkCapabilities(capabilities) => capabilities.to_bytes(payload),
            Self::Request(request::PowerSource::FixedVariableSupply(data_object)) => data_object.to_bytes(payload),
            Self::Request(request::PowerSource::Battery(data_object)) => data_object.to_bytes(payload),
            Self::Request(request::PowerSource::Pps(data_object)) => data_object.to_bytes(payload),
            Self::Request(request::PowerSource::Avs(data_object)) => data_object.to_bytes(payload),
            Self::Request(request::PowerSource::EprRequest(data_object)) => data_object.to_bytes(payload),
            Self::Request(request::PowerSource::Unknown(data_object)) => {
                LittleEndian::write_u32(payload, data_object.0);
                4
            }
            Self::EprMode(data_object) => data_object.to_bytes(payload),
            Self::Alert(data_object) => data_object.to_bytes(payload),
            Self::Bist(data_object) => data_object.to_bytes(payload),
            Self::EnterUsb(word) | Self::SourceInfo(word) | Self::Revision(word) => {
                LittleEndian::write_u32(payload, *word);
                4
            }
            Self::VendorDefined((header, objects)) => {
                let mut offset = header.to_bytes(payload);
                for object in objects {
                    LittleEndian::write_u32(&mut payload[offset..], *object);
                    offset += 4;
                }
                offset
            }
            Self::Unknown => 0,
        }
    }

    /// The number of data objects this payload serializes to.
    pub fn num_objects(&self) -> u8 {
        match self {
            Self::SourceCapabilities(capabilities) => capabilities.num_objects(),
            Self::SinkCapabilities(capabilities) => capabilities.num_objects(),
            Self::Request(request) => request.num_objects(),
            Self::EprMode(_) | Self::Alert(_) | Self::Bist(_) => 1,
            Self::EnterUsb(_) | Self::SourceInfo(_) | Self::Revision(_) => 1,
            Self::VendorDefined((_, objects)) => 1 + objects.len() as u8,
            Self::Unknown => 0,
        }
    }
}
