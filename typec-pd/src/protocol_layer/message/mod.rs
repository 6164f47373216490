//! Definitions of message content.
//!
//! A [`Message`] is one decoded PD frame: packet class, header, and an
//! optional payload of data objects or an assembled extended payload.
pub mod data;
pub mod extended;
pub mod header;

use data::Data;
use extended::{Extended, ExtendedHeader};
use header::{Header, MessageType};
use typec_pd_traits::Sop;

/// Errors that can occur during message/header parsing.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// The input buffer has an invalid length.
    #[error("invalid length: expected `{expected}`, found `{found}`")]
    InvalidLength {
        /// The expected length.
        expected: usize,
        /// The actual length found.
        found: usize,
    },
    /// The specification revision field was invalid.
    #[error("unsupported specification revision `{0}`")]
    UnsupportedSpecificationRevision(u8),
    /// An unknown or reserved message type was encountered.
    #[error("invalid message type `{0}`")]
    InvalidMessageType(u8),
    /// An unknown or reserved control message type was encountered.
    #[error("invalid control message type `{0}`")]
    InvalidControlMessageType(u8),
    /// A chunk exceeded the chunk or total size limit.
    #[error("chunk of `{size}` bytes exceeds `{max}`")]
    ChunkOverflow {
        /// Offending size.
        size: usize,
        /// The allowed maximum.
        max: usize,
    },
    /// A chunk arrived out of sequence.
    #[error("out-of-order chunk `{0}`")]
    OutOfOrderChunk(u8),
    /// Other parsing error with a message.
    #[error("parse error: {0}")]
    Other(&'static str),
}

/// Message payload kinds.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Payload {
    /// Payload of a data message.
    Data(Data),
    /// Assembled payload of an extended message.
    Extended(Extended),
}

/// A USB PD message.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Message {
    /// The packet class the message was received on or is sent to.
    pub sop: Sop,
    /// The message header.
    pub header: Header,
    /// Payload for data and extended messages.
    pub payload: Option<Payload>,
}

/// Size of the message header in bytes.
pub const MSG_HEADER_SIZE: usize = 2;

/// Size of the extended message header in bytes.
pub const EXT_HEADER_SIZE: usize = 2;

impl Message {
    /// Create a new message from a message header.
    pub fn new(header: Header) -> Self {
        Self {
            sop: Sop::Sop,
            header,
            payload: None,
        }
    }

    /// Create a new message from a message header and payload data.
    pub fn new_with_data(header: Header, data: Data) -> Self {
        Self {
            sop: Sop::Sop,
            header,
            payload: Some(Payload::Data(data)),
        }
    }

    /// Address the message to another packet class.
    pub fn with_sop(mut self, sop: Sop) -> Self {
        self.sop = sop;
        self
    }

    /// Serialize a message to a slice, returning the number of written bytes.
    ///
    /// Extended messages are serialized in their single-chunk form; the
    /// protocol layer splits larger payloads before calling this.
    pub fn to_bytes(&self, buffer: &mut [u8]) -> usize {
        let mut size = self.header.to_bytes(buffer);

        match self.payload.as_ref() {
            None => {}
            Some(Payload::Data(data)) => size += data.to_bytes(&mut buffer[size..]),
            Some(Payload::Extended(extended)) => {
                let payload_size = extended.to_bytes(&mut buffer[size + EXT_HEADER_SIZE..]);
                let ext_header = ExtendedHeader::new(payload_size as u16).with_chunked(true);
                ext_header.to_bytes(&mut buffer[size..]);
                size += EXT_HEADER_SIZE + payload_size;
                // Pad to the data object boundary; the buffer is zeroed.
                size += (4 - (EXT_HEADER_SIZE + payload_size) % 4) % 4;
            }
        }

        size
    }

    /// Parse a message from a slice of bytes, received on the given packet
    /// class.
    ///
    /// Multi-chunk extended messages cannot be parsed here; their chunks are
    /// assembled by the protocol layer first.
    pub fn from_bytes(data: &[u8], sop: Sop) -> Result<Self, ParseError> {
        let header = Header::from_bytes(data)?;
        let payload = &data[MSG_HEADER_SIZE..];

        let mut message = Self { sop, header, payload: None };

        match header.message_type() {
            MessageType::Control(_) => {}
            MessageType::Data(data_message_type) => {
                message.payload = Some(Payload::Data(Data::parse(
                    data_message_type,
                    header.num_objects(),
                    payload,
                )?));
            }
            MessageType::Extended(extended_message_type) => {
                if payload.len() < EXT_HEADER_SIZE {
                    return Err(ParseError::InvalidLength {
                        expected: EXT_HEADER_SIZE,
                        found: payload.len(),
                    });
                }

                let ext_header = ExtendedHeader::from_bytes(payload);
                let content = &payload[EXT_HEADER_SIZE..];

                if ext_header.data_size() as usize > content.len() {
                    return Err(ParseError::InvalidLength {
                        expected: ext_header.data_size() as usize,
                        found: content.len(),
                    });
                }

                message.payload = Some(Payload::Extended(Extended::parse(
                    extended_message_type,
                    &content[..ext_header.data_size() as usize],
                )));
            }
        }

        Ok(message)
    }

    /// Split a raw extended frame into its headers and chunk payload.
    pub fn parse_extended_chunk(data: &[u8]) -> Result<(Header, ExtendedHeader, &[u8]), ParseError> {
        let header = Header::from_bytes(data)?;
        if data.len() < MSG_HEADER_SIZE + EXT_HEADER_SIZE {
            return Err(ParseError::InvalidLength {
                expected: MSG_HEADER_SIZE + EXT_HEADER_SIZE,
                found: data.len(),
            });
        }

        let ext_header = ExtendedHeader::from_bytes(&data[MSG_HEADER_SIZE..]);
        Ok((header, ext_header, &data[MSG_HEADER_SIZE + EXT_HEADER_SIZE..]))
    }
}

#[cfg(test)]
mod tests {
    use super::data::source_capabilities::{PowerDataObject, SourceCapabilities};
    use super::data::{Data, request};
    use super::header::{ControlMessageType, DataMessageType, Header, MessageType, SpecificationRevision};
    use super::{Message, Payload};
    use crate::counters::{Counter, CounterType};
    use crate::{DataRole, PowerRole, Sop};

    fn template() -> Header {
        Header::new_template(DataRole::Ufp, PowerRole::Sink, SpecificationRevision::R3_X)
    }

    #[test]
    fn control_message_round_trip() {
        let message = Message::new(Header::new_control(
            template(),
            Counter::new_from_value(CounterType::MessageId, 3),
            ControlMessageType::Accept,
        ));

        let mut buf = [0u8; 30];
        let size = message.to_bytes(&mut buf);
        assert_eq!(size, 2);

        let parsed = Message::from_bytes(&buf[..size], Sop::Sop).unwrap();
        assert_eq!(parsed.header, message.header);
        assert!(parsed.payload.is_none());
    }

    #[test]
    fn request_message_round_trip() {
        let request = request::FixedVariableSupply(0)
            .with_object_position(2)
            .with_raw_operating_current(300)
            .with_raw_max_operating_current(300)
            .with_no_usb_suspend(true);

        let message = Message::new_with_data(
            Header::new_data(
                template(),
                Counter::new_from_value(CounterType::MessageId, 1),
                DataMessageType::Request,
                1,
            ),
            Data::Request(request::PowerSource::FixedVariableSupply(request)),
        );

        let mut buf = [0u8; 30];
        let size = message.to_bytes(&mut buf);
        assert_eq!(size, 6);

        // Received requests decode untyped; the raw word must survive.
        let parsed = Message::from_bytes(&buf[..size], Sop::Sop).unwrap();
        let Some(Payload::Data(Data::Request(request::PowerSource::Unknown(raw)))) = parsed.payload else {
            panic!("expected raw request payload");
        };
        assert_eq!(raw.0, request.0);
        assert_eq!(raw.object_position(), 2);
    }

    #[test]
    fn source_capabilities_round_trip() {
        let capabilities =
            SourceCapabilities::from_raw_pdos([0x0801_912C_u32, 0x0002_D12C, 0xC8DC_2164].into_iter());

        let message = Message::new_with_data(
            Header::new_data(
                template().with_port_power_role(PowerRole::Source),
                Counter::new_from_value(CounterType::MessageId, 0),
                DataMessageType::SourceCapabilities,
                capabilities.num_objects(),
            ),
            Data::SourceCapabilities(capabilities.clone()),
        );

        let mut buf = [0u8; 30];
        let size = message.to_bytes(&mut buf);
        assert_eq!(size, 2 + 12);

        let parsed = Message::from_bytes(&buf[..size], Sop::Sop).unwrap();
        let Some(Payload::Data(Data::SourceCapabilities(parsed_caps))) = parsed.payload else {
            panic!("expected source capabilities");
        };

        assert_eq!(parsed_caps.pdos(), capabilities.pdos());
        assert!(matches!(parsed_caps.pdos()[0], PowerDataObject::FixedSupply(_)));
    }

    #[test]
    fn message_type_discrimination_by_sop() {
        // A GoodCRC on SOP' must keep its packet class.
        let message = Message::new(Header::new_control(
            template(),
            Counter::new_from_value(CounterType::MessageId, 0),
            ControlMessageType::GoodCRC,
        ))
        .with_sop(Sop::SopPrime);

        let mut buf = [0u8; 30];
        let size = message.to_bytes(&mut buf);

        let parsed = Message::from_bytes(&buf[..size], Sop::SopPrime).unwrap();
        assert_eq!(parsed.sop, Sop::SopPrime);
        assert_eq!(
            parsed.header.message_type(),
            MessageType::Control(ControlMessageType::GoodCRC)
        );
    }
}
