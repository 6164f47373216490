//! Chunked extended message support.
//!
//! Extended messages beyond the packet size are split into chunks of up to
//! 26 bytes. The receiver acknowledges each chunk with a chunk request for
//! the next number until the announced total size is assembled.
//!
//! See USB PD spec, [6.13].
use heapless::Vec;

use super::ExtendedHeader;
use crate::protocol_layer::message::ParseError;
use crate::protocol_layer::message::header::ExtendedMessageType;

/// Maximum data bytes in a single extended message chunk.
pub const MAX_EXTENDED_MSG_CHUNK_LEN: usize = 26;

/// Maximum total extended message length (data only, excluding headers).
pub const MAX_EXTENDED_MSG_LEN: usize = 260;

/// Maximum extended message length under PD 2.0, where only the single-chunk
/// legacy form exists.
pub const MAX_EXTENDED_MSG_LEGACY_LEN: usize = 26;

/// Result of feeding one received chunk into the assembler.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChunkResult {
    /// Message complete; the assembled payload is available.
    Complete(Vec<u8, MAX_EXTENDED_MSG_LEN>),
    /// More chunks needed; request the contained chunk number.
    NeedMoreChunks(u8),
    /// The peer requested the contained chunk number from us.
    ChunkRequested(u8),
}

/// Assembler for chunked extended messages.
///
/// Accumulates chunk payloads until the total size announced in the first
/// chunk's extended header has been received.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChunkAssembler {
    buffer: Vec<u8, MAX_EXTENDED_MSG_LEN>,
    expected_size: u16,
    message_type: Option<ExtendedMessageType>,
    next_chunk: u8,
    in_progress: bool,
}

impl ChunkAssembler {
    /// Create an idle assembler.
    pub const fn new() -> Self {
        Self {
            buffer: Vec::new(),
            expected_size: 0,
            message_type: None,
            next_chunk: 0,
            in_progress: false,
        }
    }

    /// Drop any partial assembly.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Whether a multi-chunk assembly is underway.
    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    /// The message type being assembled, while in progress.
    pub fn message_type(&self) -> Option<ExtendedMessageType> {
        self.message_type
    }

    /// Feed one received chunk.
    ///
    /// Out-of-order chunks and interleaved message types abort the sequence
    /// with an error; the caller decides between Not_Supported and a soft
    /// reset.
    pub fn process_chunk(
        &mut self,
        message_type: ExtendedMessageType,
        ext_header: ExtendedHeader,
        chunk_data: &[u8],
    ) -> Result<ChunkResult, ParseError> {
        let chunk_number = ext_header.chunk_number();

        if ext_header.request_chunk() {
            return Ok(ChunkResult::ChunkRequested(chunk_number));
        }

        if chunk_data.len() > MAX_EXTENDED_MSG_CHUNK_LEN {
            self.reset();
            return Err(ParseError::ChunkOverflow {
                size: chunk_data.len(),
                max: MAX_EXTENDED_MSG_CHUNK_LEN,
            });
        }

        if chunk_number == 0 {
            // First chunk restarts assembly, discarding any stale partial.
            self.reset();
            self.expected_size = ext_header.data_size();
            self.message_type = Some(message_type);
            self.in_progress = true;
        } else if !self.in_progress || self.message_type != Some(message_type) || chunk_number != self.next_chunk {
            self.reset();
            return Err(ParseError::OutOfOrderChunk(chunk_number));
        }

        if self.buffer.extend_from_slice(chunk_data).is_err() {
            self.reset();
            return Err(ParseError::ChunkOverflow {
                size: MAX_EXTENDED_MSG_LEN + 1,
                max: MAX_EXTENDED_MSG_LEN,
            });
        }
        self.next_chunk = chunk_number + 1;

        if self.buffer.len() >= self.expected_size as usize {
            self.in_progress = false;
            // Drop trailing zero padding of the last data object.
            self.buffer.truncate(self.expected_size as usize);
            Ok(ChunkResult::Complete(self.buffer.clone()))
        } else {
            Ok(ChunkResult::NeedMoreChunks(self.next_chunk))
        }
    }

    /// Build the extended header of a chunk request.
    pub fn chunk_request_header(chunk_number: u8) -> ExtendedHeader {
        ExtendedHeader::new(0)
            .with_chunked(true)
            .with_request_chunk(true)
            .with_chunk_number(chunk_number)
    }
}

/// Splits an extended payload into transmit chunks.
#[derive(Debug, Clone)]
pub struct ChunkSender<'a> {
    data: &'a [u8],
    total_chunks: u8,
}

impl<'a> ChunkSender<'a> {
    /// Create a sender over the complete payload.
    pub fn new(data: &'a [u8]) -> Self {
        let total_chunks = if data.is_empty() {
            1
        } else {
            data.len().div_ceil(MAX_EXTENDED_MSG_CHUNK_LEN) as u8
        };

        Self { data, total_chunks }
    }

    /// Total number of chunks.
    pub fn total_chunks(&self) -> u8 {
        self.total_chunks
    }

    /// Total payload size in bytes.
    pub fn data_size(&self) -> u16 {
        self.data.len() as u16
    }

    /// Get one chunk with its extended header, `None` past the end.
    pub fn chunk(&self, chunk_number: u8) -> Option<(ExtendedHeader, &'a [u8])> {
        if chunk_number >= self.total_chunks {
            return None;
        }

        let start = chunk_number as usize * MAX_EXTENDED_MSG_CHUNK_LEN;
        let end = (start + MAX_EXTENDED_MSG_CHUNK_LEN).min(self.data.len());

        let ext_header = ExtendedHeader::new(self.data_size())
            .with_chunked(true)
            .with_chunk_number(chunk_number);

        Some((ext_header, &self.data[start..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_layer::message::header::ExtendedMessageType;

    #[test]
    fn sender_splits_26_byte_chunks() {
        // 30 bytes make two chunks of 26 and 4 bytes.
        let data: [u8; 30] = core::array::from_fn(|i| i as u8);
        let sender = ChunkSender::new(&data);

        assert_eq!(sender.total_chunks(), 2);

        let (header, chunk) = sender.chunk(0).unwrap();
        assert_eq!(chunk.len(), 26);
        assert_eq!(header.chunk_number(), 0);
        assert_eq!(header.data_size(), 30);
        assert!(header.chunked());

        let (header, chunk) = sender.chunk(1).unwrap();
        assert_eq!(chunk.len(), 4);
        assert_eq!(header.chunk_number(), 1);

        assert!(sender.chunk(2).is_none());
    }

    #[test]
    fn assembler_reproduces_payload() {
        let data: [u8; 60] = core::array::from_fn(|i| (i * 3) as u8);
        let sender = ChunkSender::new(&data);
        let mut assembler = ChunkAssembler::new();

        let mut assembled = None;
        for chunk_number in 0..sender.total_chunks() {
            let (header, chunk) = sender.chunk(chunk_number).unwrap();
            match assembler
                .process_chunk(ExtendedMessageType::ManufacturerInfo, header, chunk)
                .unwrap()
            {
                ChunkResult::Complete(payload) => assembled = Some(payload),
                ChunkResult::NeedMoreChunks(next) => assert_eq!(next, chunk_number + 1),
                ChunkResult::ChunkRequested(_) => panic!("not a chunk request"),
            }
        }

        assert_eq!(assembled.unwrap().as_slice(), &data);
    }

    #[test]
    fn single_chunk_completes_immediately() {
        let data = [1u8, 2, 3, 4, 5];
        let header = ExtendedHeader::new(5).with_chunked(true).with_chunk_number(0);
        let mut assembler = ChunkAssembler::new();

        match assembler
            .process_chunk(ExtendedMessageType::ExtendedControl, header, &data)
            .unwrap()
        {
            ChunkResult::Complete(payload) => assert_eq!(payload.as_slice(), &data),
            _ => panic!("expected completion"),
        }
        assert!(!assembler.is_in_progress());
    }

    #[test]
    fn out_of_order_chunk_aborts() {
        let data: [u8; 30] = [0; 30];
        let sender = ChunkSender::new(&data);
        let mut assembler = ChunkAssembler::new();

        let (header, chunk) = sender.chunk(0).unwrap();
        assembler
            .process_chunk(ExtendedMessageType::ManufacturerInfo, header, chunk)
            .unwrap();

        // Replay chunk 0's header with the wrong number.
        let bad_header = ExtendedHeader::new(30).with_chunked(true).with_chunk_number(3);
        let result = assembler.process_chunk(ExtendedMessageType::ManufacturerInfo, bad_header, chunk);
        assert!(matches!(result, Err(ParseError::OutOfOrderChunk(3))));
        assert!(!assembler.is_in_progress());
    }

    #[test]
    fn chunk_request_is_reported() {
        let mut assembler = ChunkAssembler::new();
        let header = ChunkAssembler::chunk_request_header(1);

        match assembler
            .process_chunk(ExtendedMessageType::ManufacturerInfo, header, &[])
            .unwrap()
        {
            ChunkResult::ChunkRequested(chunk) => assert_eq!(chunk, 1),
            _ => panic!("expected chunk request"),
        }
    }

    #[test]
    fn oversized_chunk_is_rejected() {
        let mut assembler = ChunkAssembler::new();
        let header = ExtendedHeader::new(30).with_chunked(true).with_chunk_number(0);
        let oversized = [0u8; 27];

        assert!(matches!(
            assembler.process_chunk(ExtendedMessageType::ManufacturerInfo, header, &oversized),
            Err(ParseError::ChunkOverflow { size: 27, .. })
        ));
    }
}
