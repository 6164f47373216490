//! The protocol layer is controlled by the policy engine, and commands the
//! PHY driver.
//!
//! Handles
//! - construction of messages,
//! - per-packet-class message ID counters,
//! - GoodCRC acknowledgement and retransmission filtering,
//! - transmit retries,
//! - chunking of extended messages,
//! - reset operation.
pub mod message;

use core::future::Future;
use core::marker::PhantomData;

use embassy_futures::select::{Either, select};
use message::data::{Data, request};
use message::extended::chunked::{
    ChunkAssembler, ChunkResult, ChunkSender, MAX_EXTENDED_MSG_CHUNK_LEN, MAX_EXTENDED_MSG_LEGACY_LEN,
};
use message::extended::extended_control::{ExtendedControl, ExtendedControlMessageType};
use message::extended::{Extended, ExtendedHeader};
use message::header::{
    ControlMessageType, DataMessageType, ExtendedMessageType, Header, MessageType, SpecificationRevision,
};
use message::{EXT_HEADER_SIZE, MSG_HEADER_SIZE, Message, ParseError, Payload};
use typec_pd_traits::{DriverRxError, DriverTxError, PdDriver, Sop};

use crate::counters::{Counter, CounterType, Error as CounterError};
use crate::timers::{Timer, TimerType};
use crate::{DataRole, PowerRole};

/// Maximum message size including headers, payload and padding.
const MAX_MESSAGE_SIZE: usize = 272;

/// Errors that can occur in the protocol layer.
#[derive(thiserror::Error, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// An error occured during data reception.
    #[error("RX error")]
    RxError(#[from] RxError),
    /// An error occured during data transmission.
    #[error("TX error")]
    TxError(#[from] TxError),
    /// Transmission failed after the maximum number of allowed retries.
    #[error("transmit retries (`{0}`) exceeded")]
    TransmitRetriesExceeded(u8),
    /// An unexpected message was received.
    #[error("unexpected message")]
    UnexpectedMessage,
    /// A chunked transfer did not complete.
    #[error("chunk sequence aborted")]
    ChunkSequenceAborted,
}

/// Errors that can occur during reception of data.
#[derive(thiserror::Error, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxError {
    /// Port partner requested soft reset on the given packet class.
    #[error("soft reset")]
    SoftReset(Sop),
    /// Driver reported a hard reset.
    #[error("hard reset")]
    HardReset,
    /// A timeout during message reception.
    #[error("receive timeout")]
    ReceiveTimeout,
    /// An unsupported message was received.
    #[error("unsupported message")]
    UnsupportedMessage,
    /// A message parsing error occured.
    #[error("parse error")]
    ParseError(#[from] ParseError),
    /// The received acknowledgement does not match the last transmitted message's ID.
    #[error("wrong tx id `{0}` acknowledged")]
    AcknowledgeMismatch(u8),
}

/// Errors that can occur during transmission of data.
#[derive(thiserror::Error, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxError {
    /// Driver reported a hard reset.
    #[error("hard reset")]
    HardReset,
}

/// The USB PD protocol layer.
///
/// Message ID counters are kept per packet class, so concurrent SOP and
/// SOP' conversations cannot disturb each other.
#[derive(Debug)]
pub struct ProtocolLayer<DRIVER: PdDriver, TIMER: Timer> {
    driver: DRIVER,
    default_header: Header,
    tx_message_id: [Counter; Sop::COUNT],
    rx_message_id: [Option<Counter>; Sop::COUNT],
    retry: Counter,
    chunk_assembler: ChunkAssembler,
    _timer: PhantomData<TIMER>,
}

impl<DRIVER: PdDriver, TIMER: Timer> ProtocolLayer<DRIVER, TIMER> {
    /// Create a new protocol layer from a driver and default header.
    pub fn new(driver: DRIVER, default_header: Header) -> Self {
        Self {
            driver,
            default_header,
            tx_message_id: [Counter::new(CounterType::MessageId); Sop::COUNT],
            rx_message_id: [None; Sop::COUNT],
            retry: Counter::new(CounterType::Retry),
            chunk_assembler: ChunkAssembler::new(),
            _timer: PhantomData,
        }
    }

    /// Reset the counters of a single packet class, as done for Soft_Reset.
    pub fn reset_sop(&mut self, sop: Sop) {
        self.tx_message_id[sop.index()] = Counter::new(CounterType::MessageId);
        self.rx_message_id[sop.index()] = None;
        self.retry.reset();
        self.chunk_assembler.reset();
    }

    /// Reset all packet classes, as done for Hard_Reset.
    pub fn reset(&mut self) {
        for sop in [Sop::Sop, Sop::SopPrime, Sop::SopDoublePrime] {
            self.reset_sop(sop);
        }
    }

    /// The revision currently used for message construction.
    pub fn revision(&self) -> SpecificationRevision {
        // The template was validated at construction.
        self.default_header.spec_revision().unwrap_or(SpecificationRevision::R3_X)
    }

    /// The sender-response timer type for the active revision.
    pub fn sender_response_timer(&self) -> TimerType {
        TimerType::sender_response(self.revision())
    }

    /// Update the data role in the header template after a DR swap.
    pub fn set_data_role(&mut self, data_role: DataRole) {
        self.default_header = self.default_header.with_port_data_role(data_role);
    }

    /// Update the power role in the header template after a PR swap.
    pub fn set_power_role(&mut self, power_role: PowerRole) {
        self.default_header = self.default_header.with_port_power_role(power_role);
    }

    /// Allows tests to access the driver directly.
    #[cfg(test)]
    pub fn driver(&mut self) -> &mut DRIVER {
        &mut self.driver
    }

    /// Allows tests to access the default header directly.
    #[cfg(test)]
    pub fn header(&self) -> &Header {
        &self.default_header
    }

    fn get_message_buffer() -> [u8; MAX_MESSAGE_SIZE] {
        [0u8; MAX_MESSAGE_SIZE]
    }

    /// Get a timer future for a given type.
    pub fn get_timer(timer_type: TimerType) -> impl Future<Output = ()> {
        TimerType::get_timer::<TIMER>(timer_type)
    }

    /// Adopt the partner's revision when it is lower than ours.
    fn track_revision(&mut self, header: Header) -> Result<(), ParseError> {
        let partner = header.spec_revision()?;
        if partner < self.revision() {
            self.default_header = self.default_header.with_spec_revision(partner);
        }
        Ok(())
    }

    /// Receive a simple (non-chunked) message from the driver.
    ///
    /// Used by the GoodCRC wait to avoid recursing into chunk handling.
    async fn receive_simple(&mut self) -> Result<Message, RxError> {
        loop {
            let mut buffer = Self::get_message_buffer();

            let (sop, length) = match self.driver.receive(&mut buffer).await {
                Ok(x) => x,
                Err(DriverRxError::Discarded) => continue,
                Err(DriverRxError::HardReset) => return Err(RxError::HardReset),
            };

            let message = Message::from_bytes(&buffer[..length], sop)?;
            return Ok(message);
        }
    }

    /// Wait until a GoodCrc message is received on the given packet class,
    /// or a timeout occurs.
    async fn wait_for_good_crc(&mut self, sop: Sop) -> Result<(), RxError> {
        trace!("Wait for GoodCrc on {:?}", sop);

        let tx_counter = self.tx_message_id[sop.index()];
        let timeout_fut = Self::get_timer(TimerType::CRCReceive);
        // The receive side is polled first, so a frame that already arrived
        // beats an elapsed timer.
        let receive_fut = async {
            let message = self.receive_simple().await?;

            if message.sop == sop
                && matches!(
                    message.header.message_type(),
                    MessageType::Control(ControlMessageType::GoodCRC)
                )
            {
                trace!(
                    "Received GoodCrc, TX message count: {}, expected: {}",
                    message.header.message_id(),
                    tx_counter.value()
                );
                if message.header.message_id() == tx_counter.value() {
                    Ok(())
                } else {
                    Err(RxError::AcknowledgeMismatch(message.header.message_id()))
                }
            } else {
                Err(ParseError::InvalidControlMessageType(message.header.message_type_raw()).into())
            }
        };

        match select(receive_fut, timeout_fut).await {
            Either::First(receive_result) => {
                let receive_result = receive_result?;
                // The ID is only consumed by a matching acknowledgement.
                self.retry.reset();
                _ = self.tx_message_id[sop.index()].increment();
                Ok(receive_result)
            }
            Either::Second(_) => Err(RxError::ReceiveTimeout),
        }
    }

    async fn transmit_inner(&mut self, sop: Sop, buffer: &[u8]) -> Result<(), TxError> {
        loop {
            match self.driver.transmit(sop, buffer).await {
                Ok(_) => return Ok(()),
                Err(DriverTxError::HardReset) => return Err(TxError::HardReset),
                Err(DriverTxError::Discarded) => {
                    // Collision with a concurrent receive; retry.
                }
            }
        }
    }

    /// Transmit a raw frame and run the GoodCRC/retry discipline for it.
    async fn transmit_frame(&mut self, sop: Sop, buffer: &[u8]) -> Result<(), ProtocolError> {
        if DRIVER::HAS_AUTO_RETRY {
            // Hardware verifies GoodCRC reception and retries on its own.
            // Discarded here means all hardware retries are exhausted.
            match self.driver.transmit(sop, buffer).await {
                Ok(()) => {
                    self.retry.reset();
                    _ = self.tx_message_id[sop.index()].increment();
                    trace!("Transmit success (hardware retry)");
                    Ok(())
                }
                Err(DriverTxError::HardReset) => Err(TxError::HardReset.into()),
                Err(DriverTxError::Discarded) => Err(ProtocolError::TransmitRetriesExceeded(self.retry.max_value())),
            }
        } else {
            self.retry.reset();

            loop {
                self.transmit_inner(sop, buffer).await?;

                match self.wait_for_good_crc(sop).await {
                    Ok(()) => {
                        trace!("Transmit success");
                        return Ok(());
                    }
                    Err(RxError::ReceiveTimeout) => match self.retry.increment() {
                        Ok(_) => {
                            // Retry transmission until the counter is exceeded.
                        }
                        Err(CounterError::Exceeded) => {
                            return Err(ProtocolError::TransmitRetriesExceeded(self.retry.max_value()));
                        }
                    },
                    Err(other) => return Err(other.into()),
                }
            }
        }
    }

    /// Transmit a message.
    ///
    /// GoodCrc message transmission is handled separately, see
    /// `transmit_good_crc()`.
    pub async fn transmit(&mut self, message: Message) -> Result<(), ProtocolError> {
        debug_assert_ne!(
            message.header.message_type(),
            MessageType::Control(ControlMessageType::GoodCRC)
        );

        trace!("Transmit message: {:?}", message);

        let mut buffer = Self::get_message_buffer();
        let size = message.to_bytes(&mut buffer);

        self.transmit_frame(message.sop, &buffer[..size]).await
    }

    /// Send a GoodCrc message to the port partner.
    async fn transmit_good_crc(&mut self, sop: Sop) -> Result<(), ProtocolError> {
        // A message must have been received on this class before.
        let rx_counter = self.rx_message_id[sop.index()].unwrap_or(Counter::new(CounterType::MessageId));

        trace!("Transmit GoodCrc for RX message count: {}", rx_counter.value());

        let mut buffer = Self::get_message_buffer();
        let size = Message::new(Header::new_control(
            self.default_header,
            rx_counter,
            ControlMessageType::GoodCRC,
        ))
        .with_sop(sop)
        .to_bytes(&mut buffer);

        Ok(self.transmit_inner(sop, &buffer[..size]).await?)
    }

    /// Updates the received message counter for a packet class.
    ///
    /// If receiving the first message after a reset, its ID is copied.
    /// Otherwise an identical ID marks a retransmission.
    ///
    /// Returns `true` if this was a retransmission.
    fn update_rx_message_counter(&mut self, sop: Sop, message_id: u8) -> bool {
        match self.rx_message_id[sop.index()].as_mut() {
            None => {
                trace!("First message after reset, RX counter value: {}", message_id);
                self.rx_message_id[sop.index()] = Some(Counter::new_from_value(CounterType::MessageId, message_id));
                false
            }
            Some(counter) => {
                if message_id == counter.value() {
                    trace!("Received retransmission of RX counter value: {}", counter.value());
                    true
                } else {
                    counter.set(message_id);
                    false
                }
            }
        }
    }

    /// Acknowledge a received message and filter retransmissions.
    ///
    /// Returns `Ok(true)` if this was a retransmission which the caller
    /// should silently drop.
    async fn handle_rx_ack(&mut self, sop: Sop, header: Header) -> Result<bool, RxError> {
        let is_good_crc = matches!(
            header.message_type(),
            MessageType::Control(ControlMessageType::GoodCRC)
        );

        let is_retransmission = if is_good_crc {
            false
        } else {
            self.update_rx_message_counter(sop, header.message_id())
        };

        if !DRIVER::HAS_AUTO_GOOD_CRC && !is_good_crc {
            match self.transmit_good_crc(sop).await {
                Ok(()) => {}
                Err(ProtocolError::TxError(TxError::HardReset)) => return Err(RxError::HardReset),
                Err(_) => return Err(RxError::UnsupportedMessage),
            }
        }

        Ok(is_retransmission)
    }

    /// Whether a received message type is allowed under the active revision.
    fn revision_allows(&self, message_type: MessageType) -> bool {
        if self.revision() >= SpecificationRevision::R3_X {
            return true;
        }

        match message_type {
            MessageType::Control(control) => !control.requires_r3(),
            MessageType::Data(data) => !data.requires_r3(),
            // Only the 26-byte legacy form of a few extended messages exists
            // under PD 2.0; gate on size at chunk handling.
            MessageType::Extended(_) => true,
        }
    }

    /// Receive a message, assembling chunked extended messages as needed.
    async fn receive_message_inner(&mut self) -> Result<Message, RxError> {
        loop {
            let mut buffer = Self::get_message_buffer();

            let (sop, length) = match self.driver.receive(&mut buffer).await {
                Ok(x) => x,
                Err(DriverRxError::Discarded) => continue,
                Err(DriverRxError::HardReset) => return Err(RxError::HardReset),
            };

            let header = Header::from_bytes(&buffer[..MSG_HEADER_SIZE])?;
            let message_type = header.message_type();

            self.track_revision(header)?;

            if let MessageType::Extended(extended_type) = message_type {
                let ext_header = ExtendedHeader::from_bytes(&buffer[MSG_HEADER_SIZE..MSG_HEADER_SIZE + EXT_HEADER_SIZE]);

                if ext_header.chunked() {
                    let payload = &buffer[MSG_HEADER_SIZE + EXT_HEADER_SIZE..length];
                    let chunk_len = payload.len().min(MAX_EXTENDED_MSG_CHUNK_LEN);

                    trace!(
                        "Received chunked extended message {:?}, chunk {}, size {}",
                        message_type,
                        ext_header.chunk_number(),
                        ext_header.data_size()
                    );

                    if self.handle_rx_ack(sop, header).await? {
                        continue; // Retransmission
                    }

                    // Multi-chunk sequences do not exist below PD 3.0.
                    if self.revision() < SpecificationRevision::R3_X
                        && ext_header.data_size() as usize > MAX_EXTENDED_MSG_LEGACY_LEN
                    {
                        return Err(RxError::UnsupportedMessage);
                    }

                    let effective = (ext_header.data_size() as usize)
                        .saturating_sub(ext_header.chunk_number() as usize * MAX_EXTENDED_MSG_CHUNK_LEN)
                        .min(chunk_len);

                    match self
                        .chunk_assembler
                        .process_chunk(extended_type, ext_header, &payload[..effective])
                    {
                        Ok(ChunkResult::Complete(assembled)) => {
                            let payload = Extended::parse(extended_type, &assembled);
                            let mut message = Message::new(header).with_sop(sop);
                            message.payload = Some(Payload::Extended(payload));

                            trace!("Received assembled extended message {:?}", message);
                            return Ok(message);
                        }
                        Ok(ChunkResult::NeedMoreChunks(next_chunk)) => {
                            self.transmit_chunk_request(sop, extended_type, next_chunk).await?;
                            continue;
                        }
                        Ok(ChunkResult::ChunkRequested(chunk)) => {
                            // Stray chunk request outside a transmit sequence.
                            trace!("Unsolicited chunk request for chunk {}", chunk);
                            return Err(RxError::UnsupportedMessage);
                        }
                        Err(_) => return Err(RxError::UnsupportedMessage),
                    }
                }
            }

            // Non-extended, or unchunked extended messages.
            let message = Message::from_bytes(&buffer[..length], sop)?;

            match message.header.message_type() {
                MessageType::Control(ControlMessageType::Reserved) | MessageType::Data(DataMessageType::Reserved) => {
                    trace!("Unsupported message type in header: {:?}", message.header);
                    return Err(RxError::UnsupportedMessage);
                }
                MessageType::Control(ControlMessageType::SoftReset) => {
                    // Acknowledge, then surface to the policy engine.
                    _ = self.handle_rx_ack(sop, message.header).await?;
                    return Err(RxError::SoftReset(sop));
                }
                _ => (),
            }

            if self.handle_rx_ack(sop, message.header).await? {
                continue; // Retransmission
            }

            if !self.revision_allows(message.header.message_type()) {
                trace!("Message {:?} not allowed at {:?}", message.header, self.revision());
                return Err(RxError::UnsupportedMessage);
            }

            trace!("Received message {:?}", message);
            return Ok(message);
        }
    }

    /// Receive a message.
    pub async fn receive_message(&mut self) -> Result<Message, ProtocolError> {
        self.receive_message_inner().await.map_err(|err| err.into())
    }

    /// Wait until a message of one of the chosen types is received, or a
    /// timeout occurs.
    pub async fn receive_message_type(
        &mut self,
        message_types: &[MessageType],
        timer_type: TimerType,
    ) -> Result<Message, ProtocolError> {
        // GoodCrc reception is handled in `wait_for_good_crc()`.
        for message_type in message_types {
            debug_assert_ne!(*message_type, MessageType::Control(ControlMessageType::GoodCRC));
        }

        let timeout_fut = Self::get_timer(timer_type);
        let receive_fut = async {
            loop {
                match self.receive_message_inner().await {
                    Ok(message) => {
                        if matches!(
                            message.header.message_type(),
                            MessageType::Control(ControlMessageType::GoodCRC)
                        ) {
                            continue;
                        }
                        return if message_types.contains(&message.header.message_type()) {
                            Ok(message)
                        } else {
                            Err(ProtocolError::UnexpectedMessage)
                        };
                    }
                    Err(other) => return Err(other.into()),
                }
            }
        };

        match select(receive_fut, timeout_fut).await {
            Either::First(receive_result) => receive_result,
            Either::Second(_) => Err(RxError::ReceiveTimeout.into()),
        }
    }

    /// Perform a hard-reset procedure.
    pub async fn hard_reset(&mut self) -> Result<(), ProtocolError> {
        self.reset();

        loop {
            match self.driver.transmit_hard_reset().await {
                Ok(_) | Err(DriverTxError::HardReset) => break,
                Err(DriverTxError::Discarded) => (),
            }
        }

        trace!("Performed hard reset");
        Ok(())
    }

    /// Perform a cable-reset procedure on SOP'.
    pub async fn cable_reset(&mut self) -> Result<(), ProtocolError> {
        self.reset_sop(Sop::SopPrime);

        loop {
            match self.driver.transmit_cable_reset().await {
                Ok(_) | Err(DriverTxError::HardReset) => break,
                Err(DriverTxError::Discarded) => (),
            }
        }

        Ok(())
    }

    /// Drive the fast-role-swap wire signal.
    pub async fn signal_fast_role_swap(&mut self) {
        self.driver.signal_fast_role_swap().await
    }

    /// Wait for VBUS to be available.
    pub async fn wait_for_vbus(&mut self) {
        self.driver.wait_for_vbus().await
    }

    /// Wait for VBUS to reach vSafe0V.
    pub async fn wait_for_vbus_absent(&mut self) {
        self.driver.wait_for_vbus_absent().await
    }

    /// Wait for the source to provide its capabilities.
    pub async fn wait_for_source_capabilities(&mut self) -> Result<Message, ProtocolError> {
        self.receive_message_type(
            &[
                MessageType::Data(DataMessageType::SourceCapabilities),
                MessageType::Extended(ExtendedMessageType::EprSourceCapabilities),
            ],
            TimerType::SinkWaitCap,
        )
        .await
    }

    /// Transmit a control message of the provided type.
    pub async fn transmit_control_message(&mut self, message_type: ControlMessageType) -> Result<(), ProtocolError> {
        self.transmit_control_message_sop(Sop::Sop, message_type).await
    }

    /// Transmit a control message towards the given packet class.
    pub async fn transmit_control_message_sop(
        &mut self,
        sop: Sop,
        message_type: ControlMessageType,
    ) -> Result<(), ProtocolError> {
        let message = Message::new(Header::new_control(
            self.default_header,
            self.tx_message_id[sop.index()],
            message_type,
        ))
        .with_sop(sop);

        self.transmit(message).await
    }

    /// Transmit a data message.
    pub async fn transmit_data_message(
        &mut self,
        message_type: DataMessageType,
        data: Data,
    ) -> Result<(), ProtocolError> {
        let header = Header::new_data(
            self.default_header,
            self.tx_message_id[Sop::Sop.index()],
            message_type,
            data.num_objects(),
        );

        self.transmit(Message::new_with_data(header, data)).await
    }

    /// Transmit an extended message, chunking the payload as needed.
    ///
    /// The sender transmits chunk 0, then waits for a chunk request for each
    /// subsequent chunk with the ChunkSenderResponse timeout.
    pub async fn transmit_extended(
        &mut self,
        message_type: ExtendedMessageType,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        if self.revision() < SpecificationRevision::R3_X && payload.len() > MAX_EXTENDED_MSG_LEGACY_LEN {
            return Err(ProtocolError::ChunkSequenceAborted);
        }

        let sender = ChunkSender::new(payload);

        for chunk_number in 0..sender.total_chunks() {
            let (ext_header, chunk) = sender.chunk(chunk_number).expect("chunk within total count");

            self.transmit_extended_chunk(message_type, ext_header, chunk).await?;

            if chunk_number + 1 == sender.total_chunks() {
                break;
            }

            // Wait for the chunk request naming the next chunk.
            let timeout_fut = Self::get_timer(TimerType::ChunkSenderResponse);
            let request_fut = self.receive_chunk_request(message_type);

            match select(request_fut, timeout_fut).await {
                Either::First(Ok(requested)) if requested == chunk_number + 1 => {}
                Either::First(Ok(_)) => return Err(ProtocolError::ChunkSequenceAborted),
                Either::First(Err(err)) => return Err(err.into()),
                Either::Second(_) => return Err(ProtocolError::ChunkSequenceAborted),
            }
        }

        Ok(())
    }

    /// Wait for a chunk request of the given message type.
    async fn receive_chunk_request(&mut self, message_type: ExtendedMessageType) -> Result<u8, RxError> {
        loop {
            let mut buffer = Self::get_message_buffer();

            let (sop, length) = match self.driver.receive(&mut buffer).await {
                Ok(x) => x,
                Err(DriverRxError::Discarded) => continue,
                Err(DriverRxError::HardReset) => return Err(RxError::HardReset),
            };

            if length < MSG_HEADER_SIZE + EXT_HEADER_SIZE {
                continue;
            }

            let header = Header::from_bytes(&buffer[..MSG_HEADER_SIZE])?;

            if matches!(
                header.message_type(),
                MessageType::Control(ControlMessageType::GoodCRC)
            ) {
                continue;
            }

            let MessageType::Extended(received_type) = header.message_type() else {
                return Err(RxError::UnsupportedMessage);
            };

            let ext_header = ExtendedHeader::from_bytes(&buffer[MSG_HEADER_SIZE..]);

            if self.handle_rx_ack(sop, header).await? {
                continue;
            }

            if received_type == message_type && ext_header.request_chunk() {
                return Ok(ext_header.chunk_number());
            }

            return Err(RxError::UnsupportedMessage);
        }
    }

    /// Transmit one chunk of an extended message.
    async fn transmit_extended_chunk(
        &mut self,
        message_type: ExtendedMessageType,
        ext_header: ExtendedHeader,
        chunk: &[u8],
    ) -> Result<(), ProtocolError> {
        // Chunks carry their data objects rounded up to the 4-byte boundary.
        let num_objects = (EXT_HEADER_SIZE + chunk.len()).div_ceil(4) as u8;
        let header = Header::new_extended(
            self.default_header,
            self.tx_message_id[Sop::Sop.index()],
            message_type,
            num_objects,
        );

        let mut buffer = Self::get_message_buffer();
        let mut offset = header.to_bytes(&mut buffer);
        offset += ext_header.to_bytes(&mut buffer[offset..]);
        buffer[offset..offset + chunk.len()].copy_from_slice(chunk);
        offset += chunk.len();
        // Pad to the data object boundary; the buffer is zeroed.
        offset += (4 - (EXT_HEADER_SIZE + chunk.len()) % 4) % 4;

        self.transmit_frame(Sop::Sop, &buffer[..offset]).await
    }

    /// Transmit a chunk request naming the next expected chunk.
    async fn transmit_chunk_request(
        &mut self,
        sop: Sop,
        message_type: ExtendedMessageType,
        chunk_number: u8,
    ) -> Result<(), RxError> {
        trace!("Transmit chunk request for {:?} chunk {}", message_type, chunk_number);

        let ext_header = ChunkAssembler::chunk_request_header(chunk_number);
        let header = Header::new_extended(self.default_header, self.tx_message_id[sop.index()], message_type, 1);

        let mut buffer = Self::get_message_buffer();
        let mut offset = header.to_bytes(&mut buffer);
        offset += ext_header.to_bytes(&mut buffer[offset..]);
        // Pad the half-filled data object.
        offset += 2;

        match self.transmit_frame(sop, &buffer[..offset]).await {
            Ok(()) => Ok(()),
            Err(ProtocolError::TxError(TxError::HardReset)) => Err(RxError::HardReset),
            Err(_) => Err(RxError::ReceiveTimeout),
        }
    }

    /// Transmit an extended control message of the provided type.
    pub async fn transmit_extended_control_message(
        &mut self,
        message_type: ExtendedControlMessageType,
    ) -> Result<(), ProtocolError> {
        let control = ExtendedControl::default().with_message_type(message_type);

        let mut payload = [0u8; 2];
        control.to_bytes(&mut payload);

        self.transmit_extended(ExtendedMessageType::ExtendedControl, &payload).await
    }

    /// Transmit an EPR mode data message.
    pub async fn transmit_epr_mode(
        &mut self,
        action: message::data::epr_mode::Action,
        data: u8,
    ) -> Result<(), ProtocolError> {
        let mdo = message::data::epr_mode::EprModeDataObject::default()
            .with_action(action)
            .with_data(data);

        self.transmit_data_message(DataMessageType::EprMode, Data::EprMode(mdo)).await
    }

    /// Request a certain power level from the source.
    pub async fn request_power(&mut self, power_source_request: request::PowerSource) -> Result<(), ProtocolError> {
        // Only sinks can request from a supply.
        debug_assert!(matches!(self.default_header.port_power_role(), PowerRole::Sink));

        let message_type = power_source_request.message_type();
        self.transmit_data_message(message_type, Data::Request(power_source_request))
            .await
    }

    /// Transmit source capabilities.
    pub async fn transmit_source_capabilities(
        &mut self,
        capabilities: message::data::source_capabilities::SourceCapabilities,
    ) -> Result<(), ProtocolError> {
        self.transmit_data_message(
            DataMessageType::SourceCapabilities,
            Data::SourceCapabilities(capabilities),
        )
        .await
    }

    /// Transmit sink capabilities in response to Get_Sink_Cap.
    pub async fn transmit_sink_capabilities(
        &mut self,
        capabilities: message::data::sink_capabilities::SinkCapabilities,
    ) -> Result<(), ProtocolError> {
        self.transmit_data_message(DataMessageType::SinkCapabilities, Data::SinkCapabilities(capabilities))
            .await
    }

    /// Transmit EPR source capabilities as a chunked extended message.
    pub async fn transmit_epr_source_capabilities(
        &mut self,
        capabilities: &message::data::source_capabilities::SourceCapabilities,
    ) -> Result<(), ProtocolError> {
        let mut payload = [0u8; MAX_MESSAGE_SIZE];
        let size = capabilities.to_bytes(&mut payload);

        self.transmit_extended(ExtendedMessageType::EprSourceCapabilities, &payload[..size])
            .await
    }

    /// Transmit EPR sink capabilities in response to EPR_Get_Sink_Cap.
    pub async fn transmit_epr_sink_capabilities(
        &mut self,
        capabilities: message::data::sink_capabilities::SinkCapabilities,
    ) -> Result<(), ProtocolError> {
        let mut payload = [0u8; MAX_MESSAGE_SIZE];
        let size = capabilities.to_bytes(&mut payload);

        self.transmit_extended(ExtendedMessageType::EprSinkCapabilities, &payload[..size])
            .await
    }

    /// Transmit a vendor-defined message towards the given packet class.
    pub async fn transmit_vdm(
        &mut self,
        sop: Sop,
        vdm_header: message::data::vendor_defined::VdmHeader,
        objects: &[u32],
    ) -> Result<(), ProtocolError> {
        let mut vdos = heapless::Vec::new();
        for object in objects.iter().take(6) {
            _ = vdos.push(*object);
        }

        let data = Data::VendorDefined((vdm_header, vdos));
        let header = Header::new_data(
            self.default_header,
            self.tx_message_id[sop.index()],
            DataMessageType::VendorDefined,
            data.num_objects(),
        );

        self.transmit(Message::new_with_data(header, data).with_sop(sop)).await
    }
}

#[cfg(test)]
mod tests {
    use core::iter::zip;

    use super::ProtocolLayer;
    use super::message::data::Data;
    use super::message::data::source_capabilities::SourceCapabilities;
    use super::message::header::{ControlMessageType, Header, MessageType, SpecificationRevision};
    use super::message::{Message, Payload};
    use crate::counters::{Counter, CounterType};
    use crate::dummy::{DUMMY_CAPABILITIES, DummyDriver, DummyTimer, MAX_FRAME_SIZE, dummy_source_capabilities};
    use crate::{DataRole, PowerRole, Sop};

    fn get_protocol_layer() -> ProtocolLayer<DummyDriver<MAX_FRAME_SIZE>, DummyTimer> {
        ProtocolLayer::new(
            DummyDriver::new(),
            Header::new_template(DataRole::Ufp, PowerRole::Sink, SpecificationRevision::R3_X),
        )
    }

    #[tokio::test]
    async fn receives_source_capabilities() {
        let mut protocol_layer = get_protocol_layer();

        protocol_layer.driver().inject_received_data(Sop::Sop, &DUMMY_CAPABILITIES);
        let message = protocol_layer.receive_message().await.unwrap();

        let Some(Payload::Data(Data::SourceCapabilities(SourceCapabilities(caps)))) = message.payload else {
            panic!("expected source capabilities");
        };

        for (cap, expected) in zip(caps, dummy_source_capabilities()) {
            assert_eq!(cap, expected);
        }

        // The received message was acknowledged.
        let good_crc = protocol_layer.driver().probe_transmitted_message();
        assert!(matches!(
            good_crc.header.message_type(),
            MessageType::Control(ControlMessageType::GoodCRC)
        ));
        assert_eq!(good_crc.header.message_id(), 0); // ID from the fixture.
    }

    #[tokio::test]
    async fn duplicate_message_is_dropped_and_acknowledged() {
        let mut protocol_layer = get_protocol_layer();

        // The same frame twice: the duplicate must be re-acknowledged, and
        // only further traffic surfaces.
        protocol_layer.driver().inject_received_data(Sop::Sop, &DUMMY_CAPABILITIES);
        protocol_layer.driver().inject_received_data(Sop::Sop, &DUMMY_CAPABILITIES);

        let mut accept = [0u8; MAX_FRAME_SIZE];
        let size = Message::new(Header::new_control(
            *protocol_layer.header(),
            Counter::new_from_value(CounterType::MessageId, 4),
            ControlMessageType::Accept,
        ))
        .to_bytes(&mut accept);
        protocol_layer.driver().inject_received_data(Sop::Sop, &accept[..size]);

        let first = protocol_layer.receive_message().await.unwrap();
        assert!(matches!(first.payload, Some(Payload::Data(Data::SourceCapabilities(_)))));

        // The duplicate is skipped; the Accept is the next visible message.
        let second = protocol_layer.receive_message().await.unwrap();
        assert!(matches!(
            second.header.message_type(),
            MessageType::Control(ControlMessageType::Accept)
        ));

        // Three GoodCRCs went out: fixture, duplicate, Accept.
        for _ in 0..3 {
            let good_crc = protocol_layer.driver().probe_transmitted_message();
            assert!(matches!(
                good_crc.header.message_type(),
                MessageType::Control(ControlMessageType::GoodCRC)
            ));
        }
        assert!(!protocol_layer.driver().has_transmitted_data());
    }

    #[tokio::test]
    async fn transmit_increments_message_id_per_sop() {
        let mut protocol_layer = get_protocol_layer();

        // Acknowledge two transmissions on SOP.
        for expected_id in 0..2 {
            let mut buf = [0u8; MAX_FRAME_SIZE];
            let size = Message::new(Header::new_control(
                *protocol_layer.header(),
                Counter::new_from_value(CounterType::MessageId, expected_id),
                ControlMessageType::GoodCRC,
            ))
            .to_bytes(&mut buf);
            protocol_layer.driver().inject_received_data(Sop::Sop, &buf[..size]);

            protocol_layer
                .transmit_control_message(ControlMessageType::GetSourceCap)
                .await
                .unwrap();

            let sent = protocol_layer.driver().probe_transmitted_message();
            assert_eq!(sent.header.message_id(), expected_id);
        }
    }

    #[tokio::test]
    async fn soft_reset_resets_one_sop_only() {
        let mut protocol_layer = get_protocol_layer();

        protocol_layer.driver().inject_received_data(Sop::Sop, &DUMMY_CAPABILITIES);
        protocol_layer.receive_message().await.unwrap();

        // SOP' counters are untouched by a SOP soft reset.
        protocol_layer.reset_sop(Sop::Sop);

        protocol_layer.driver().inject_received_data(Sop::Sop, &DUMMY_CAPABILITIES);
        let message = protocol_layer.receive_message().await.unwrap();

        // After the reset, the same ID is accepted again (not a duplicate).
        assert!(matches!(
            message.payload,
            Some(Payload::Data(Data::SourceCapabilities(_)))
        ));
    }
}
