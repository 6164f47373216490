//! Policy engine for the source role.
use embassy_futures::select::{Either, Either3, select, select3};
use typec_pd_traits::{PdDriver, Sop};

use super::{EngineOutcome, Error};
use crate::config::{MAX_SPR_PDOS, PortConfig};
use crate::counters::{Counter, CounterType};
use crate::device_policy_manager::{
    ContractStatus, DevicePolicyManager, Disposition, Event, Request, RequestDisposition, RequestOutcome, SwapKind,
};
use crate::protocol_layer::message::data::bist::BistMode;
use crate::protocol_layer::message::data::epr_mode::{Action, DataEnterFailed};
use crate::protocol_layer::message::data::request::{PowerSource, RequestCheckError};
use crate::protocol_layer::message::data::source_capabilities::{Augmented, PowerDataObject, SourceCapabilities};
use crate::protocol_layer::message::data::vendor_defined::{
    CableIdentity, IdHeaderVdo, PassiveCableVdo, VdmCommand, VdmCommandType, VdmHeader, VdmHeaderStructured,
    VdmVersionMajor,
};
use crate::protocol_layer::message::data::{Data, request};
use crate::protocol_layer::message::extended::extended_control::ExtendedControlMessageType;
use crate::protocol_layer::message::extended::{Extended, ManufacturerInfo};
use crate::protocol_layer::message::header::{
    ControlMessageType, DataMessageType, ExtendedMessageType, Header, MessageType, SpecificationRevision,
};
use crate::protocol_layer::message::{Message, Payload};
use crate::protocol_layer::{ProtocolError, ProtocolLayer, RxError, TxError};
use crate::timers::{Timer, TimerType};
use crate::units::{ElectricCurrent, ElectricPotential};
use crate::{DataRole, PowerRole};

#[cfg(test)]
mod tests;

/// Power range of operation.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Spr,
    Epr,
}

/// Source policy engine states.
#[derive(Debug, Clone)]
enum State {
    /// Default state at startup: supply vSafe5V, reset protocol.
    Startup,
    /// Identify the cable marker on SOP'.
    CableDiscovery,
    /// Advertise capabilities and await a request.
    SendCapabilities,
    /// No GoodCRC for the advertisement; retry on the capability timer.
    Discovery,
    /// A request arrived and is validated against the advertisement.
    NegotiateCapability(request::PowerSource),
    /// Accepted; transition the supply and report PS_RDY.
    TransitionSupply(request::PowerSource),
    /// Explicit contract in place.
    Ready(request::PowerSource),
    /// No usable request; wait for the policy to change.
    WaitNewCapabilities,
    SendNotSupported(request::PowerSource),
    SendSoftReset,
    SoftReset(Sop),
    HardReset,
    TransitionToDefault,

    /// A swap request arrived from the partner.
    EvaluateSwap(SwapKind, request::PowerSource),
    /// The application asked for a swap.
    SendSwap(SwapKind, request::PowerSource),
    /// Accepted PR/FR swap: drop the supply and hand over.
    PrSwapTransitionOff(request::PowerSource),
    /// Accepted VConn swap.
    VconnSwap(request::PowerSource),

    /// The sink asked to enter EPR mode with the given operational PDP.
    EprEntryReceived(request::PowerSource, u8),

    /// Query the partner's sink capabilities.
    GetSinkCap(request::PowerSource),

    /// Ask the sink to reduce to its minimum operating current.
    GotoMin(request::PowerSource),

    // Test modes.
    BistCarrierMode(request::PowerSource),
    BistTestData,

    /// Initiate a Data_Reset sequence.
    SendDataReset(request::PowerSource),
    /// Data_Reset execution, DFP side.
    DataReset(request::PowerSource),
}

/// Implementation of the source policy engine.
#[derive(Debug)]
pub struct Source<DRIVER: PdDriver, TIMER: Timer, DPM: DevicePolicyManager> {
    config: PortConfig,
    device_policy_manager: DPM,
    protocol_layer: ProtocolLayer<DRIVER, TIMER>,
    state: State,
    mode: Mode,
    /// The capability set currently advertised (EPR positions included in
    /// EPR mode).
    advertised: SourceCapabilities,
    /// The active explicit contract, when one exists.
    contract: Option<request::PowerSource>,
    cable: CableIdentity,
    caps_counter: Counter,
    caps_unanswered: Counter,
    hard_reset_counter: Counter,
}

impl<DRIVER: PdDriver, TIMER: Timer, DPM: DevicePolicyManager> Source<DRIVER, TIMER, DPM> {
    fn new_protocol_layer(driver: DRIVER, revision: SpecificationRevision) -> ProtocolLayer<DRIVER, TIMER> {
        let header = Header::new_template(DataRole::Dfp, PowerRole::Source, revision);
        ProtocolLayer::new(driver, header)
    }

    /// Create a new source policy engine with a given `driver`.
    pub fn new(driver: DRIVER, device_policy_manager: DPM, config: PortConfig) -> Self {
        let revision = config.pd_revision;
        let advertised = SourceCapabilities::from_raw_pdos(config.enabled_source_pdos());

        Self {
            config,
            device_policy_manager,
            protocol_layer: Self::new_protocol_layer(driver, revision),
            state: State::Startup,
            mode: Mode::Spr,
            advertised,
            contract: None,
            cable: CableIdentity::default(),
            caps_counter: Counter::new(CounterType::Caps),
            caps_unanswered: Counter::new(CounterType::CapsNoResponse),
            hard_reset_counter: Counter::new(CounterType::HardReset),
        }
    }

    /// The advertisement in SPR mode: the configured SPR PDO set.
    fn spr_advertisement(&self) -> SourceCapabilities {
        SourceCapabilities::from_raw_pdos(self.config.enabled_source_pdos())
    }

    /// The advertisement in EPR mode: SPR PDOs padded to position 7, EPR
    /// PDOs from position 8.
    fn epr_advertisement(&self) -> SourceCapabilities {
        let spr: heapless::Vec<u32, MAX_SPR_PDOS> = self.config.enabled_source_pdos().collect();
        let padding = MAX_SPR_PDOS - spr.len();

        SourceCapabilities::from_raw_pdos(
            spr.iter()
                .copied()
                .chain(core::iter::repeat_n(0u32, padding))
                .chain(self.config.enabled_epr_source_pdos()),
        )
    }

    /// The supply settings a validated request resolves to.
    fn supply_for_request(&self, power_source: &request::PowerSource) -> (ElectricPotential, ElectricCurrent) {
        use uom::si::electric_current::milliampere;
        use uom::si::electric_potential::volt;

        let fallback = (
            ElectricPotential::new::<volt>(5),
            ElectricCurrent::new::<milliampere>(900),
        );

        let Some(pdo) = self.advertised.at_object_position(power_source.object_position()) else {
            return fallback;
        };

        match (power_source, pdo) {
            (request::PowerSource::FixedVariableSupply(rdo), PowerDataObject::FixedSupply(supply)) => {
                (supply.voltage(), rdo.operating_current())
            }
            (request::PowerSource::FixedVariableSupply(rdo), PowerDataObject::VariableSupply(supply)) => {
                (supply.max_voltage(), rdo.operating_current())
            }
            (request::PowerSource::Pps(rdo), _) => (rdo.output_voltage(), rdo.operating_current()),
            (request::PowerSource::Avs(rdo), _) => (rdo.output_voltage(), rdo.operating_current()),
            (request::PowerSource::EprRequest(epr), _) => match epr.pdo {
                PowerDataObject::FixedSupply(fixed) => (
                    fixed.voltage(),
                    request::FixedVariableSupply(epr.rdo).operating_current(),
                ),
                PowerDataObject::Augmented(Augmented::Epr(avs)) => (
                    avs.max_voltage(),
                    request::Avs(epr.rdo).operating_current(),
                ),
                _ => fallback,
            },
            _ => fallback,
        }
    }

    /// Run a single step in the policy engine state machine.
    async fn run_step(&mut self) -> Result<Option<EngineOutcome>, Error> {
        let result = self.update_state().await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(Error::Protocol(protocol_error)) => {
                let new_state = match (&self.state, protocol_error) {
                    (_, ProtocolError::RxError(RxError::HardReset) | ProtocolError::TxError(TxError::HardReset)) => {
                        self.device_policy_manager.notify(Event::HardResetReceived).await;
                        Some(State::TransitionToDefault)
                    }
                    (_, ProtocolError::RxError(RxError::SoftReset(sop))) => Some(State::SoftReset(sop)),

                    // The advertisement going unacknowledged means the
                    // partner may not speak PD at all.
                    (State::SendCapabilities, ProtocolError::TransmitRetriesExceeded(_)) => Some(State::Discovery),

                    // No request after an acknowledged advertisement.
                    (State::SendCapabilities, ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                        self.device_policy_manager.notify(Event::SenderResponseTimeout).await;
                        Some(State::HardReset)
                    }

                    (State::SoftReset(_) | State::SendSoftReset, ProtocolError::TransmitRetriesExceeded(_)) => {
                        Some(State::HardReset)
                    }

                    // Failure while transitioning the supply: the contract
                    // cannot be honoured.
                    (State::TransitionSupply(_), _) => {
                        self.device_policy_manager
                            .notify(Event::ContractNegotiationComplete(ContractStatus::PsRdyNotSent))
                            .await;
                        Some(State::HardReset)
                    }

                    (State::PrSwapTransitionOff(_), _) => Some(State::HardReset),

                    (State::VconnSwap(_), ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                        self.device_policy_manager.notify(Event::VconnSwapFailed).await;
                        Some(State::SendSoftReset)
                    }

                    // Cable discovery failures are tolerated; run without
                    // cable identity.
                    (State::CableDiscovery, _) => Some(State::SendCapabilities),

                    (_, ProtocolError::UnexpectedMessage) => Some(State::SendSoftReset),

                    (State::Ready(power_source), ProtocolError::RxError(RxError::UnsupportedMessage)) => {
                        Some(State::SendNotSupported(*power_source))
                    }

                    (_, ProtocolError::TransmitRetriesExceeded(_)) => Some(State::SendSoftReset),

                    (_, error) => {
                        error!("Protocol error {:?} in source state transition", error);
                        None
                    }
                };

                if let Some(state) = new_state {
                    self.state = state
                }

                Ok(None)
            }
            Err(error) => {
                error!("Unrecoverable error {:?} in source state transition", error);
                Err(error)
            }
        }
    }

    /// Run the source's state machine continuously.
    ///
    /// Returns when the role changes, when the partner turns out not to
    /// speak PD, or with an unrecoverable error.
    pub async fn run(&mut self) -> Result<EngineOutcome, Error> {
        loop {
            if let Some(outcome) = self.run_step().await? {
                return Ok(outcome);
            }
        }
    }

    /// Answer a Get_Manufacturer_Info request from the configuration.
    async fn give_manufacturer_info(&mut self) -> Result<(), ProtocolError> {
        let mut info = ManufacturerInfo {
            vid: self.config.vid,
            pid: self.config.pid,
            string: heapless::Vec::new(),
        };

        let name_len = (self.config.mfg_info_len as usize).saturating_sub(4).min(22);
        _ = info
            .string
            .extend_from_slice(&self.config.mfg_name[..name_len.min(self.config.mfg_name.len())]);

        let mut payload = [0u8; 32];
        let size = info.to_bytes(&mut payload);

        self.protocol_layer
            .transmit_extended(ExtendedMessageType::ManufacturerInfo, &payload[..size])
            .await
    }

    /// Answer a vendor-defined message through the application hook.
    async fn handle_vdm(&mut self, header: &VdmHeader, objects: &[u32]) -> Result<(), ProtocolError> {
        if let Some(response) = self.device_policy_manager.handle_vdm(header, objects).await {
            if let Some((&response_header, vdos)) = response.split_first() {
                self.protocol_layer
                    .transmit_vdm(Sop::Sop, VdmHeader::from(response_header), vdos)
                    .await?;
            }
            return Ok(());
        }

        if let VdmHeader::Structured(structured) = header {
            if structured.command_type() == VdmCommandType::InitiatorReq
                && self.protocol_layer.revision() >= SpecificationRevision::R3_X
            {
                let nak = structured.with_command_type(VdmCommandType::ResponderNak);
                self.protocol_layer
                    .transmit_vdm(Sop::Sop, VdmHeader::Structured(nak), &[])
                    .await?;
            }
        }

        Ok(())
    }

    /// Check the gates for EPR mode entry, reporting the first failure.
    async fn epr_entry_gate(&mut self, power_source: &request::PowerSource, pdp: u8) -> Option<DataEnterFailed> {
        let rdo_capable = match power_source {
            request::PowerSource::FixedVariableSupply(rdo) => rdo.epr_mode_capable(),
            request::PowerSource::Pps(rdo) => rdo.epr_mode_capable(),
            _ => false,
        };
        if !rdo_capable {
            return Some(DataEnterFailed::EprCapableBitNotSetInRdo);
        }

        if !self.advertised.epr_mode_capable() || !self.config.epr_capable(PowerRole::Source) {
            return Some(DataEnterFailed::EprCapableBitNotSetInPdo);
        }

        if !self.cable.epr_capable() {
            return Some(DataEnterFailed::CableNotEprCapable);
        }

        if !self.device_policy_manager.vconn_is_present().await {
            return Some(DataEnterFailed::SourceFailedToBecomeVconnSource);
        }

        let pdp = crate::units::Power::new::<uom::si::power::watt>(pdp as u32);
        if !self.device_policy_manager.evaluate_epr_entry(pdp).await {
            return Some(DataEnterFailed::SourceUnableToEnterEprMode);
        }

        None
    }

    /// Handle a message received in the Ready state, returning the next
    /// state.
    async fn handle_ready_message(
        &mut self,
        message: Message,
        power_source: request::PowerSource,
    ) -> Result<State, Error> {
        Ok(match message.header.message_type() {
            MessageType::Data(DataMessageType::Request) | MessageType::Data(DataMessageType::EprRequest) => {
                let Some(Payload::Data(Data::Request(received))) = message.payload else {
                    return Err(Error::Protocol(ProtocolError::UnexpectedMessage));
                };
                State::NegotiateCapability(received)
            }
            MessageType::Control(ControlMessageType::GetSourceCap) => {
                // Get_Source_Cap always queries the SPR advertisement.
                self.protocol_layer
                    .transmit_source_capabilities(self.spr_advertisement())
                    .await?;
                State::Ready(power_source)
            }
            MessageType::Control(ControlMessageType::GetSinkCap) => {
                // A dual-role port reports the power it can sink.
                if self.config.enabled_sink_pdos().next().is_some() {
                    let caps = self.device_policy_manager.sink_capabilities().await;
                    self.protocol_layer.transmit_sink_capabilities(caps).await?;
                    State::Ready(power_source)
                } else {
                    State::SendNotSupported(power_source)
                }
            }
            MessageType::Control(ControlMessageType::GetSourceInfo) => {
                self.protocol_layer
                    .transmit_data_message(DataMessageType::SourceInfo, Data::SourceInfo(self.config.get_source_info))
                    .await?;
                State::Ready(power_source)
            }
            MessageType::Control(ControlMessageType::GetRevision) => {
                self.protocol_layer
                    .transmit_data_message(DataMessageType::Revision, Data::Revision(self.config.get_revision))
                    .await?;
                State::Ready(power_source)
            }
            MessageType::Control(ControlMessageType::GetSourceCapExtended) => match self.config.ext_src_cap {
                Some(cap) => {
                    self.protocol_layer
                        .transmit_extended(ExtendedMessageType::SourceCapabilitiesExtended, &cap)
                        .await?;
                    State::Ready(power_source)
                }
                None => State::SendNotSupported(power_source),
            },
            MessageType::Control(ControlMessageType::DrSwap) => State::EvaluateSwap(SwapKind::Data, power_source),
            MessageType::Control(ControlMessageType::PrSwap) => State::EvaluateSwap(SwapKind::Power, power_source),
            MessageType::Control(ControlMessageType::VconnSwap) => State::EvaluateSwap(SwapKind::Vconn, power_source),
            MessageType::Control(ControlMessageType::FrSwap) => State::EvaluateSwap(SwapKind::FastRole, power_source),
            MessageType::Control(ControlMessageType::Ping) => State::Ready(power_source),
            MessageType::Control(ControlMessageType::DataReset) => {
                self.device_policy_manager.notify(Event::DataResetReceived).await;
                self.protocol_layer
                    .transmit_control_message(ControlMessageType::Accept)
                    .await?;
                State::DataReset(power_source)
            }
            MessageType::Data(DataMessageType::EprMode) => {
                let Some(Payload::Data(Data::EprMode(epr_mode))) = message.payload else {
                    return Err(Error::Protocol(ProtocolError::UnexpectedMessage));
                };

                match epr_mode.action() {
                    Action::Enter => {
                        self.device_policy_manager.notify(Event::EprModeEnterReceived).await;
                        State::EprEntryReceived(power_source, epr_mode.data())
                    }
                    Action::Exit => {
                        self.mode = Mode::Spr;
                        self.advertised = self.spr_advertisement();
                        self.device_policy_manager.notify(Event::EprModeExited).await;
                        State::SendCapabilities
                    }
                    _ => State::SendSoftReset,
                }
            }
            MessageType::Data(DataMessageType::Alert) => {
                if let Some(Payload::Data(Data::Alert(alert))) = message.payload {
                    self.device_policy_manager.notify(Event::AlertReceived(alert)).await;
                }
                State::Ready(power_source)
            }
            MessageType::Data(DataMessageType::Bist) => {
                let Some(Payload::Data(Data::Bist(bist))) = message.payload else {
                    return Err(Error::Protocol(ProtocolError::UnexpectedMessage));
                };

                match bist.mode() {
                    BistMode::CarrierMode2 if power_source.object_position() <= 1 => {
                        self.device_policy_manager
                            .notify(Event::BistEntered(BistMode::CarrierMode2))
                            .await;
                        State::BistCarrierMode(power_source)
                    }
                    BistMode::TestData if power_source.object_position() <= 1 => {
                        self.device_policy_manager
                            .notify(Event::BistEntered(BistMode::TestData))
                            .await;
                        State::BistTestData
                    }
                    BistMode::SharedTestModeEntry | BistMode::SharedTestModeExit if self.config.bist_stm_enabled => {
                        self.device_policy_manager.notify(Event::BistEntered(bist.mode())).await;
                        State::Ready(power_source)
                    }
                    _ => State::SendNotSupported(power_source),
                }
            }
            MessageType::Data(DataMessageType::VendorDefined) => {
                if let Some(Payload::Data(Data::VendorDefined((vdm_header, objects)))) = message.payload {
                    self.handle_vdm(&vdm_header, &objects).await?;
                }
                State::Ready(power_source)
            }
            MessageType::Extended(ExtendedMessageType::ExtendedControl) => {
                let Some(Payload::Extended(Extended::ExtendedControl(ctrl))) = &message.payload else {
                    return Ok(State::SendNotSupported(power_source));
                };

                match ctrl.message_type() {
                    ExtendedControlMessageType::EprGetSourceCap if self.mode == Mode::Epr => {
                        let advertisement = self.epr_advertisement();
                        self.protocol_layer
                            .transmit_epr_source_capabilities(&advertisement)
                            .await?;
                        State::Ready(power_source)
                    }
                    ExtendedControlMessageType::EprKeepAlive => {
                        self.protocol_layer
                            .transmit_extended_control_message(ExtendedControlMessageType::EprKeepAliveAck)
                            .await?;
                        State::Ready(power_source)
                    }
                    _ => State::SendNotSupported(power_source),
                }
            }
            MessageType::Extended(ExtendedMessageType::GetManufacturerInfo) => {
                self.give_manufacturer_info().await?;
                State::Ready(power_source)
            }
            _ => State::SendNotSupported(power_source),
        })
    }

    /// Map an application request onto the next state.
    async fn handle_request(&mut self, request: Request, power_source: request::PowerSource) -> State {
        match request {
            Request::GetSinkCapabilities => State::GetSinkCap(power_source),
            Request::CapabilitiesChanged(capabilities) => {
                self.advertised = capabilities;
                State::SendCapabilities
            }
            Request::GotoMin => State::GotoMin(power_source),
            Request::PrSwap => State::SendSwap(SwapKind::Power, power_source),
            Request::DrSwap => State::SendSwap(SwapKind::Data, power_source),
            Request::VconnSwap => State::SendSwap(SwapKind::Vconn, power_source),
            Request::ExitEprMode if self.mode == Mode::Epr => {
                self.mode = Mode::Spr;
                match self.protocol_layer.transmit_epr_mode(Action::Exit, 0).await {
                    Ok(()) => {
                        self.advertised = self.spr_advertisement();
                        self.device_policy_manager.notify(Event::EprModeExited).await;
                        State::SendCapabilities
                    }
                    Err(_) => State::SendSoftReset,
                }
            }
            Request::HardReset => State::HardReset,
            Request::SoftReset => State::SendSoftReset,
            Request::DataReset => State::SendDataReset(power_source),
            Request::None => State::Ready(power_source),
            _ => {
                trace!("Request not possible as source");
                self.device_policy_manager
                    .notify(Event::RequestComplete(RequestOutcome::Failed))
                    .await;
                State::Ready(power_source)
            }
        }
    }

    async fn update_state(&mut self) -> Result<Option<EngineOutcome>, Error> {
        let new_state = match &self.state {
            State::Startup => {
                use uom::si::electric_current::milliampere;
                use uom::si::electric_potential::volt;

                self.protocol_layer.reset();
                self.mode = Mode::Spr;
                self.contract = None;
                self.advertised = self.spr_advertisement();

                self.device_policy_manager
                    .psrc_enable(
                        ElectricPotential::new::<volt>(5),
                        ElectricCurrent::new::<milliampere>(900),
                    )
                    .await;

                if self.config.cable_discovery_enabled && self.cable.id_header.is_none() {
                    State::CableDiscovery
                } else {
                    State::SendCapabilities
                }
            }
            State::CableDiscovery => {
                let version = if self.protocol_layer.revision() >= SpecificationRevision::R3_X {
                    VdmVersionMajor::Version2x
                } else {
                    VdmVersionMajor::Version10
                };

                let mut discovered = false;
                let mut attempts = Counter::new(CounterType::DiscoverIdentity);

                while (attempts.value() as usize) < self.config.cable_discovery_count.max(1) as usize {
                    if attempts.increment().is_err() {
                        break;
                    }

                    let request_header = VdmHeaderStructured::discover_identity(version);
                    if self
                        .protocol_layer
                        .transmit_vdm(Sop::SopPrime, VdmHeader::Structured(request_header), &[])
                        .await
                        .is_err()
                    {
                        // The marker did not acknowledge; space the retries.
                        TimerType::get_timer::<TIMER>(TimerType::CableDiscovery).await;
                        continue;
                    }

                    let response = self
                        .protocol_layer
                        .receive_message_type(
                            &[MessageType::Data(DataMessageType::VendorDefined)],
                            self.protocol_layer.sender_response_timer(),
                        )
                        .await;

                    let Ok(message) = response else {
                        TimerType::get_timer::<TIMER>(TimerType::CableDiscovery).await;
                        continue;
                    };

                    if let Some(Payload::Data(Data::VendorDefined((VdmHeader::Structured(vdm), objects)))) =
                        message.payload
                    {
                        if vdm.command() == VdmCommand::DiscoverIdentity
                            && vdm.command_type() == VdmCommandType::ResponderAck
                        {
                            self.cable = CableIdentity {
                                id_header: objects.first().map(|raw| IdHeaderVdo(*raw)),
                                cable_vdo: objects.get(3).map(|raw| PassiveCableVdo(*raw)),
                            };
                            self.device_policy_manager
                                .notify(Event::CableDetected(self.cable))
                                .await;
                            discovered = true;
                            break;
                        }
                    }
                }

                if !discovered {
                    trace!("Cable discovery yielded no identity");
                }

                State::SendCapabilities
            }
            State::SendCapabilities => {
                if self.caps_counter.increment().is_err() {
                    // The partner ignored fifty advertisements; stop trying.
                    self.device_policy_manager
                        .notify(Event::SourceCapabilitiesUnanswered)
                        .await;
                    return Ok(Some(EngineOutcome::NonPdPartner));
                }

                match self.mode {
                    Mode::Spr => {
                        self.protocol_layer
                            .transmit_source_capabilities(self.advertised.clone())
                            .await?
                    }
                    Mode::Epr => {
                        let advertisement = self.advertised.clone();
                        self.protocol_layer
                            .transmit_epr_source_capabilities(&advertisement)
                            .await?
                    }
                }

                // The advertisement was acknowledged: the partner speaks PD.
                self.caps_unanswered.reset();
                self.hard_reset_counter.reset();

                let message = self
                    .protocol_layer
                    .receive_message_type(
                        &[
                            MessageType::Data(DataMessageType::Request),
                            MessageType::Data(DataMessageType::EprRequest),
                        ],
                        self.protocol_layer.sender_response_timer(),
                    )
                    .await?;

                let Some(Payload::Data(Data::Request(received))) = message.payload else {
                    return Err(Error::Protocol(ProtocolError::UnexpectedMessage));
                };

                State::NegotiateCapability(received)
            }
            State::Discovery => {
                // The advertisement went out without a GoodCRC.
                _ = self.caps_unanswered.increment();
                if self.caps_unanswered.value() >= self.caps_unanswered.max_value() {
                    self.device_policy_manager
                        .notify(Event::SourceCapabilitiesUnanswered)
                        .await;
                    return Ok(Some(EngineOutcome::NonPdPartner));
                }

                TimerType::get_timer::<TIMER>(TimerType::SourceCapability).await;
                State::SendCapabilities
            }
            State::NegotiateCapability(received) => {
                // Type the raw request against the advertisement, then check
                // it against what was actually offered.
                let typed = match received {
                    request::PowerSource::Unknown(raw) => PowerSource::interpret(*raw, &self.advertised),
                    other => *other,
                };

                match typed.validate(&self.advertised) {
                    Err(RequestCheckError::EprMirrorMismatch) => {
                        // The mirrored PDO disagrees with the advertisement.
                        State::HardReset
                    }
                    Err(error) => {
                        trace!("Rejecting request: {:?}", error);
                        self.protocol_layer
                            .transmit_control_message(ControlMessageType::Reject)
                            .await?;

                        match self.contract {
                            Some(contract) => {
                                self.device_policy_manager
                                    .notify(Event::ContractNegotiationComplete(
                                        ContractStatus::RejectedWithValidContract,
                                    ))
                                    .await;
                                State::Ready(contract)
                            }
                            None => {
                                self.device_policy_manager
                                    .notify(Event::ContractNegotiationComplete(ContractStatus::RejectedNoContract))
                                    .await;
                                State::WaitNewCapabilities
                            }
                        }
                    }
                    Ok(()) => match self.device_policy_manager.evaluate_request(&typed).await {
                        RequestDisposition::Accept => State::TransitionSupply(typed),
                        RequestDisposition::Wait => {
                            self.protocol_layer
                                .transmit_control_message(ControlMessageType::Wait)
                                .await?;
                            match self.contract {
                                Some(contract) => State::Ready(contract),
                                None => State::WaitNewCapabilities,
                            }
                        }
                        RequestDisposition::Reject => {
                            self.protocol_layer
                                .transmit_control_message(ControlMessageType::Reject)
                                .await?;
                            match self.contract {
                                Some(contract) => State::Ready(contract),
                                None => State::WaitNewCapabilities,
                            }
                        }
                    },
                }
            }
            State::TransitionSupply(power_source) => {
                let power_source = *power_source;
                self.protocol_layer
                    .transmit_control_message(ControlMessageType::Accept)
                    .await?;

                let (voltage, current) = self.supply_for_request(&power_source);
                self.device_policy_manager.psrc_enable(voltage, current).await;

                // Let the supply settle before reporting readiness.
                TimerType::get_timer::<TIMER>(match self.mode {
                    Mode::Spr => TimerType::SourceReady,
                    Mode::Epr => TimerType::SourceTransitionEpr,
                })
                .await;

                self.protocol_layer
                    .transmit_control_message(ControlMessageType::PsRdy)
                    .await?;

                self.contract = Some(power_source);

                let status = match power_source {
                    request::PowerSource::FixedVariableSupply(rdo) if rdo.capability_mismatch() => {
                        ContractStatus::CapabilityMismatch
                    }
                    _ => ContractStatus::Successful,
                };
                self.device_policy_manager
                    .notify(Event::ContractNegotiationComplete(status))
                    .await;

                State::Ready(power_source)
            }
            State::Ready(power_source) => {
                let power_source = *power_source;

                let receive_fut = self.protocol_layer.receive_message();
                let request_fut = self.device_policy_manager.get_request(&self.advertised);
                let mode = self.mode;
                let keep_alive_window_fut = async {
                    match mode {
                        // A source that misses the sink's keep-alive traffic
                        // must exit EPR via hard reset.
                        Mode::Epr => TimerType::get_timer::<TIMER>(TimerType::SourceEPRKeepAlive).await,
                        Mode::Spr => core::future::pending().await,
                    }
                };

                match select3(receive_fut, request_fut, keep_alive_window_fut).await {
                    Either3::First(message) => self.handle_ready_message(message?, power_source).await?,
                    Either3::Second(request) => self.handle_request(request, power_source).await,
                    Either3::Third(_) => {
                        warn!("EPR keep-alive window elapsed without traffic");
                        State::HardReset
                    }
                }
            }
            State::WaitNewCapabilities => {
                // Hold until the policy produces a new advertisement or the
                // partner asks again.
                let receive_fut = self.protocol_layer.receive_message();
                let request_fut = self.device_policy_manager.get_request(&self.advertised);

                match select(receive_fut, request_fut).await {
                    Either::First(message) => {
                        let message = message?;
                        match message.header.message_type() {
                            MessageType::Control(ControlMessageType::GetSourceCap) => State::SendCapabilities,
                            MessageType::Data(DataMessageType::Request)
                            | MessageType::Data(DataMessageType::EprRequest) => {
                                let Some(Payload::Data(Data::Request(received))) = message.payload else {
                                    return Err(Error::Protocol(ProtocolError::UnexpectedMessage));
                                };
                                State::NegotiateCapability(received)
                            }
                            _ => State::WaitNewCapabilities,
                        }
                    }
                    Either::Second(request) => match request {
                        Request::CapabilitiesChanged(capabilities) => {
                            self.advertised = capabilities;
                            State::SendCapabilities
                        }
                        Request::HardReset => State::HardReset,
                        _ => State::WaitNewCapabilities,
                    },
                }
            }
            State::SendNotSupported(power_source) => {
                let power_source = *power_source;
                if self.protocol_layer.revision() >= SpecificationRevision::R3_X {
                    self.protocol_layer
                        .transmit_control_message(ControlMessageType::NotSupported)
                        .await?;
                }

                State::Ready(power_source)
            }
            State::SendSoftReset => {
                self.protocol_layer.reset_sop(Sop::Sop);

                self.protocol_layer
                    .transmit_control_message(ControlMessageType::SoftReset)
                    .await?;
                self.device_policy_manager.notify(Event::SoftResetSent).await;

                self.protocol_layer
                    .receive_message_type(
                        &[MessageType::Control(ControlMessageType::Accept)],
                        self.protocol_layer.sender_response_timer(),
                    )
                    .await?;

                State::SendCapabilities
            }
            State::SoftReset(sop) => {
                let sop = *sop;
                self.device_policy_manager.notify(Event::SoftResetReceived).await;
                self.protocol_layer
                    .transmit_control_message_sop(sop, ControlMessageType::Accept)
                    .await?;

                self.protocol_layer.reset_sop(sop);

                State::SendCapabilities
            }
            State::HardReset => {
                if self.hard_reset_counter.increment().is_err() {
                    return Err(Error::PortPartnerUnresponsive);
                }

                self.protocol_layer.hard_reset().await?;
                self.device_policy_manager.notify(Event::HardResetSent).await;

                State::TransitionToDefault
            }
            State::TransitionToDefault => {
                // Drop VBUS and VConn, hold vSafe0V over the recovery time,
                // then restore the default supply.
                use uom::si::electric_current::milliampere;
                use uom::si::electric_potential::volt;

                let was_epr = self.mode == Mode::Epr;

                self.device_policy_manager.psrc_disable().await;
                self.device_policy_manager.set_vconn(false).await;

                TimerType::get_timer::<TIMER>(TimerType::PSHardReset).await;
                TimerType::get_timer::<TIMER>(match was_epr {
                    true => TimerType::SourceRecoverEpr,
                    false => TimerType::SourceRecover,
                })
                .await;

                self.device_policy_manager
                    .psrc_enable(
                        ElectricPotential::new::<volt>(5),
                        ElectricCurrent::new::<milliampere>(900),
                    )
                    .await;
                self.device_policy_manager.set_vconn(true).await;

                TimerType::get_timer::<TIMER>(match was_epr {
                    true => TimerType::VBusOnEpr,
                    false => TimerType::VBusOn,
                })
                .await;

                self.mode = Mode::Spr;
                self.contract = None;
                self.protocol_layer.reset();
                self.device_policy_manager.notify(Event::HardResetComplete).await;

                State::Startup
            }
            State::EvaluateSwap(kind, power_source) => {
                let kind = *kind;
                let power_source = *power_source;

                let disposition = self.device_policy_manager.evaluate_swap(kind).await;

                match disposition {
                    Disposition::NotSupported => State::SendNotSupported(power_source),
                    Disposition::Reject => {
                        self.protocol_layer
                            .transmit_control_message(ControlMessageType::Reject)
                            .await?;
                        State::Ready(power_source)
                    }
                    Disposition::Wait => {
                        self.protocol_layer
                            .transmit_control_message(ControlMessageType::Wait)
                            .await?;
                        State::Ready(power_source)
                    }
                    Disposition::Accept => {
                        self.protocol_layer
                            .transmit_control_message(ControlMessageType::Accept)
                            .await?;

                        match kind {
                            SwapKind::Data => {
                                let new_role = DataRole::Ufp;
                                self.protocol_layer.set_data_role(new_role);
                                self.device_policy_manager.notify(Event::DataRoleSwapped(new_role)).await;
                                State::Ready(power_source)
                            }
                            SwapKind::Vconn => State::VconnSwap(power_source),
                            SwapKind::Power | SwapKind::FastRole => State::PrSwapTransitionOff(power_source),
                        }
                    }
                }
            }
            State::SendSwap(kind, power_source) => {
                let kind = *kind;
                let power_source = *power_source;

                let message_type = match kind {
                    SwapKind::Power => ControlMessageType::PrSwap,
                    SwapKind::Data => ControlMessageType::DrSwap,
                    SwapKind::Vconn => ControlMessageType::VconnSwap,
                    SwapKind::FastRole => ControlMessageType::FrSwap,
                };

                self.protocol_layer.transmit_control_message(message_type).await?;

                let response = self
                    .protocol_layer
                    .receive_message_type(
                        &[
                            MessageType::Control(ControlMessageType::Accept),
                            MessageType::Control(ControlMessageType::Reject),
                            MessageType::Control(ControlMessageType::Wait),
                            MessageType::Control(ControlMessageType::NotSupported),
                        ],
                        self.protocol_layer.sender_response_timer(),
                    )
                    .await?;

                match response.header.message_type() {
                    MessageType::Control(ControlMessageType::Accept) => match kind {
                        SwapKind::Data => {
                            let new_role = DataRole::Ufp;
                            self.protocol_layer.set_data_role(new_role);
                            self.device_policy_manager.notify(Event::DataRoleSwapped(new_role)).await;
                            State::Ready(power_source)
                        }
                        SwapKind::Vconn => State::VconnSwap(power_source),
                        SwapKind::Power | SwapKind::FastRole => State::PrSwapTransitionOff(power_source),
                    },
                    _ => {
                        self.device_policy_manager
                            .notify(Event::RequestComplete(RequestOutcome::ResponseReceived))
                            .await;
                        State::Ready(power_source)
                    }
                }
            }
            State::PrSwapTransitionOff(_) => {
                // Reach vSafe0V, report it, and wait for the new source to
                // report readiness in turn.
                self.device_policy_manager.psrc_disable().await;
                self.protocol_layer.wait_for_vbus_absent().await;

                self.protocol_layer
                    .transmit_control_message(ControlMessageType::PsRdy)
                    .await?;

                self.protocol_layer.set_power_role(PowerRole::Sink);

                self.protocol_layer
                    .receive_message_type(
                        &[MessageType::Control(ControlMessageType::PsRdy)],
                        TimerType::PSSourceOn,
                    )
                    .await?;

                self.device_policy_manager
                    .notify(Event::PowerRoleSwapped(PowerRole::Sink))
                    .await;

                return Ok(Some(EngineOutcome::PowerRoleSwapped));
            }
            State::VconnSwap(power_source) => {
                let power_source = *power_source;

                if self.device_policy_manager.vconn_is_present().await {
                    self.protocol_layer
                        .receive_message_type(&[MessageType::Control(ControlMessageType::PsRdy)], TimerType::VconnOn)
                        .await?;
                    self.device_policy_manager.set_vconn(false).await;
                } else {
                    self.device_policy_manager.set_vconn(true).await;
                    TimerType::get_timer::<TIMER>(TimerType::VconnOn).await;
                    self.protocol_layer
                        .transmit_control_message(ControlMessageType::PsRdy)
                        .await?;
                }

                self.device_policy_manager.notify(Event::VconnSwapComplete).await;
                State::Ready(power_source)
            }
            State::EprEntryReceived(power_source, pdp) => {
                let power_source = *power_source;
                let pdp = *pdp;

                if let Some(cause) = self.epr_entry_gate(&power_source, pdp).await {
                    self.protocol_layer
                        .transmit_epr_mode(Action::EnterFailed, cause.into())
                        .await?;
                    self.device_policy_manager
                        .notify(Event::EprModeEnterFailed(cause))
                        .await;
                    State::Ready(power_source)
                } else {
                    self.protocol_layer
                        .transmit_epr_mode(Action::EnterAcknowledged, 0)
                        .await?;

                    // The cable was checked at attach; finish entry and
                    // advertise the extended range.
                    self.protocol_layer.transmit_epr_mode(Action::EnterSucceeded, 0).await?;

                    self.mode = Mode::Epr;
                    self.advertised = self.epr_advertisement();
                    self.device_policy_manager.notify(Event::EprModeEntered).await;

                    let advertisement = self.advertised.clone();
                    self.protocol_layer
                        .transmit_epr_source_capabilities(&advertisement)
                        .await?;

                    let message = self
                        .protocol_layer
                        .receive_message_type(
                            &[MessageType::Data(DataMessageType::EprRequest)],
                            self.protocol_layer.sender_response_timer(),
                        )
                        .await?;

                    let Some(Payload::Data(Data::Request(received))) = message.payload else {
                        return Err(Error::Protocol(ProtocolError::UnexpectedMessage));
                    };

                    State::NegotiateCapability(received)
                }
            }
            State::GetSinkCap(power_source) => {
                let power_source = *power_source;
                self.protocol_layer
                    .transmit_control_message(ControlMessageType::GetSinkCap)
                    .await?;

                let result = self
                    .protocol_layer
                    .receive_message_type(
                        &[MessageType::Data(DataMessageType::SinkCapabilities)],
                        self.protocol_layer.sender_response_timer(),
                    )
                    .await;

                match result {
                    Ok(_) => {
                        self.device_policy_manager
                            .notify(Event::RequestComplete(RequestOutcome::ResponseReceived))
                            .await;
                        State::Ready(power_source)
                    }
                    Err(ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                        self.device_policy_manager
                            .notify(Event::RequestComplete(RequestOutcome::Timeout))
                            .await;
                        State::Ready(power_source)
                    }
                    Err(error) => return Err(error.into()),
                }
            }
            State::GotoMin(power_source) => {
                let power_source = *power_source;
                self.protocol_layer
                    .transmit_control_message(ControlMessageType::GotoMin)
                    .await?;

                // Reduce the supply, then report readiness at the new level.
                let (voltage, _) = self.supply_for_request(&power_source);
                self.device_policy_manager
                    .psrc_enable(voltage, ElectricCurrent::new::<uom::si::electric_current::milliampere>(0))
                    .await;
                TimerType::get_timer::<TIMER>(TimerType::SourceReady).await;

                self.protocol_layer
                    .transmit_control_message(ControlMessageType::PsRdy)
                    .await?;

                State::Ready(power_source)
            }
            State::BistCarrierMode(power_source) => {
                let power_source = *power_source;
                TimerType::get_timer::<TIMER>(TimerType::BISTContMode).await;
                self.device_policy_manager.notify(Event::BistExited).await;
                State::Ready(power_source)
            }
            State::BistTestData => loop {
                let _ = self.protocol_layer.receive_message().await?;
            },
            State::SendDataReset(power_source) => {
                let power_source = *power_source;
                self.protocol_layer
                    .transmit_control_message(ControlMessageType::DataReset)
                    .await?;

                self.protocol_layer
                    .receive_message_type(
                        &[MessageType::Control(ControlMessageType::Accept)],
                        self.protocol_layer.sender_response_timer(),
                    )
                    .await?;

                State::DataReset(power_source)
            }
            State::DataReset(power_source) => {
                // DFP execution: cycle VConn within tDataReset, then signal
                // completion after the settling delay.
                let power_source = *power_source;

                self.device_policy_manager.set_vconn(false).await;
                TimerType::get_timer::<TIMER>(TimerType::DataReset).await;
                self.device_policy_manager.set_vconn(true).await;
                TimerType::get_timer::<TIMER>(TimerType::DataResetDfpDelay).await;

                self.protocol_layer
                    .transmit_control_message(ControlMessageType::DataResetComplete)
                    .await?;

                self.device_policy_manager.notify(Event::DataResetComplete).await;
                State::Ready(power_source)
            }
        };

        self.state = new_state;

        Ok(None)
    }
}
