//! Policy engine for the sink role.
use embassy_futures::select::{Either3, select3};
use typec_pd_traits::{PdDriver, Sop};
use uom::si::power::watt;

use super::{EngineOutcome, Error};
use crate::config::PortConfig;
use crate::counters::{Counter, CounterType};
use crate::device_policy_manager::{
    ContractStatus, DevicePolicyManager, Disposition, Event, Request, RequestOutcome, SwapKind,
};
use crate::protocol_layer::message::data::epr_mode::{self, Action};
use crate::protocol_layer::message::data::bist::BistMode;
use crate::protocol_layer::message::data::source_capabilities::SourceCapabilities;
use crate::protocol_layer::message::data::vendor_defined::{VdmCommandType, VdmHeader};
use crate::protocol_layer::message::data::{Data, request};
use crate::protocol_layer::message::extended::extended_control::ExtendedControlMessageType;
use crate::protocol_layer::message::extended::{Extended, ManufacturerInfo};
use crate::protocol_layer::message::header::{
    ControlMessageType, DataMessageType, ExtendedMessageType, Header, MessageType, SpecificationRevision,
};
use crate::protocol_layer::message::{Message, Payload};
use crate::protocol_layer::{ProtocolError, ProtocolLayer, RxError, TxError};
use crate::timers::{Timer, TimerType};
use crate::units::Power;
use crate::{DataRole, PowerRole};

#[cfg(test)]
mod tests;

/// Power range of operation.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    /// Explicit contracts negotiated from SPR (A)PDOs.
    Spr,
    /// Extended power range, up to 48 V.
    Epr,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
enum Contract {
    #[default]
    Safe5V,
    TransitionToExplicit,
    Explicit,
}

/// Sink policy engine states.
#[derive(Debug, Clone)]
enum State {
    /// Default state at startup.
    Startup,
    Discovery,
    WaitForCapabilities,
    EvaluateCapabilities(SourceCapabilities),
    SelectCapability(request::PowerSource),
    TransitionSink(request::PowerSource),
    /// Ready state. The bool marks entry through a Wait response, which
    /// arms the SinkRequest timer before a re-request is allowed.
    Ready(request::PowerSource, bool),
    SendNotSupported(request::PowerSource),
    SendSoftReset,
    SoftReset(Sop),
    HardReset,
    TransitionToDefault,
    /// Answer Get_Sink_Cap / EPR_Get_Sink_Cap.
    GiveSinkCap(Mode, request::PowerSource),
    GetSourceCap(Mode, request::PowerSource),

    /// A swap request arrived from the partner.
    EvaluateSwap(SwapKind, request::PowerSource),
    /// The application asked for a swap.
    SendSwap(SwapKind, request::PowerSource),
    /// Accepted PR swap: wait for the source to reach vSafe0V, then take
    /// over supply.
    PrSwapWaitSourceOff(request::PowerSource),
    /// Accepted VConn swap.
    VconnSwap(request::PowerSource),

    // EPR states.
    EprModeEntry(request::PowerSource, Power),
    EprEntryWaitForResponse(request::PowerSource),
    EprWaitForCapabilities(request::PowerSource),
    EprSendExit,
    EprExitReceived(request::PowerSource),
    EprKeepAlive(request::PowerSource),

    // Test modes.
    BistCarrierMode(request::PowerSource),
    BistTestData,

    /// Data_Reset received or requested (UFP side).
    DataReset(request::PowerSource),
}

/// Implementation of the sink policy engine.
#[derive(Debug)]
pub struct Sink<DRIVER: PdDriver, TIMER: Timer, DPM: DevicePolicyManager> {
    config: PortConfig,
    device_policy_manager: DPM,
    protocol_layer: ProtocolLayer<DRIVER, TIMER>,
    contract: Contract,
    hard_reset_counter: Counter,
    source_capabilities: Option<SourceCapabilities>,
    mode: Mode,
    state: State,
    /// Set while a Get_Source_Cap answer is outstanding. In EPR mode, an
    /// unrequested Source_Capabilities message forces a hard reset.
    get_source_cap_pending: bool,
}

impl<DRIVER: PdDriver, TIMER: Timer, DPM: DevicePolicyManager> Sink<DRIVER, TIMER, DPM> {
    /// Create a fresh protocol layer with initial state.
    fn new_protocol_layer(driver: DRIVER, revision: SpecificationRevision) -> ProtocolLayer<DRIVER, TIMER> {
        let header = Header::new_template(DataRole::Ufp, PowerRole::Sink, revision);
        ProtocolLayer::new(driver, header)
    }

    /// Create a new sink policy engine with a given `driver`.
    pub fn new(driver: DRIVER, device_policy_manager: DPM, config: PortConfig) -> Self {
        let revision = config.pd_revision;
        Self {
            config,
            device_policy_manager,
            protocol_layer: Self::new_protocol_layer(driver, revision),
            state: State::Startup,
            contract: Default::default(),
            hard_reset_counter: Counter::new(CounterType::HardReset),
            source_capabilities: None,
            mode: Mode::Spr,
            get_source_cap_pending: false,
        }
    }

    /// Run a single step in the policy engine state machine.
    async fn run_step(&mut self) -> Result<Option<EngineOutcome>, Error> {
        let result = self.update_state().await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(Error::Protocol(protocol_error)) => {
                let new_state = match (&self.state, protocol_error) {
                    // Resets signalled by the driver itself.
                    (_, ProtocolError::RxError(RxError::HardReset) | ProtocolError::TxError(TxError::HardReset)) => {
                        self.device_policy_manager.notify(Event::HardResetReceived).await;
                        Some(State::TransitionToDefault)
                    }
                    (_, ProtocolError::RxError(RxError::SoftReset(sop))) => Some(State::SoftReset(sop)),

                    // A failing soft reset escalates to a hard reset.
                    (State::SoftReset(_) | State::SendSoftReset, ProtocolError::TransmitRetriesExceeded(_)) => {
                        Some(State::HardReset)
                    }

                    // SinkWaitCapTimer timeout while waiting for capabilities.
                    (State::WaitForCapabilities, ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                        Some(State::HardReset)
                    }

                    // SenderResponseTimer timeout after the request.
                    (State::SelectCapability(_), ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                        self.device_policy_manager.notify(Event::SenderResponseTimeout).await;
                        Some(State::HardReset)
                    }

                    // Any protocol error during the power transition is a
                    // hard reset, never a soft reset.
                    (State::TransitionSink(_), error) => {
                        if matches!(error, ProtocolError::RxError(RxError::ReceiveTimeout)) {
                            self.device_policy_manager
                                .notify(Event::ContractNegotiationComplete(ContractStatus::PsRdyNotReceived))
                                .await;
                        }
                        Some(State::HardReset)
                    }

                    // A failing VConn swap is reported, then recovered by
                    // soft reset.
                    (State::VconnSwap(_), ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                        self.device_policy_manager.notify(Event::VconnSwapFailed).await;
                        Some(State::SendSoftReset)
                    }

                    // A PR swap that dies mid-sequence forces a hard reset;
                    // VBUS is in an undefined state.
                    (State::PrSwapWaitSourceOff(_), _) => Some(State::HardReset),

                    // Unexpected messages demand a soft reset.
                    (_, ProtocolError::UnexpectedMessage) => Some(State::SendSoftReset),

                    // Unsupported messages in Ready state get a Not_Supported
                    // response.
                    (State::Ready(power_source, _), ProtocolError::RxError(RxError::UnsupportedMessage)) => {
                        Some(State::SendNotSupported(*power_source))
                    }

                    // Transmission failure after retries triggers soft reset.
                    (_, ProtocolError::TransmitRetriesExceeded(_)) => Some(State::SendSoftReset),

                    (_, error) => {
                        error!("Protocol error {:?} in sink state transition", error);
                        None
                    }
                };

                if let Some(state) = new_state {
                    self.state = state
                }

                Ok(None)
            }
            Err(error) => {
                error!("Unrecoverable error {:?} in sink state transition", error);
                Err(error)
            }
        }
    }

    /// Run the sink's state machine continuously.
    ///
    /// Returns when the role changes (PR/FR swap), or with an unrecoverable
    /// error, for example an unresponsive port partner.
    pub async fn run(&mut self) -> Result<EngineOutcome, Error> {
        loop {
            if let Some(outcome) = self.run_step().await? {
                return Ok(outcome);
            }
        }
    }

    /// Wait for a source capabilities message, either Source_Capabilities
    /// or EPR_Source_Capabilities.
    ///
    /// EPR mode persists through soft reset, so both forms must be handled.
    async fn wait_for_source_capabilities(
        protocol_layer: &mut ProtocolLayer<DRIVER, TIMER>,
    ) -> Result<SourceCapabilities, Error> {
        let message = protocol_layer.wait_for_source_capabilities().await?;
        trace!("Source capabilities: {:?}", message);

        match message.payload {
            Some(Payload::Data(Data::SourceCapabilities(caps))) => Ok(caps),
            Some(Payload::Extended(Extended::EprSourceCapabilities(pdos))) => {
                Ok(SourceCapabilities::from_pdos(pdos))
            }
            _ => Err(Error::Protocol(ProtocolError::UnexpectedMessage)),
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
    async fn handle_vdm(&mut self, header: &VdmHeader, objects: &[u32]) -> Result<bool, ProtocolError> {
        if let Some(response) = self.device_policy_manager.handle_vdm(header, objects).await {
            if let Some((&response_header, vdos)) = response.split_first() {
                self.protocol_layer
                    .transmit_vdm(Sop::Sop, VdmHeader::from(response_header), vdos)
                    .await?;
            }
            return Ok(true);
        }

        // Structured requests without an application handler are NAKed at
        // PD 3.x; unstructured ones are ignored.
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

        Ok(true)
    }

    /// Handle a message received in the Ready state, returning the next
    /// state.
    async fn handle_ready_message(
        &mut self,
        message: Message,
        power_source: request::PowerSource,
    ) -> Result<State, Error> {
        Ok(match message.header.message_type() {
            MessageType::Data(DataMessageType::SourceCapabilities) => {
                // In EPR mode, an unrequested Source_Capabilities message
                // forces a hard reset.
                if self.mode == Mode::Epr && !self.get_source_cap_pending {
                    State::HardReset
                } else {
                    let Some(Payload::Data(Data::SourceCapabilities(capabilities))) = message.payload else {
                        return Err(Error::Protocol(ProtocolError::UnexpectedMessage));
                    };
                    self.get_source_cap_pending = false;
                    State::EvaluateCapabilities(capabilities)
                }
            }
            MessageType::Extended(ExtendedMessageType::EprSourceCapabilities) => {
                let Some(Payload::Extended(Extended::EprSourceCapabilities(pdos))) = message.payload else {
                    return Err(Error::Protocol(ProtocolError::UnexpectedMessage));
                };
                self.get_source_cap_pending = false;
                let caps = SourceCapabilities::from_pdos(pdos);

                // EPR (A)PDOs are not allowed in the SPR positions.
                if self.mode == Mode::Epr && caps.has_epr_pdo_in_spr_positions() {
                    State::HardReset
                } else {
                    State::EvaluateCapabilities(caps)
                }
            }
            MessageType::Data(DataMessageType::EprMode) => State::EprExitReceived(power_source),
            MessageType::Control(ControlMessageType::GetSinkCap) => State::GiveSinkCap(Mode::Spr, power_source),
            MessageType::Control(ControlMessageType::GotoMin) => {
                // Reduce draw immediately; the contract stays in place.
                self.device_policy_manager.transition_power(&power_source).await;
                State::Ready(power_source, false)
            }
            MessageType::Control(ControlMessageType::Ping) => State::Ready(power_source, false),
            MessageType::Control(ControlMessageType::DrSwap) => State::EvaluateSwap(SwapKind::Data, power_source),
            MessageType::Control(ControlMessageType::PrSwap) => State::EvaluateSwap(SwapKind::Power, power_source),
            MessageType::Control(ControlMessageType::VconnSwap) => State::EvaluateSwap(SwapKind::Vconn, power_source),
            MessageType::Control(ControlMessageType::GetRevision) => {
                self.protocol_layer
                    .transmit_data_message(DataMessageType::Revision, Data::Revision(self.config.get_revision))
                    .await?;
                State::Ready(power_source, false)
            }
            MessageType::Control(ControlMessageType::DataReset) => {
                self.device_policy_manager.notify(Event::DataResetReceived).await;
                State::DataReset(power_source)
            }
            MessageType::Data(DataMessageType::Alert) => {
                if let Some(Payload::Data(Data::Alert(alert))) = message.payload {
                    self.device_policy_manager.notify(Event::AlertReceived(alert)).await;
                }
                State::Ready(power_source, false)
            }
            MessageType::Data(DataMessageType::Bist) => {
                let Some(Payload::Data(Data::Bist(bist))) = message.payload else {
                    return Err(Error::Protocol(ProtocolError::UnexpectedMessage));
                };

                match bist.mode() {
                    // Test modes only apply at vSafe5V contracts, i.e. when
                    // object position 1 is selected.
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
                        State::Ready(power_source, false)
                    }
                    _ => State::SendNotSupported(power_source),
                }
            }
            MessageType::Data(DataMessageType::VendorDefined) => {
                if let Some(Payload::Data(Data::VendorDefined((vdm_header, objects)))) = message.payload {
                    self.handle_vdm(&vdm_header, &objects).await?;
                }
                State::Ready(power_source, false)
            }
            MessageType::Extended(ExtendedMessageType::ExtendedControl) => {
                if let Some(Payload::Extended(Extended::ExtendedControl(ctrl))) = &message.payload {
                    if ctrl.message_type() == ExtendedControlMessageType::EprGetSinkCap {
                        State::GiveSinkCap(Mode::Epr, power_source)
                    } else {
                        State::SendNotSupported(power_source)
                    }
                } else {
                    State::SendNotSupported(power_source)
                }
            }
            MessageType::Extended(ExtendedMessageType::GetManufacturerInfo) => {
                self.give_manufacturer_info().await?;
                State::Ready(power_source, false)
            }
            MessageType::Control(ControlMessageType::GetSinkCapExtended) => match self.config.ext_snk_cap {
                Some(cap) => {
                    self.protocol_layer
                        .transmit_extended(ExtendedMessageType::SinkCapabilitiesExtended, &cap)
                        .await?;
                    State::Ready(power_source, false)
                }
                None => State::SendNotSupported(power_source),
            },
            _ => State::SendNotSupported(power_source),
        })
    }

    /// Map an application request onto the next state.
    async fn handle_request(&mut self, request: Request, power_source: request::PowerSource) -> State {
        match request {
            Request::RequestSprSourceCapabilities => State::GetSourceCap(Mode::Spr, power_source),
            Request::RequestEprSourceCapabilities => State::GetSourceCap(Mode::Epr, power_source),
            Request::EnterEprMode(pdp) => State::EprModeEntry(power_source, pdp),
            Request::ExitEprMode => State::EprSendExit,
            Request::RequestPower(power_source) => State::SelectCapability(power_source),
            Request::PrSwap => State::SendSwap(SwapKind::Power, power_source),
            Request::DrSwap => State::SendSwap(SwapKind::Data, power_source),
            Request::VconnSwap => State::SendSwap(SwapKind::Vconn, power_source),
            Request::FrSwap => State::SendSwap(SwapKind::FastRole, power_source),
            Request::HardReset => State::HardReset,
            Request::SoftReset => State::SendSoftReset,
            Request::None => State::Ready(power_source, false),
            _ => {
                // Source-role requests cannot be served while sinking.
                trace!("Request not possible as sink");
                self.device_policy_manager
                    .notify(Event::RequestComplete(RequestOutcome::Failed))
                    .await;
                State::Ready(power_source, false)
            }
        }
    }

    async fn update_state(&mut self) -> Result<Option<EngineOutcome>, Error> {
        let new_state = match &self.state {
            State::Startup => {
                self.contract = Default::default();
                self.protocol_layer.reset();
                self.mode = Mode::Spr;

                State::Discovery
            }
            State::Discovery => {
                self.protocol_layer.wait_for_vbus().await;
                self.device_policy_manager.psnk_enable().await;
                self.source_capabilities = None;

                State::WaitForCapabilities
            }
            State::WaitForCapabilities => {
                State::EvaluateCapabilities(Self::wait_for_source_capabilities(&mut self.protocol_layer).await?)
            }
            State::EvaluateCapabilities(capabilities) => {
                // The sink now knows that the partner speaks PD.
                self.source_capabilities = Some(capabilities.clone());

                self.hard_reset_counter.reset();

                let capabilities = self.source_capabilities.as_ref().unwrap();
                self.device_policy_manager.inform(capabilities).await;

                // An untyped request means "no preference": fall back to the
                // configured selection policy.
                let request = match self.device_policy_manager.request(capabilities).await {
                    request::PowerSource::Unknown(_) => {
                        request::PowerSource::select(self.config.pdo_selection, capabilities)
                            .unwrap_or(request::PowerSource::Unknown(request::RawDataObject(0)))
                    }
                    preferred => preferred,
                };

                State::SelectCapability(request)
            }
            State::SelectCapability(power_source) => {
                let power_source = *power_source;
                self.protocol_layer.request_power(power_source).await?;

                let message_type = self
                    .protocol_layer
                    .receive_message_type(
                        &[
                            MessageType::Control(ControlMessageType::Accept),
                            MessageType::Control(ControlMessageType::Wait),
                            MessageType::Control(ControlMessageType::Reject),
                        ],
                        self.protocol_layer.sender_response_timer(),
                    )
                    .await?
                    .header
                    .message_type();

                let MessageType::Control(control_message_type) = message_type else {
                    unreachable!()
                };

                match (self.contract, control_message_type) {
                    (_, ControlMessageType::Accept) => State::TransitionSink(power_source),
                    (Contract::Safe5V, ControlMessageType::Wait | ControlMessageType::Reject) => {
                        self.device_policy_manager
                            .notify(Event::ContractNegotiationComplete(ContractStatus::RejectedNoContract))
                            .await;
                        State::WaitForCapabilities
                    }
                    (_, ControlMessageType::Reject) => {
                        self.device_policy_manager
                            .notify(Event::ContractNegotiationComplete(
                                ContractStatus::RejectedWithValidContract,
                            ))
                            .await;
                        State::Ready(power_source, false)
                    }
                    (_, ControlMessageType::Wait) => {
                        // Re-request only after the SinkRequest timer.
                        State::Ready(power_source, true)
                    }
                    _ => unreachable!(),
                }
            }
            State::TransitionSink(power_source) => {
                let power_source = *power_source;
                self.protocol_layer
                    .receive_message_type(
                        &[MessageType::Control(ControlMessageType::PsRdy)],
                        match self.mode {
                            Mode::Epr => TimerType::PSTransitionEpr,
                            Mode::Spr => TimerType::PSTransitionSpr,
                        },
                    )
                    .await?;

                self.contract = Contract::TransitionToExplicit;
                self.device_policy_manager.transition_power(&power_source).await;

                let status = match power_source {
                    request::PowerSource::FixedVariableSupply(rdo) if rdo.capability_mismatch() => {
                        ContractStatus::CapabilityMismatch
                    }
                    _ => ContractStatus::Successful,
                };
                self.device_policy_manager
                    .notify(Event::ContractNegotiationComplete(status))
                    .await;

                State::Ready(power_source, false)
            }
            State::Ready(power_source, after_wait) => {
                let power_source = *power_source;
                let after_wait = *after_wait;
                self.contract = Contract::Explicit;

                let receive_fut = self.protocol_layer.receive_message();
                let request_fut = self
                    .device_policy_manager
                    .get_request(self.source_capabilities.as_ref().unwrap());
                let pps_periodic_fut = async {
                    match power_source {
                        request::PowerSource::Pps(_) => {
                            TimerType::get_timer::<TIMER>(TimerType::SinkPPSPeriodic).await
                        }
                        _ => core::future::pending().await,
                    }
                };
                let mode = self.mode;
                let epr_keep_alive_fut = async {
                    match mode {
                        Mode::Epr => TimerType::get_timer::<TIMER>(TimerType::SinkEPRKeepAlive).await,
                        Mode::Spr => core::future::pending().await,
                    }
                };
                // After a Wait response, the SinkRequest timer gates the
                // re-request.
                let sink_request_fut = async {
                    if after_wait {
                        TimerType::get_timer::<TIMER>(TimerType::SinkRequest).await
                    } else {
                        core::future::pending().await
                    }
                };
                let timers_fut = async { select3(pps_periodic_fut, epr_keep_alive_fut, sink_request_fut).await };

                match select3(receive_fut, request_fut, timers_fut).await {
                    Either3::First(message) => self.handle_ready_message(message?, power_source).await?,
                    Either3::Second(request) => self.handle_request(request, power_source).await,
                    Either3::Third(timeout_source) => match timeout_source {
                        // PPS periodic keep-alive re-requests the supply.
                        Either3::First(_) => State::SelectCapability(power_source),
                        Either3::Second(_) => State::EprKeepAlive(power_source),
                        Either3::Third(_) => State::SelectCapability(power_source),
                    },
                }
            }
            State::SendNotSupported(power_source) => {
                let power_source = *power_source;
                // Not_Supported does not exist below PD 3.0; such partners
                // simply get no response.
                if self.protocol_layer.revision() >= SpecificationRevision::R3_X {
                    self.protocol_layer
                        .transmit_control_message(ControlMessageType::NotSupported)
                        .await?;
                }

                State::Ready(power_source, false)
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

                State::WaitForCapabilities
            }
            State::SoftReset(sop) => {
                let sop = *sop;
                self.device_policy_manager.notify(Event::SoftResetReceived).await;
                self.protocol_layer
                    .transmit_control_message_sop(sop, ControlMessageType::Accept)
                    .await?;

                self.protocol_layer.reset_sop(sop);

                State::WaitForCapabilities
            }
            State::HardReset => {
                // The counter bounds the number of attempts; past it, the
                // source counts as non-responsive.
                if self.hard_reset_counter.increment().is_err() {
                    return Err(Error::PortPartnerUnresponsive);
                }

                self.protocol_layer.hard_reset().await?;
                self.device_policy_manager.notify(Event::HardResetSent).await;

                State::TransitionToDefault
            }
            State::TransitionToDefault => {
                // Local hardware returns to its default power level while
                // VBUS cycles through vSafe0V.
                self.device_policy_manager.psnk_disable().await;
                self.device_policy_manager.hard_reset().await;

                let vbus_off = self.protocol_layer.wait_for_vbus_absent();
                match embassy_futures::select::select(
                    vbus_off,
                    TimerType::get_timer::<TIMER>(TimerType::SinkVbusTurnOff),
                )
                .await
                {
                    embassy_futures::select::Either::First(_) => {}
                    embassy_futures::select::Either::Second(_) => {
                        warn!("VBUS did not reach vSafe0V in time");
                        self.device_policy_manager
                            .notify(Event::Fault(crate::device_policy_manager::FaultKind::VbusUnderVoltage))
                            .await;
                    }
                }

                let vbus_on = self.protocol_layer.wait_for_vbus();
                match embassy_futures::select::select(
                    vbus_on,
                    TimerType::get_timer::<TIMER>(TimerType::SinkVbusTurnOn),
                )
                .await
                {
                    embassy_futures::select::Either::First(_) => {}
                    embassy_futures::select::Either::Second(_) => {
                        warn!("VBUS did not return in time after hard reset");
                    }
                }

                self.protocol_layer.reset();
                // Hard reset always exits EPR mode.
                self.mode = Mode::Spr;
                self.contract = Contract::Safe5V;
                self.source_capabilities = None;

                self.device_policy_manager.notify(Event::HardResetComplete).await;

                State::Startup
            }
            State::GiveSinkCap(response_mode, power_source) => {
                let power_source = *power_source;
                let sink_caps = self.device_policy_manager.sink_capabilities().await;
                match response_mode {
                    Mode::Spr => {
                        self.protocol_layer.transmit_sink_capabilities(sink_caps).await?;
                    }
                    Mode::Epr => {
                        self.protocol_layer.transmit_epr_sink_capabilities(sink_caps).await?;
                    }
                }

                State::Ready(power_source, false)
            }
            State::GetSourceCap(requested_mode, power_source) => {
                let requested_mode = *requested_mode;
                let power_source = *power_source;

                // Track that capabilities were requested; in EPR mode an
                // unrequested advertisement is a protocol violation.
                self.get_source_cap_pending = true;

                match requested_mode {
                    Mode::Spr => {
                        self.protocol_layer
                            .transmit_control_message(ControlMessageType::GetSourceCap)
                            .await?;
                    }
                    Mode::Epr => {
                        self.protocol_layer
                            .transmit_extended_control_message(ExtendedControlMessageType::EprGetSourceCap)
                            .await?;
                    }
                };

                let result = self
                    .protocol_layer
                    .receive_message_type(
                        &[
                            MessageType::Data(DataMessageType::SourceCapabilities),
                            MessageType::Extended(ExtendedMessageType::EprSourceCapabilities),
                        ],
                        self.protocol_layer.sender_response_timer(),
                    )
                    .await;

                self.get_source_cap_pending = false;

                let message = match result {
                    Ok(msg) => msg,
                    Err(ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                        warn!("Get_Source_Cap timeout, returning to Ready");
                        self.device_policy_manager
                            .notify(Event::RequestComplete(RequestOutcome::Timeout))
                            .await;
                        self.state = State::Ready(power_source, false);
                        return Ok(None);
                    }
                    Err(e) => return Err(e.into()),
                };

                let received_spr = matches!(
                    message.header.message_type(),
                    MessageType::Data(DataMessageType::SourceCapabilities)
                );
                let received_epr = matches!(
                    message.header.message_type(),
                    MessageType::Extended(ExtendedMessageType::EprSourceCapabilities)
                );

                let mode_matches = (requested_mode == Mode::Spr && self.mode == Mode::Spr && received_spr)
                    || (requested_mode == Mode::Epr && self.mode == Mode::Epr && received_epr);

                let capabilities = match message.payload {
                    Some(Payload::Data(Data::SourceCapabilities(caps))) => caps,
                    Some(Payload::Extended(Extended::EprSourceCapabilities(pdos))) => {
                        SourceCapabilities::from_pdos(pdos)
                    }
                    _ => return Err(Error::Protocol(ProtocolError::UnexpectedMessage)),
                };

                self.device_policy_manager.inform(&capabilities).await;
                self.device_policy_manager
                    .notify(Event::RequestComplete(RequestOutcome::ResponseReceived))
                    .await;

                if mode_matches {
                    State::EvaluateCapabilities(capabilities)
                } else {
                    State::Ready(power_source, false)
                }
            }
            State::EvaluateSwap(kind, power_source) => {
                let kind = *kind;
                let power_source = *power_source;

                // FR_Swap is initiated by the sink, never received by it.
                let disposition = if kind == SwapKind::FastRole {
                    Disposition::NotSupported
                } else {
                    self.device_policy_manager.evaluate_swap(kind).await
                };

                match disposition {
                    Disposition::NotSupported => State::SendNotSupported(power_source),
                    Disposition::Reject => {
                        self.protocol_layer
                            .transmit_control_message(ControlMessageType::Reject)
                            .await?;
                        State::Ready(power_source, false)
                    }
                    Disposition::Wait => {
                        self.protocol_layer
                            .transmit_control_message(ControlMessageType::Wait)
                            .await?;
                        State::Ready(power_source, false)
                    }
                    Disposition::Accept => {
                        self.protocol_layer
                            .transmit_control_message(ControlMessageType::Accept)
                            .await?;

                        match kind {
                            SwapKind::Data => {
                                let new_role = DataRole::Dfp;
                                self.protocol_layer.set_data_role(new_role);
                                self.device_policy_manager.notify(Event::DataRoleSwapped(new_role)).await;
                                State::Ready(power_source, false)
                            }
                            SwapKind::Vconn => State::VconnSwap(power_source),
                            SwapKind::Power | SwapKind::FastRole => State::PrSwapWaitSourceOff(power_source),
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

                if kind == SwapKind::FastRole {
                    // The FRS wire signal precedes the message.
                    self.protocol_layer.signal_fast_role_swap().await;
                }

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
                            let new_role = DataRole::Dfp;
                            self.protocol_layer.set_data_role(new_role);
                            self.device_policy_manager.notify(Event::DataRoleSwapped(new_role)).await;
                            State::Ready(power_source, false)
                        }
                        SwapKind::Vconn => State::VconnSwap(power_source),
                        SwapKind::Power | SwapKind::FastRole => State::PrSwapWaitSourceOff(power_source),
                    },
                    _ => {
                        self.device_policy_manager
                            .notify(Event::RequestComplete(RequestOutcome::ResponseReceived))
                            .await;
                        State::Ready(power_source, false)
                    }
                }
            }
            State::PrSwapWaitSourceOff(_) => {
                // The old source reports vSafe0V with PS_RDY; the sink must
                // not draw or supply power until then.
                self.device_policy_manager.psnk_disable().await;
                self.protocol_layer
                    .receive_message_type(
                        &[MessageType::Control(ControlMessageType::PsRdy)],
                        TimerType::PSSourceOff,
                    )
                    .await?;

                // Take over as source: drive vSafe5V, then report readiness.
                self.protocol_layer.set_power_role(PowerRole::Source);
                self.device_policy_manager
                    .psrc_enable(
                        crate::units::ElectricPotential::new::<uom::si::electric_potential::volt>(5),
                        crate::units::ElectricCurrent::new::<uom::si::electric_current::milliampere>(900),
                    )
                    .await;
                TimerType::get_timer::<TIMER>(TimerType::SwapSourceStart).await;

                self.protocol_layer
                    .transmit_control_message(ControlMessageType::PsRdy)
                    .await?;

                self.device_policy_manager
                    .notify(Event::PowerRoleSwapped(PowerRole::Source))
                    .await;

                return Ok(Some(EngineOutcome::PowerRoleSwapped));
            }
            State::VconnSwap(power_source) => {
                let power_source = *power_source;

                if self.device_policy_manager.vconn_is_present().await {
                    // We stop sourcing VConn once the partner reports it on.
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
                State::Ready(power_source, false)
            }
            State::EprModeEntry(power_source, operational_pdp) => {
                // Send EPR_Mode(Enter) with the operational PDP, then wait
                // for the source's acknowledgement.
                let power_source = *power_source;
                let pdp_watts: u8 = operational_pdp.get::<watt>() as u8;
                self.protocol_layer.transmit_epr_mode(Action::Enter, pdp_watts).await?;

                let message = self
                    .protocol_layer
                    .receive_message_type(
                        &[MessageType::Data(DataMessageType::EprMode)],
                        self.protocol_layer.sender_response_timer(),
                    )
                    .await?;

                let Some(Payload::Data(Data::EprMode(epr_mode))) = message.payload else {
                    return Err(Error::Protocol(ProtocolError::UnexpectedMessage));
                };

                match epr_mode.action() {
                    Action::EnterAcknowledged => State::EprEntryWaitForResponse(power_source),
                    Action::EnterSucceeded => {
                        self.mode = Mode::Epr;
                        State::EprWaitForCapabilities(power_source)
                    }
                    Action::Exit => State::EprExitReceived(power_source),
                    Action::EnterFailed => {
                        let reason = epr_mode::DataEnterFailed::from(epr_mode.data());
                        self.device_policy_manager
                            .notify(Event::EprModeEnterFailed(reason))
                            .await;
                        State::SendSoftReset
                    }
                    _ => State::SendSoftReset,
                }
            }
            State::EprEntryWaitForResponse(power_source) => {
                // The source acknowledged; wait for the final verdict while
                // it performs cable discovery.
                let power_source = *power_source;
                let message = self
                    .protocol_layer
                    .receive_message_type(&[MessageType::Data(DataMessageType::EprMode)], TimerType::SinkEPREnter)
                    .await?;

                let Some(Payload::Data(Data::EprMode(epr_mode))) = message.payload else {
                    return Err(Error::Protocol(ProtocolError::UnexpectedMessage));
                };

                match epr_mode.action() {
                    Action::EnterSucceeded => {
                        self.mode = Mode::Epr;
                        self.device_policy_manager.notify(Event::EprModeEntered).await;
                        State::EprWaitForCapabilities(power_source)
                    }
                    Action::Exit => State::EprExitReceived(power_source),
                    Action::EnterFailed => {
                        let reason = epr_mode::DataEnterFailed::from(epr_mode.data());
                        self.device_policy_manager
                            .notify(Event::EprModeEnterFailed(reason))
                            .await;
                        State::SendSoftReset
                    }
                    _ => State::SendSoftReset,
                }
            }
            State::EprWaitForCapabilities(_power_source) => {
                // After successful entry, the source sends its EPR
                // capabilities on its own.
                let message = self.protocol_layer.wait_for_source_capabilities().await?;

                match message.payload {
                    Some(Payload::Data(Data::SourceCapabilities(capabilities))) => {
                        State::EvaluateCapabilities(capabilities)
                    }
                    Some(Payload::Extended(Extended::EprSourceCapabilities(pdos))) => {
                        State::EvaluateCapabilities(SourceCapabilities::from_pdos(pdos))
                    }
                    _ => {
                        error!("Expected source capabilities after EPR mode entry");
                        State::HardReset
                    }
                }
            }
            State::EprSendExit => {
                self.protocol_layer.transmit_epr_mode(Action::Exit, 0).await?;
                self.mode = Mode::Spr;
                self.device_policy_manager.notify(Event::EprModeExited).await;
                State::WaitForCapabilities
            }
            State::EprExitReceived(power_source) => {
                // Leaving EPR with an EPR-position contract still in place
                // demands a hard reset.
                self.mode = Mode::Spr;
                self.device_policy_manager.notify(Event::EprModeExited).await;

                let is_epr_pdo_contract = match power_source {
                    request::PowerSource::EprRequest(epr) => epr.object_position() >= 8,
                    _ => false,
                };

                if is_epr_pdo_contract {
                    State::HardReset
                } else {
                    State::WaitForCapabilities
                }
            }
            State::EprKeepAlive(power_source) => {
                let power_source = *power_source;
                self.protocol_layer
                    .transmit_extended_control_message(ExtendedControlMessageType::EprKeepAlive)
                    .await?;
                match self
                    .protocol_layer
                    .receive_message_type(
                        &[MessageType::Extended(ExtendedMessageType::ExtendedControl)],
                        self.protocol_layer.sender_response_timer(),
                    )
                    .await
                {
                    Ok(message) => {
                        if let Some(Payload::Extended(Extended::ExtendedControl(control))) = message.payload {
                            if control.message_type() == ExtendedControlMessageType::EprKeepAliveAck {
                                self.mode = Mode::Epr;
                                State::Ready(power_source, false)
                            } else {
                                State::SendNotSupported(power_source)
                            }
                        } else {
                            State::SendNotSupported(power_source)
                        }
                    }
                    // A missed keep-alive forces EPR exit via hard reset.
                    Err(_) => State::HardReset,
                }
            }
            State::BistCarrierMode(power_source) => {
                // The PHY transmits the carrier; leave after tBISTContMode.
                let power_source = *power_source;
                TimerType::get_timer::<TIMER>(TimerType::BISTContMode).await;
                self.device_policy_manager.notify(Event::BistExited).await;
                State::Ready(power_source, false)
            }
            State::BistTestData => {
                // Consume frames without protocol processing until a hard
                // reset or detach ends the test.
                loop {
                    let _ = self.protocol_layer.receive_message().await?;
                }
            }
            State::DataReset(power_source) => {
                // UFP side of Data_Reset: accept, then wait for the DFP to
                // complete the sequence while VConn cycles.
                let power_source = *power_source;
                self.protocol_layer
                    .transmit_control_message(ControlMessageType::Accept)
                    .await?;

                self.device_policy_manager.set_vconn(false).await;

                self.protocol_layer
                    .receive_message_type(
                        &[MessageType::Control(ControlMessageType::DataResetComplete)],
                        TimerType::DataResetComplete,
                    )
                    .await?;

                self.device_policy_manager.notify(Event::DataResetComplete).await;
                State::Ready(power_source, false)
            }
        };

        self.state = new_state;

        Ok(None)
    }
}
