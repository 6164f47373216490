//! The device policy manager (DPM) trait allows a device to control the
//! policy engine, and be informed about status changes.
//!
//! It replaces the callback vector of register-level stacks: every hook has
//! a default implementation that reports "unsupported" or does nothing, so
//! an application only implements what it cares about.
use core::future::Future;

use heapless::Vec;
use typec_pd_traits::RpLevel;

use crate::protocol_layer::message::data::alert::AlertDataObject;
use crate::protocol_layer::message::data::bist::BistMode;
use crate::protocol_layer::message::data::epr_mode::DataEnterFailed;
use crate::protocol_layer::message::data::sink_capabilities::SinkCapabilities;
use crate::protocol_layer::message::data::source_capabilities::SourceCapabilities;
use crate::protocol_layer::message::data::vendor_defined::{CableIdentity, VdmHeader};
use crate::protocol_layer::message::data::request;
use crate::units::Power;
use crate::{DataRole, PowerRole};

/// Kinds of role swaps a partner may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SwapKind {
    /// PR_Swap.
    Power,
    /// DR_Swap.
    Data,
    /// VCONN_Swap.
    Vconn,
    /// FR_Swap.
    FastRole,
}

/// Application verdict on a partner-initiated swap or similar AMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Disposition {
    /// Accept the sequence.
    Accept,
    /// Reject it.
    Reject,
    /// Ask the partner to retry later.
    Wait,
    /// Answer with Not_Supported.
    NotSupported,
}

/// Application verdict on a received power request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestDisposition {
    /// Accept and transition the supply.
    Accept,
    /// Reject the request.
    Reject,
    /// Accept later; the sink retries after tSinkRequest.
    Wait,
}

/// Requests that the device policy manager can send to the policy engine.
///
/// At most one request is serviced at a time; the engines poll for the next
/// one only in their Ready states.
#[derive(Debug)]
pub enum Request {
    /// Empty request.
    None,
    /// Request a certain power level (sink role).
    RequestPower(request::PowerSource),
    /// Request SPR source capabilities.
    RequestSprSourceCapabilities,
    /// Request EPR source capabilities (when already in EPR mode).
    RequestEprSourceCapabilities,
    /// Query the partner's sink capabilities (source role).
    GetSinkCapabilities,
    /// Enter EPR mode with the given operational PDP.
    EnterEprMode(Power),
    /// Exit EPR mode.
    ExitEprMode,
    /// Initiate a power role swap.
    PrSwap,
    /// Initiate a data role swap.
    DrSwap,
    /// Initiate a VConn swap.
    VconnSwap,
    /// Initiate a fast role swap (source role, on the FRS wire signal).
    FrSwap,
    /// Re-advertise capabilities after a configuration change.
    CapabilitiesChanged(SourceCapabilities),
    /// Ask the sink to draw minimum current (source role).
    GotoMin,
    /// Initiate a Data_Reset sequence.
    DataReset,
    /// Initiate a soft reset of the SOP conversation.
    SoftReset,
    /// Initiate a hard reset.
    HardReset,
}

/// Sub-status of a completed contract negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ContractStatus {
    /// An explicit contract is in place.
    Successful,
    /// Contract in place, but the selected PDO cannot satisfy the sink.
    CapabilityMismatch,
    /// Request rejected; a previous explicit contract remains valid.
    RejectedWithValidContract,
    /// Request rejected and no explicit contract exists.
    RejectedNoContract,
    /// Accept was received but PS_RDY never followed.
    PsRdyNotReceived,
    /// The source failed to send PS_RDY after its own Accept.
    PsRdyNotSent,
}

/// Completion status of an application request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestOutcome {
    /// The request was transmitted, no response expected.
    Sent,
    /// The expected response arrived.
    ResponseReceived,
    /// Transmission failed.
    Failed,
    /// The partner did not answer in time.
    Timeout,
    /// A detach or reset cancelled the sequence.
    Aborted,
    /// Another request is still in flight.
    Busy,
}

/// Hardware fault classes surfaced through the event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum FaultKind {
    VbusOverVoltage,
    VbusOverCurrent,
    VbusUnderVoltage,
    VbusShortCircuit,
    VbusReverseCurrent,
    OverTemperature,
    VconnOverCurrent,
    CcOverVoltage,
    SbuOverVoltage,
}

/// Events that the policy engine reports to the application.
///
/// This is the sole observable channel of the stack.
#[derive(Debug, Clone)]
#[non_exhaustive]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// A partner attached; PD negotiation may follow.
    Attached,
    /// The partner detached.
    Detached,
    /// Contract negotiation finished with the given sub-status.
    ContractNegotiationComplete(ContractStatus),
    /// Hard reset signalling was received.
    HardResetReceived,
    /// Hard reset signalling was sent.
    HardResetSent,
    /// The hard-reset sequence finished and the port re-starts.
    HardResetComplete,
    /// A soft reset was received on the SOP conversation.
    SoftResetReceived,
    /// A soft reset was sent.
    SoftResetSent,
    /// The partner did not answer within tSenderResponse.
    SenderResponseTimeout,
    /// No message was ever received within tNoResponse.
    NoResponseTimeout,
    /// Source capabilities went unanswered for the configured try count;
    /// the partner is treated as non-PD.
    SourceCapabilitiesUnanswered,
    /// Cable identity was discovered on SOP'.
    CableDetected(CableIdentity),
    /// The advertised Rp level changed.
    RpChanged(RpLevel),
    /// A data role swap completed; the new role is reported.
    DataRoleSwapped(DataRole),
    /// A power role swap completed; the new role is reported.
    PowerRoleSwapped(PowerRole),
    /// A VConn swap completed.
    VconnSwapComplete,
    /// A VConn swap failed.
    VconnSwapFailed,
    /// A fast role swap completed; the new role is reported.
    FastRoleSwapped(PowerRole),
    /// An Alert message arrived.
    AlertReceived(AlertDataObject),
    /// The partner asked to enter EPR mode.
    EprModeEnterReceived,
    /// EPR mode is active.
    EprModeEntered,
    /// EPR mode entry failed for the given cause.
    EprModeEnterFailed(DataEnterFailed),
    /// EPR mode was exited.
    EprModeExited,
    /// A Data_Reset was received.
    DataResetReceived,
    /// The Data_Reset sequence completed.
    DataResetComplete,
    /// A BIST mode was entered.
    BistEntered(BistMode),
    /// BIST mode left (via detach or hard reset).
    BistExited,
    /// VBUS appeared without a preceding attach.
    UnexpectedVbus,
    /// The port entered Type-C error recovery.
    ErrorRecovery,
    /// A hardware fault was recorded.
    Fault(FaultKind),
    /// An application request finished with the given outcome.
    RequestComplete(RequestOutcome),
}

/// Trait for the device policy manager.
///
/// This entity commands the policy engine and enforces device policy.
pub trait DevicePolicyManager {
    /// Inform the device about source capabilities, e.g. after a request.
    fn inform(&mut self, _source_capabilities: &SourceCapabilities) -> impl Future<Output = ()> {
        async {}
    }

    /// Request a power source.
    ///
    /// Defaults to 5 V at maximum current.
    fn request(&mut self, source_capabilities: &SourceCapabilities) -> impl Future<Output = request::PowerSource> {
        async {
            request::PowerSource::new_fixed(
                request::CurrentRequest::Highest,
                request::VoltageRequest::Safe5V,
                source_capabilities,
            )
            .unwrap_or(request::PowerSource::Unknown(request::RawDataObject(0)))
        }
    }

    /// Judge a power request received while sourcing.
    ///
    /// The protocol-level validity checks have already passed when this is
    /// called; the device may still refuse for policy reasons.
    fn evaluate_request(&mut self, _request: &request::PowerSource) -> impl Future<Output = RequestDisposition> {
        async { RequestDisposition::Accept }
    }

    /// Judge a partner-initiated role swap.
    fn evaluate_swap(&mut self, _kind: SwapKind) -> impl Future<Output = Disposition> {
        async { Disposition::NotSupported }
    }

    /// Judge a partner's EPR mode entry attempt against device policy.
    ///
    /// The cable and RDO/PDO gates are checked by the engine itself.
    fn evaluate_epr_entry(&mut self, _operational_pdp: Power) -> impl Future<Output = bool> {
        async { true }
    }

    /// Handle a vendor-defined message addressed to this port.
    ///
    /// Returns the response VDOs (starting with the VDM header word), or
    /// `None` to answer structured VDMs with NAK and ignore unstructured
    /// ones.
    fn handle_vdm(&mut self, _header: &VdmHeader, _objects: &[u32]) -> impl Future<Output = Option<Vec<u32, 7>>> {
        async { None }
    }

    /// Notify the device that it shall transition to a new power level.
    fn transition_power(&mut self, _accepted: &request::PowerSource) -> impl Future<Output = ()> {
        async {}
    }

    /// Set the source power path to the given output, and enable it.
    ///
    /// Called with vSafe5V on attach and after resets.
    fn psrc_enable(
        &mut self,
        _voltage: crate::units::ElectricPotential,
        _current: crate::units::ElectricCurrent,
    ) -> impl Future<Output = ()> {
        async {}
    }

    /// Disable the source power path (vSafe0V).
    fn psrc_disable(&mut self) -> impl Future<Output = ()> {
        async {}
    }

    /// Enable the sink power path.
    fn psnk_enable(&mut self) -> impl Future<Output = ()> {
        async {}
    }

    /// Disable the sink power path.
    fn psnk_disable(&mut self) -> impl Future<Output = ()> {
        async {}
    }

    /// Source or cut VConn.
    fn set_vconn(&mut self, _enable: bool) -> impl Future<Output = ()> {
        async {}
    }

    /// Whether this port currently sources VConn.
    fn vconn_is_present(&mut self) -> impl Future<Output = bool> {
        async { false }
    }

    /// Notify the device that a hard reset has occurred.
    ///
    /// The device shall transition to the default power level and should
    /// return when it has reached it.
    fn hard_reset(&mut self) -> impl Future<Output = ()> {
        async {}
    }

    /// The device's sink capabilities, sent in Get_Sink_Cap responses.
    fn sink_capabilities(&mut self) -> impl Future<Output = SinkCapabilities> {
        async { SinkCapabilities::new_vsafe5v_only(100) }
    }

    /// The policy engine polls for device requests when it is ready.
    ///
    /// By default, this is a future that never resolves.
    ///
    /// <div class="warning">
    /// The function must be safe to cancel: the engine races it against
    /// received messages and timers, and may drop it at any await point.
    /// </div>
    fn get_request(&mut self, _source_capabilities: &SourceCapabilities) -> impl Future<Output = Request> {
        async { core::future::pending().await }
    }

    /// Receive a status event.
    fn notify(&mut self, _event: Event) -> impl Future<Output = ()> {
        async {}
    }
}

impl<T: DevicePolicyManager> DevicePolicyManager for &mut T {
    fn inform(&mut self, source_capabilities: &SourceCapabilities) -> impl Future<Output = ()> {
        T::inform(self, source_capabilities)
    }

    fn request(&mut self, source_capabilities: &SourceCapabilities) -> impl Future<Output = request::PowerSource> {
        T::request(self, source_capabilities)
    }

    fn evaluate_request(&mut self, request: &request::PowerSource) -> impl Future<Output = RequestDisposition> {
        T::evaluate_request(self, request)
    }

    fn evaluate_swap(&mut self, kind: SwapKind) -> impl Future<Output = Disposition> {
        T::evaluate_swap(self, kind)
    }

    fn evaluate_epr_entry(&mut self, operational_pdp: Power) -> impl Future<Output = bool> {
        T::evaluate_epr_entry(self, operational_pdp)
    }

    fn handle_vdm(&mut self, header: &VdmHeader, objects: &[u32]) -> impl Future<Output = Option<Vec<u32, 7>>> {
        T::handle_vdm(self, header, objects)
    }

    fn transition_power(&mut self, accepted: &request::PowerSource) -> impl Future<Output = ()> {
        T::transition_power(self, accepted)
    }

    fn psrc_enable(
        &mut self,
        voltage: crate::units::ElectricPotential,
        current: crate::units::ElectricCurrent,
    ) -> impl Future<Output = ()> {
        T::psrc_enable(self, voltage, current)
    }

    fn psrc_disable(&mut self) -> impl Future<Output = ()> {
        T::psrc_disable(self)
    }

    fn psnk_enable(&mut self) -> impl Future<Output = ()> {
        T::psnk_enable(self)
    }

    fn psnk_disable(&mut self) -> impl Future<Output = ()> {
        T::psnk_disable(self)
    }

    fn set_vconn(&mut self, enable: bool) -> impl Future<Output = ()> {
        T::set_vconn(self, enable)
    }

    fn vconn_is_present(&mut self) -> impl Future<Output = bool> {
        T::vconn_is_present(self)
    }

    fn hard_reset(&mut self) -> impl Future<Output = ()> {
        T::hard_reset(self)
    }

    fn sink_capabilities(&mut self) -> impl Future<Output = SinkCapabilities> {
        T::sink_capabilities(self)
    }

    fn get_request(&mut self, source_capabilities: &SourceCapabilities) -> impl Future<Output = Request> {
        T::get_request(self, source_capabilities)
    }

    fn notify(&mut self, event: Event) -> impl Future<Output = ()> {
        T::notify(self, event)
    }
}
