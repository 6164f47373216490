//! Timers that are used by the protocol layer, the Type-C state machine and
//! the policy engine.
use core::future::Future;

use crate::protocol_layer::message::header::SpecificationRevision;

/// The timer trait to implement by the user application.
pub trait Timer {
    /// Expire after the specified number of milliseconds.
    fn after_millis(milliseconds: u64) -> impl Future<Output = ()>;
}

/// Types of timers that are used for timeouts.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerType {
    // Type-C connection timers.
    CCDebounce,
    PDDebounce,
    RdDebounce,
    SrcDisconnect,
    DrpToggle,
    DrpTry,
    TryTimeout,
    ErrorRecovery,

    // Protocol layer timers.
    CRCReceive,
    ChunkSenderRequest,
    ChunkSenderResponse,
    ChunkingNotSupported,
    BISTContMode,
    HardResetComplete,
    HardResetTx,

    // Policy engine timers, both roles.
    NoResponse,
    SenderResponseR2_0,
    SenderResponseR3_X,
    CableDiscovery,
    DiscoverIdentity,
    DataReset,
    DataResetComplete,
    DataResetDfpDelay,
    PSHardReset,
    SwapSourceStart,
    VconnOff,
    VconnOn,
    VconnDischarge,

    // Sink role.
    SinkWaitCap,
    SinkRequest,
    SinkTx,
    SinkPPSPeriodic,
    SinkEPREnter,
    SinkEPRKeepAlive,
    SinkVbusTurnOff,
    SinkVbusTurnOn,
    PSTransitionSpr,
    PSTransitionEpr,
    PSSourceOff,
    PSSourceOn,

    // Source role.
    SourceCapability,
    SourceReady,
    SourceTransitionSpr,
    SourceTransitionEpr,
    SourceRecover,
    SourceRecoverEpr,
    SourceEPRKeepAlive,
    SourcePPSComm,
    VBusOn,
    VBusOnEpr,
    VBusOff,
    FRSwap,
}

impl TimerType {
    /// Get a timer future for a given type.
    ///
    /// Times out after a duration that is given by the USB PD and Type-C
    /// specifications.
    pub fn get_timer<TIMER: Timer>(timer_type: TimerType) -> impl Future<Output = ()> {
        TIMER::after_millis(timer_type.period_ms())
    }

    /// The sender-response timer depends on the negotiated revision:
    /// 27 ms under PD 2.0, 30 ms under PD 3.x.
    pub fn sender_response(revision: SpecificationRevision) -> TimerType {
        match revision {
            SpecificationRevision::R1_0 | SpecificationRevision::R2_0 => TimerType::SenderResponseR2_0,
            SpecificationRevision::R3_X => TimerType::SenderResponseR3_X,
        }
    }

    /// The timeout period in milliseconds.
    pub fn period_ms(self) -> u64 {
        match self {
            TimerType::CCDebounce => 140,
            TimerType::PDDebounce => 11,
            TimerType::RdDebounce => 12,
            TimerType::SrcDisconnect => 2,
            TimerType::DrpToggle => 75,
            TimerType::DrpTry => 110,
            TimerType::TryTimeout => 800,
            TimerType::ErrorRecovery => 250,

            TimerType::CRCReceive => 3,
            TimerType::ChunkSenderRequest => 27,
            TimerType::ChunkSenderResponse => 27,
            TimerType::ChunkingNotSupported => 45,
            TimerType::BISTContMode => 45,
            TimerType::HardResetComplete => 5,
            TimerType::HardResetTx => 20,

            TimerType::NoResponse => 5000,
            TimerType::SenderResponseR2_0 => 27,
            TimerType::SenderResponseR3_X => 30,
            TimerType::CableDiscovery => 49,
            TimerType::DiscoverIdentity => 45,
            TimerType::DataReset => 220,
            TimerType::DataResetComplete => 250,
            TimerType::DataResetDfpDelay => 225,
            TimerType::PSHardReset => 27,
            TimerType::SwapSourceStart => 20,
            TimerType::VconnOff => 25,
            TimerType::VconnOn => 100,
            TimerType::VconnDischarge => 200,

            TimerType::SinkWaitCap => 400,
            TimerType::SinkRequest => 100,
            TimerType::SinkTx => 18,
            TimerType::SinkPPSPeriodic => 5000,
            TimerType::SinkEPREnter => 500,
            TimerType::SinkEPRKeepAlive => 375,
            TimerType::SinkVbusTurnOff => 750,
            TimerType::SinkVbusTurnOn => 1300,
            TimerType::PSTransitionSpr => 500,
            TimerType::PSTransitionEpr => 925,
            TimerType::PSSourceOff => 900,
            TimerType::PSSourceOn => 450,

            TimerType::SourceCapability => 180,
            TimerType::SourceReady => 285,
            TimerType::SourceTransitionSpr => 400,
            TimerType::SourceTransitionEpr => 860,
            TimerType::SourceRecover => 800,
            TimerType::SourceRecoverEpr => 1250,
            TimerType::SourceEPRKeepAlive => 900,
            TimerType::SourcePPSComm => 13500,
            TimerType::VBusOn => 275,
            TimerType::VBusOnEpr => 700,
            TimerType::VBusOff => 625,
            TimerType::FRSwap => 15,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TimerType;
    use crate::protocol_layer::message::header::SpecificationRevision;

    #[test]
    fn sender_response_follows_revision() {
        assert_eq!(
            TimerType::sender_response(SpecificationRevision::R2_0).period_ms(),
            27
        );
        assert_eq!(
            TimerType::sender_response(SpecificationRevision::R3_X).period_ms(),
            30
        );
    }
}
