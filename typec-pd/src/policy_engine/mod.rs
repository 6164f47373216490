//! The PD policy engines for both power roles.
//!
//! Each engine is an explicit state machine advanced by `run_step`, which
//! maps protocol-layer errors onto recovery states (soft reset, hard reset)
//! and otherwise lets `update_state` walk the negotiation sequences.
//!
//! The engines only run while the Type-C state machine reports an attached
//! partner; the [`crate::port`] module races them against detach.
pub mod sink;
pub mod source;

use crate::protocol_layer::ProtocolError;

/// Why a policy engine returned instead of running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EngineOutcome {
    /// A power role swap completed; the port continues in the other role
    /// without dropping the connection.
    PowerRoleSwapped,
    /// The partner never acknowledged PD traffic; the connection stays
    /// Type-C only.
    NonPdPartner,
}

/// Errors that can occur in the policy engine state machines.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The port partner is unresponsive.
    PortPartnerUnresponsive,
    /// A protocol error has occured.
    Protocol(ProtocolError),
}

impl From<ProtocolError> for Error {
    fn from(protocol_error: ProtocolError) -> Self {
        Error::Protocol(protocol_error)
    }
}
