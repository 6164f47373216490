//! USB Type-C and USB Power Delivery port stack.
//!
//! The stack is layered bottom-up as
//! - [`soft_timer`] and [`timers`] for protocol timing,
//! - [`protocol_layer`] for message framing, identification and retry,
//! - [`type_c`] for the connection (attach/detach) state machine,
//! - [`policy_engine`] for PD contract negotiation in both roles,
//! - [`port`] as the device policy manager façade that the application runs.
//!
//! Hardware access goes through the traits in the `typec-pd-traits` crate;
//! application policy goes through [`device_policy_manager`].
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

mod fmt;

pub mod config;
pub mod counters;
pub mod device_policy_manager;
pub mod policy_engine;
pub mod port;
pub mod protocol_layer;
pub mod soft_timer;
pub mod timers;
pub mod type_c;

#[cfg(test)]
pub mod dummy;

#[macro_use]
extern crate uom;

pub use typec_pd_traits::Sop;

/// Unit system for wire-level electrical quantities, backed by `u32`.
pub mod units {
    ISQ!(
        uom::si,
        u32,
        (millimeter, kilogram, second, milliampere, kelvin, mole, candela)
    );
}

pub(crate) mod _50milliamperes_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_current;

        @_50milliamperes: 0.05; "_50mA", "_50milliamps", "_50milliamps";
    }
}

pub(crate) mod _50millivolts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_potential;

        @_50millivolts: 0.05; "_50mV", "_50millivolts", "_50millivolts";
    }
}

pub(crate) mod _20millivolts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_potential;

        @_20millivolts: 0.02; "_20mV", "_20millivolts", "_20millivolts";
    }
}

pub(crate) mod _100millivolts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_potential;

        @_100millivolts: 0.1; "_100mV", "_100millivolts", "_100millivolts";
    }
}

pub(crate) mod _250milliwatts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::power;

        @_250milliwatts: 0.25; "_250mW", "_250milliwatts", "_250milliwatts";
    }
}

/// The power role of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerRole {
    /// Supplies power on VBUS.
    Source,
    /// Consumes power from VBUS.
    Sink,
}

impl PowerRole {
    /// The opposite power role.
    pub const fn other(self) -> Self {
        match self {
            PowerRole::Source => PowerRole::Sink,
            PowerRole::Sink => PowerRole::Source,
        }
    }
}

impl From<bool> for PowerRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Sink,
            true => Self::Source,
        }
    }
}

impl From<PowerRole> for bool {
    fn from(role: PowerRole) -> bool {
        match role {
            PowerRole::Sink => false,
            PowerRole::Source => true,
        }
    }
}

/// The data role of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataRole {
    /// Upstream-facing port.
    Ufp,
    /// Downstream-facing port.
    Dfp,
}

impl DataRole {
    /// The opposite data role.
    pub const fn other(self) -> Self {
        match self {
            DataRole::Ufp => DataRole::Dfp,
            DataRole::Dfp => DataRole::Ufp,
        }
    }
}

impl From<bool> for DataRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Ufp,
            true => Self::Dfp,
        }
    }
}

impl From<DataRole> for bool {
    fn from(role: DataRole) -> bool {
        match role {
            DataRole::Ufp => false,
            DataRole::Dfp => true,
        }
    }
}
