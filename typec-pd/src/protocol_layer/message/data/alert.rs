//! Definitions of Alert data message content.
//!
//! See USB PD spec, [6.4.6].
use byteorder::{ByteOrder, LittleEndian};
use proc_bitfield::bitfield;

bitfield! {
    /// The alert data object.
    ///
    /// The type-of-alert field is a bitmask; several conditions may be
    /// reported at once.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct AlertDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// Extended alert event.
        pub extended_alert: bool @ 31,
        /// Over-voltage protection triggered.
        pub ovp: bool @ 30,
        /// Operating condition changed (e.g. current limit).
        pub operating_condition_change: bool @ 29,
        /// Source input changed.
        pub source_input_change: bool @ 28,
        /// Over-temperature protection triggered.
        pub otp: bool @ 27,
        /// Over-current protection triggered.
        pub ocp: bool @ 26,
        /// Battery status changed.
        pub battery_status_change: bool @ 25,
        /// Which fixed batteries changed.
        pub fixed_batteries: u8 @ 20..=23,
        /// Which hot-swappable battery slots changed.
        pub hot_swappable_batteries: u8 @ 16..=19,
        /// Extended alert event type.
        pub extended_alert_type: u8 @ 0..=3,
    }
}

impl Default for AlertDataObject {
    fn default() -> Self {
        Self(0)
    }
}

impl AlertDataObject {
    /// Serialize, returning the written size.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }
}
