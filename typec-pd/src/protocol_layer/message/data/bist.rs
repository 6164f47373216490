//! Definitions of BIST data message content.
//!
//! See USB PD spec, [6.4.3].
use byteorder::{ByteOrder, LittleEndian};
use proc_bitfield::bitfield;

/// BIST modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BistMode {
    /// Continuous BMC carrier.
    CarrierMode2,
    /// Consume test frames without protocol processing.
    TestData,
    /// Shared-capacity test mode entry (PD 3.2).
    SharedTestModeEntry,
    /// Shared-capacity test mode exit (PD 3.2).
    SharedTestModeExit,
    /// Any other (reserved or vendor) mode.
    Reserved,
}

impl From<u8> for BistMode {
    fn from(value: u8) -> Self {
        match value {
            5 => BistMode::CarrierMode2,
            8 => BistMode::TestData,
            9 => BistMode::SharedTestModeEntry,
            10 => BistMode::SharedTestModeExit,
            _ => BistMode::Reserved,
        }
    }
}

impl From<BistMode> for u8 {
    fn from(value: BistMode) -> Self {
        match value {
            BistMode::CarrierMode2 => 5,
            BistMode::TestData => 8,
            BistMode::SharedTestModeEntry => 9,
            BistMode::SharedTestModeExit => 10,
            BistMode::Reserved => 0,
        }
    }
}

bitfield! {
    /// The BIST data object.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct BistDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// The test mode to enter.
        pub mode: u8 [BistMode] @ 28..=31,
    }
}

impl Default for BistDataObject {
    fn default() -> Self {
        Self(0)
    }
}

impl BistDataObject {
    /// Serialize, returning the written size.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }
}
