//! Definitions of vendor-defined message (VDM) content.
//!
//! The stack itself only speaks structured VDMs for cable identity
//! discovery on SOP'; everything else is passed through to the
//! application's VDM handler.
use byteorder::{ByteOrder, LittleEndian};
use proc_bitfield::bitfield;

/// Standard SVID addressed by structured VDMs of the PD specification.
pub const SVID_PD_STANDARD: u16 = 0xFF00;
/// DisplayPort alternate mode SVID.
pub const SVID_DISPLAYPORT: u16 = 0xFF01;
/// Thunderbolt alternate mode SVID.
pub const SVID_THUNDERBOLT: u16 = 0x8087;
/// Apple alternate mode SVID.
pub const SVID_APPLE: u16 = 0x05AC;
/// Infineon vendor SVID.
pub const SVID_INFINEON: u16 = 0x04B4;

/// Structured or unstructured VDM discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VdmType {
    /// Vendor-private payload.
    Unstructured,
    /// Structured VDM per the PD specification.
    Structured,
}

impl From<VdmType> for bool {
    fn from(value: VdmType) -> Self {
        matches!(value, VdmType::Structured)
    }
}

impl From<bool> for VdmType {
    fn from(value: bool) -> Self {
        match value {
            true => VdmType::Structured,
            false => VdmType::Unstructured,
        }
    }
}

/// Command type of a structured VDM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum VdmCommandType {
    InitiatorReq,
    ResponderAck,
    ResponderNak,
    ResponderBsy,
}

impl From<VdmCommandType> for u8 {
    fn from(value: VdmCommandType) -> Self {
        match value {
            VdmCommandType::InitiatorReq => 0,
            VdmCommandType::ResponderAck => 1,
            VdmCommandType::ResponderNak => 2,
            VdmCommandType::ResponderBsy => 3,
        }
    }
}

impl From<u8> for VdmCommandType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0 => VdmCommandType::InitiatorReq,
            1 => VdmCommandType::ResponderAck,
            2 => VdmCommandType::ResponderNak,
            _ => VdmCommandType::ResponderBsy,
        }
    }
}

/// Structured VDM commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum VdmCommand {
    DiscoverIdentity,
    DiscoverSvids,
    DiscoverModes,
    EnterMode,
    ExitMode,
    Attention,
    Other(u8),
}

impl From<VdmCommand> for u8 {
    fn from(value: VdmCommand) -> Self {
        match value {
            VdmCommand::DiscoverIdentity => 0x1,
            VdmCommand::DiscoverSvids => 0x2,
            VdmCommand::DiscoverModes => 0x3,
            VdmCommand::EnterMode => 0x4,
            VdmCommand::ExitMode => 0x5,
            VdmCommand::Attention => 0x6,
            VdmCommand::Other(x) => x,
        }
    }
}

impl From<u8> for VdmCommand {
    fn from(value: u8) -> Self {
        match value {
            0x01 => VdmCommand::DiscoverIdentity,
            0x02 => VdmCommand::DiscoverSvids,
            0x03 => VdmCommand::DiscoverModes,
            0x04 => VdmCommand::EnterMode,
            0x05 => VdmCommand::ExitMode,
            0x06 => VdmCommand::Attention,
            x => VdmCommand::Other(x),
        }
    }
}

/// Major version of the structured VDM protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VdmVersionMajor {
    /// Version 1.0, used with PD 2.0 partners.
    Version10,
    /// Version 2.x, used with PD 3.x partners.
    Version2x,
}

impl From<VdmVersionMajor> for u8 {
    fn from(value: VdmVersionMajor) -> Self {
        match value {
            VdmVersionMajor::Version10 => 0b00,
            VdmVersionMajor::Version2x => 0b01,
        }
    }
}

impl From<u8> for VdmVersionMajor {
    fn from(value: u8) -> Self {
        match value & 0b01 {
            0b00 => VdmVersionMajor::Version10,
            _ => VdmVersionMajor::Version2x,
        }
    }
}

/// A VDM header, typed by its structured bit.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum VdmHeader {
    /// Structured VDM header.
    Structured(VdmHeaderStructured),
    /// Unstructured VDM header.
    Unstructured(VdmHeaderUnstructured),
}

impl VdmHeader {
    /// Serialize, returning the written size.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        match self {
            VdmHeader::Structured(header) => header.to_bytes(buf),
            VdmHeader::Unstructured(header) => header.to_bytes(buf),
        }
    }

    /// The raw header word.
    pub fn raw(self) -> u32 {
        match self {
            VdmHeader::Structured(header) => header.0,
            VdmHeader::Unstructured(header) => header.0,
        }
    }
}

impl From<u32> for VdmHeader {
    fn from(value: u32) -> Self {
        let header = VdmHeaderRaw(value);
        match header.vdm_type() {
            VdmType::Structured => VdmHeader::Structured(VdmHeaderStructured(value)),
            VdmType::Unstructured => VdmHeader::Unstructured(VdmHeaderUnstructured(value)),
        }
    }
}

bitfield! {
    /// Discriminator view of a VDM header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct VdmHeaderRaw(pub u32): FromStorage, IntoStorage {
        /// VDM Standard or Vendor ID
        pub standard_or_vid: u16 @ 16..=31,
        /// VDM Type (Unstructured/Structured)
        pub vdm_type: bool [VdmType] @ 15,
    }
}

bitfield! {
    /// A structured VDM header.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct VdmHeaderStructured(pub u32): FromStorage, IntoStorage {
        /// VDM Standard or Vendor ID
        pub standard_or_vid: u16 @ 16..=31,
        /// VDM Type (Unstructured/Structured)
        pub vdm_type: bool [VdmType] @ 15,
        /// Structured VDM version, major
        pub vdm_version_major: u8 [VdmVersionMajor] @ 13..=14,
        /// Structured VDM version, minor
        pub vdm_version_minor: u8 @ 11..=12,
        /// Object Position
        pub object_position: u8 @ 8..=10,
        /// Command Type
        pub command_type: u8 [VdmCommandType] @ 6..=7,
        /// Command
        pub command: u8 [VdmCommand] @ 0..=4,
    }
}

impl VdmHeaderStructured {
    /// Serialize, returning the written size.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }

    /// A Discover_Identity request towards the PD standard SVID.
    pub fn discover_identity(version: VdmVersionMajor) -> Self {
        Self::default()
            .with_standard_or_vid(SVID_PD_STANDARD)
            .with_vdm_version_major(version)
            .with_command_type(VdmCommandType::InitiatorReq)
            .with_command(VdmCommand::DiscoverIdentity)
    }
}

impl Default for VdmHeaderStructured {
    fn default() -> Self {
        VdmHeaderStructured(0).with_vdm_type(VdmType::Structured)
    }
}

bitfield! {
    /// An unstructured VDM header; all bits below the type are vendor use.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct VdmHeaderUnstructured(pub u32): FromStorage, IntoStorage {
        /// VDM Standard or Vendor ID
        pub standard_or_vid: u16 @ 16..=31,
        /// VDM Type (Unstructured/Structured)
        pub vdm_type: bool [VdmType] @ 15,
        /// Vendor-defined payload bits.
        pub data: u16 @ 0..=14,
    }
}

impl VdmHeaderUnstructured {
    /// Serialize, returning the written size.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }
}

bitfield! {
    /// The ID header VDO of a Discover_Identity response.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct IdHeaderVdo(pub u32): FromStorage, IntoStorage {
        /// USB communications capable as a host.
        pub usb_host_capable: bool @ 31,
        /// USB communications capable as a device.
        pub usb_device_capable: bool @ 30,
        /// Product type in the UFP data role (or cable plug type on SOP').
        pub product_type_ufp: u8 @ 27..=29,
        /// Supports modal operation.
        pub modal_operation: bool @ 26,
        /// Product type in the DFP data role.
        pub product_type_dfp: u8 @ 23..=25,
        /// Receptacle (10b) or plug (11b).
        pub connector_type: u8 @ 21..=22,
        /// USB-IF assigned vendor ID.
        pub vid: u16 @ 0..=15,
    }
}

/// SOP' product types reported in the ID header.
#[allow(missing_docs)]
pub mod cable_product_type {
    pub const PASSIVE_CABLE: u8 = 0b011;
    pub const ACTIVE_CABLE: u8 = 0b100;
    pub const VPD: u8 = 0b110;
}

bitfield! {
    /// The passive cable VDO of a SOP' Discover_Identity response.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct PassiveCableVdo(pub u32): FromStorage, IntoStorage {
        /// HW version, assigned by the VID owner.
        pub hw_version: u8 @ 28..=31,
        /// Firmware version, assigned by the VID owner.
        pub fw_version: u8 @ 24..=27,
        /// VDO version.
        pub vdo_version: u8 @ 21..=23,
        /// Plug (10b) or captive (11b).
        pub plug_type: u8 @ 18..=19,
        /// Cable qualifies for EPR operation.
        pub epr_mode_capable: bool @ 17,
        /// Cable latency class.
        pub cable_latency: u8 @ 13..=16,
        /// Termination type.
        pub termination: u8 @ 11..=12,
        /// Maximum VBUS voltage: 00b 20 V, 01b 30 V, 10b 40 V, 11b 50 V.
        pub max_vbus_voltage: u8 @ 9..=10,
        /// VBUS current capability: 01b 3 A, 10b 5 A.
        pub vbus_current_capability: u8 @ 5..=6,
        /// Highest USB speed mode.
        pub usb_speed: u8 @ 0..=2,
    }
}

impl PassiveCableVdo {
    /// Whether the cable supports 5 A VBUS current.
    pub fn supports_5a(&self) -> bool {
        self.vbus_current_capability() == 0b10
    }
}

/// Cable identity recorded after SOP' discovery.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CableIdentity {
    /// The ID header VDO.
    pub id_header: Option<IdHeaderVdo>,
    /// The cable VDO (passive layout; active cables share the flag bits the
    /// stack consumes).
    pub cable_vdo: Option<PassiveCableVdo>,
}

impl CableIdentity {
    /// Whether the identified cable qualifies for EPR operation.
    pub fn epr_capable(&self) -> bool {
        self.cable_vdo.map(|vdo| vdo.epr_mode_capable()).unwrap_or(false)
    }
}
