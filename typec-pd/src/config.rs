//! Static per-port configuration.
//!
//! A [`PortConfig`] is constructed programmatically or parsed from the
//! little-endian configuration blob produced by board provisioning tools.
//! It is immutable while the port runs; capability changes go through the
//! device policy manager's capabilities-changed request.
use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;
use typec_pd_traits::RpLevel;

use crate::PowerRole;
use crate::protocol_layer::message::header::SpecificationRevision;

/// Hard maximum of SPR PDOs per role.
pub const MAX_SPR_PDOS: usize = 7;

/// Hard maximum of EPR PDOs per role.
pub const MAX_EPR_PDOS: usize = 6;

/// Length of the extended source/sink capability payloads.
pub const EXT_CAP_LEN: usize = 25;

/// Length of the manufacturer name field, including the terminator.
pub const MFG_NAME_LEN: usize = 22;

const BLOB_SIGNATURE: &[u8; 4] = b"PDSC";
const BLOB_LEN: usize = 242;

/// The role a port is allowed to take on the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortRole {
    /// Sink only.
    Sink,
    /// Source only.
    Source,
    /// Dual-role, toggling between presentations while unattached.
    Drp,
}

/// Preferred-role behaviour of a dual-role port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TryMode {
    /// No preference.
    #[default]
    None,
    /// Prefer sourcing: bounce through Try.SRC on sink attach.
    TrySrc,
    /// Prefer sinking: bounce through Try.SNK on source attach.
    TrySnk,
}

/// Policy for choosing a PDO out of the partner's capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PdoSelection {
    /// Maximise available power.
    #[default]
    HighestPower,
    /// Maximise available current.
    HighestCurrent,
    /// Maximise voltage.
    HighestVoltage,
}

/// A sink operating-current entry paired with its give-back flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SinkMinMax(pub u16);

impl SinkMinMax {
    /// Whether the give-back flag is set for this entry.
    pub fn give_back(self) -> bool {
        self.0 & 0x8000 != 0
    }

    /// The minimum/maximum operating current value in 10 mA units.
    pub fn value(self) -> u16 {
        self.0 & 0x03FF
    }
}

/// Errors produced when parsing or validating a configuration.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// The blob does not begin with the `PDSC` signature.
    #[error("bad configuration signature")]
    BadSignature,
    /// The blob is shorter than the fixed layout.
    #[error("configuration truncated: expected `{expected}`, found `{found}`")]
    Truncated {
        /// Required length in bytes.
        expected: usize,
        /// Provided length in bytes.
        found: usize,
    },
    /// The port-role byte is out of range.
    #[error("invalid port role `{0}`")]
    InvalidRole(u8),
    /// The Rp-level byte is out of range.
    #[error("invalid Rp current level `{0}`")]
    InvalidRpLevel(u8),
    /// The manufacturer-info length is outside 0 or 5..=26.
    #[error("invalid manufacturer info length `{0}`")]
    InvalidManufacturerInfoLength(u8),
    /// A source-capable role is configured without source PDOs.
    #[error("source role without source PDOs")]
    NoSourcePdos,
    /// A sink-capable role is configured without sink PDOs.
    #[error("sink role without sink PDOs")]
    NoSinkPdos,
}

/// Static, per-port configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PortConfig {
    /// Configuration layout version, major.minor in 8.8 form.
    pub version: u16,
    /// Allowed connector role.
    pub role: PortRole,
    /// Role a DRP starts toggling from.
    pub default_role: PowerRole,
    /// Advertised Rp current level while sourcing.
    pub rp_level: RpLevel,
    /// Bitmask of Rp levels the hardware supports.
    pub rp_supported: u8,
    /// DRP toggling while unattached.
    pub drp_toggle_enabled: bool,
    /// Share of the DRP period spent presenting Rp, in percent (≥ 30).
    pub drp_source_duty_percent: u8,
    /// Whether PD operation is enabled at all.
    pub pd_enabled: bool,
    /// Highest PD revision to operate at.
    pub pd_revision: SpecificationRevision,
    /// Preferred-role bounce behaviour.
    pub try_mode: TryMode,
    /// Port administratively disabled.
    pub port_disabled: bool,

    /// SOP' discovery at source attach.
    pub cable_discovery_enabled: bool,
    /// Discover_Identity attempts towards the cable marker.
    pub cable_discovery_count: u8,

    /// Dead-battery attach supported.
    pub dead_battery: bool,
    /// Enter ErrorRecovery on faults instead of latching off.
    pub error_recovery_enabled: bool,
    /// Audio/debug accessory detection.
    pub accessory_enabled: bool,
    /// Keep Rp asserted through detach handling.
    pub rp_detach_enabled: bool,
    /// Retain VConn while in a powered-off contract.
    pub vconn_retain: bool,
    /// Fast-role-swap reception accepted.
    pub frs_rx_enabled: bool,
    /// Fast-role-swap signalling transmitted.
    pub frs_tx_enabled: bool,
    /// Accept BIST shared-test-mode entry (PD 3.2).
    pub bist_stm_enabled: bool,

    /// Source PDOs, raw 32-bit words.
    pub src_pdos: Vec<u32, MAX_SPR_PDOS>,
    /// Bitmask of enabled source PDOs.
    pub src_pdo_mask: u8,
    /// Sink PDOs, raw 32-bit words.
    pub snk_pdos: Vec<u32, MAX_SPR_PDOS>,
    /// Bitmask of enabled sink PDOs.
    pub snk_pdo_mask: u8,
    /// Per-sink-PDO operating current bounds.
    pub snk_min_max: Vec<SinkMinMax, MAX_SPR_PDOS>,

    /// EPR source PDOs.
    pub epr_src_pdos: Vec<u32, MAX_EPR_PDOS>,
    /// Bitmask of enabled EPR source PDOs.
    pub epr_src_pdo_mask: u8,
    /// EPR sink PDOs.
    pub epr_snk_pdos: Vec<u32, MAX_EPR_PDOS>,
    /// Bitmask of enabled EPR sink PDOs.
    pub epr_snk_pdo_mask: u8,

    /// Selection policy used by the default request evaluation.
    pub pdo_selection: PdoSelection,

    /// USB-IF vendor ID.
    pub vid: u16,
    /// Product ID.
    pub pid: u16,
    /// Null-terminated manufacturer name.
    pub mfg_name: [u8; MFG_NAME_LEN],
    /// Manufacturer-info length advertised in Manufacturer_Info replies.
    pub mfg_info_len: u8,
    /// Extended source capabilities payload, when advertised.
    pub ext_src_cap: Option<[u8; EXT_CAP_LEN]>,
    /// Extended sink capabilities payload, when advertised.
    pub ext_snk_cap: Option<[u8; EXT_CAP_LEN]>,
    /// Canned Get_Revision response word.
    pub get_revision: u32,
    /// Canned Get_Source_Info response word.
    pub get_source_info: u32,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            version: 0x0100,
            role: PortRole::Sink,
            default_role: PowerRole::Sink,
            rp_level: RpLevel::Default,
            rp_supported: 0b111,
            drp_toggle_enabled: false,
            drp_source_duty_percent: 50,
            pd_enabled: true,
            pd_revision: SpecificationRevision::R3_X,
            try_mode: TryMode::None,
            port_disabled: false,
            cable_discovery_enabled: true,
            cable_discovery_count: 20,
            dead_battery: false,
            error_recovery_enabled: true,
            accessory_enabled: false,
            rp_detach_enabled: false,
            vconn_retain: false,
            frs_rx_enabled: false,
            frs_tx_enabled: false,
            bist_stm_enabled: false,
            src_pdos: Vec::new(),
            src_pdo_mask: 0,
            snk_pdos: Vec::new(),
            snk_pdo_mask: 0,
            snk_min_max: Vec::new(),
            epr_src_pdos: Vec::new(),
            epr_src_pdo_mask: 0,
            epr_snk_pdos: Vec::new(),
            epr_snk_pdo_mask: 0,
            pdo_selection: PdoSelection::HighestPower,
            vid: 0,
            pid: 0,
            mfg_name: [0; MFG_NAME_LEN],
            mfg_info_len: 0,
            ext_src_cap: None,
            ext_snk_cap: None,
            get_revision: 0,
            get_source_info: 0,
        }
    }
}

fn collect_pdos<const N: usize>(blob: &[u8], offset: usize, count: usize) -> Vec<u32, N> {
    let mut pdos = Vec::new();
    for index in 0..count.min(N) {
        let word = LittleEndian::read_u32(&blob[offset + 4 * index..]);
        // The count is already clamped to capacity.
        _ = pdos.push(word);
    }
    pdos
}

impl PortConfig {
    /// Parse a configuration blob.
    ///
    /// The layout is fixed and little-endian; PDO counts are clamped to the
    /// hard maxima (7 SPR, 6 EPR) rather than rejected.
    pub fn from_blob(blob: &[u8]) -> Result<Self, ConfigError> {
        if blob.len() < BLOB_LEN {
            return Err(ConfigError::Truncated {
                expected: BLOB_LEN,
                found: blob.len(),
            });
        }

        if &blob[0..4] != BLOB_SIGNATURE {
            return Err(ConfigError::BadSignature);
        }

        let mfg_info_len = blob[6];
        if mfg_info_len != 0 && !(5..=26).contains(&mfg_info_len) {
            return Err(ConfigError::InvalidManufacturerInfoLength(mfg_info_len));
        }

        let role = match blob[86] {
            0 => PortRole::Sink,
            1 => PortRole::Source,
            2 => PortRole::Drp,
            other => return Err(ConfigError::InvalidRole(other)),
        };

        let default_role = match blob[87] {
            0 => PowerRole::Sink,
            1 => PowerRole::Source,
            other => return Err(ConfigError::InvalidRole(other)),
        };

        let rp_level = match blob[88] {
            0 => RpLevel::Default,
            1 => RpLevel::Rp1A5,
            2 => RpLevel::Rp3A0,
            other => return Err(ConfigError::InvalidRpLevel(other)),
        };

        let try_mode = match blob[97] {
            1 => TryMode::TrySrc,
            2 => TryMode::TrySnk,
            _ => TryMode::None,
        };

        let src_pdo_count = (blob[106] as usize).min(MAX_SPR_PDOS);
        let snk_pdo_count = (blob[108] as usize).min(MAX_SPR_PDOS);
        let epr_src_pdo_count = (blob[190] as usize).min(MAX_EPR_PDOS);
        let epr_snk_pdo_count = (blob[192] as usize).min(MAX_EPR_PDOS);

        let mut snk_min_max = Vec::new();
        for index in 0..snk_pdo_count {
            _ = snk_min_max.push(SinkMinMax(LittleEndian::read_u16(&blob[166 + 2 * index..])));
        }

        let mut mfg_name = [0u8; MFG_NAME_LEN];
        mfg_name.copy_from_slice(&blob[12..12 + MFG_NAME_LEN]);

        let ext_src_cap = (blob[34] != 0).then(|| {
            let mut cap = [0u8; EXT_CAP_LEN];
            cap.copy_from_slice(&blob[36..36 + EXT_CAP_LEN]);
            cap
        });
        let ext_snk_cap = (blob[35] != 0).then(|| {
            let mut cap = [0u8; EXT_CAP_LEN];
            cap.copy_from_slice(&blob[61..61 + EXT_CAP_LEN]);
            cap
        });

        let frs_config = blob[105];

        let config = Self {
            version: LittleEndian::read_u16(&blob[4..]),
            role,
            default_role,
            rp_level,
            rp_supported: blob[95],
            drp_toggle_enabled: blob[94] != 0,
            pd_enabled: blob[96] != 0,
            try_mode,
            port_disabled: blob[98] != 0,
            cable_discovery_enabled: blob[99] != 0,
            cable_discovery_count: blob[89],
            dead_battery: blob[100] != 0,
            error_recovery_enabled: blob[101] != 0,
            accessory_enabled: blob[102] != 0,
            rp_detach_enabled: blob[103] != 0,
            vconn_retain: blob[104] != 0,
            frs_rx_enabled: frs_config & 0b01 != 0,
            frs_tx_enabled: frs_config & 0b10 != 0,
            src_pdos: collect_pdos(blob, 110, src_pdo_count),
            src_pdo_mask: blob[107],
            snk_pdos: collect_pdos(blob, 138, snk_pdo_count),
            snk_pdo_mask: blob[109],
            snk_min_max,
            epr_src_pdos: collect_pdos(blob, 194, epr_src_pdo_count),
            epr_src_pdo_mask: blob[191],
            epr_snk_pdos: collect_pdos(blob, 218, epr_snk_pdo_count),
            epr_snk_pdo_mask: blob[193],
            vid: LittleEndian::read_u16(&blob[8..]),
            pid: LittleEndian::read_u16(&blob[10..]),
            mfg_name,
            mfg_info_len,
            ext_src_cap,
            ext_snk_cap,
            get_revision: LittleEndian::read_u32(&blob[182..]),
            get_source_info: LittleEndian::read_u32(&blob[186..]),
            ..Default::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Check role/PDO consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pd_enabled {
            if matches!(self.role, PortRole::Source | PortRole::Drp) && self.enabled_source_pdos().next().is_none() {
                return Err(ConfigError::NoSourcePdos);
            }
            if matches!(self.role, PortRole::Sink | PortRole::Drp) && self.enabled_sink_pdos().next().is_none() {
                return Err(ConfigError::NoSinkPdos);
            }
        }

        Ok(())
    }

    /// The source PDOs enabled by the mask, in advertisement order.
    pub fn enabled_source_pdos(&self) -> impl Iterator<Item = u32> + '_ {
        let mask = self.src_pdo_mask;
        self.src_pdos
            .iter()
            .enumerate()
            .filter(move |(index, _)| mask & (1 << index) != 0)
            .map(|(_, pdo)| *pdo)
    }

    /// The sink PDOs enabled by the mask, in advertisement order.
    pub fn enabled_sink_pdos(&self) -> impl Iterator<Item = u32> + '_ {
        let mask = self.snk_pdo_mask;
        self.snk_pdos
            .iter()
            .enumerate()
            .filter(move |(index, _)| mask & (1 << index) != 0)
            .map(|(_, pdo)| *pdo)
    }

    /// The EPR source PDOs enabled by the mask.
    pub fn enabled_epr_source_pdos(&self) -> impl Iterator<Item = u32> + '_ {
        let mask = self.epr_src_pdo_mask;
        self.epr_src_pdos
            .iter()
            .enumerate()
            .filter(move |(index, _)| mask & (1 << index) != 0)
            .map(|(_, pdo)| *pdo)
    }

    /// The EPR sink PDOs enabled by the mask.
    pub fn enabled_epr_sink_pdos(&self) -> impl Iterator<Item = u32> + '_ {
        let mask = self.epr_snk_pdo_mask;
        self.epr_snk_pdos
            .iter()
            .enumerate()
            .filter(move |(index, _)| mask & (1 << index) != 0)
            .map(|(_, pdo)| *pdo)
    }

    /// Whether EPR operation is configured for the given role.
    pub fn epr_capable(&self, role: PowerRole) -> bool {
        match role {
            PowerRole::Source => self.enabled_epr_source_pdos().next().is_some(),
            PowerRole::Sink => self.enabled_epr_sink_pdos().next().is_some(),
        }
    }

    /// The DRP source duty cycle, clamped to the 30 % minimum.
    pub fn drp_source_duty(&self) -> u8 {
        self.drp_source_duty_percent.clamp(30, 70)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A 5 V / 900 mA fixed source PDO.
    const PDO_5V_900MA: u32 = 0x0001_905A;
    /// A 5 V / 3 A fixed sink PDO.
    const PDO_SNK_5V_3A: u32 = 0x0001_912C;

    fn build_blob() -> [u8; BLOB_LEN] {
        let mut blob = [0u8; BLOB_LEN];
        blob[0..4].copy_from_slice(b"PDSC");
        LittleEndian::write_u16(&mut blob[4..], 0x0201);
        blob[6] = 10; // mfg info length
        LittleEndian::write_u16(&mut blob[8..], 0x04B4);
        LittleEndian::write_u16(&mut blob[10..], 0x1234);
        blob[12..17].copy_from_slice(b"ACME\0");
        blob[86] = 2; // DRP
        blob[87] = 1; // default source
        blob[88] = 2; // 3 A Rp
        blob[89] = 20; // cable discovery attempts
        blob[94] = 1; // DRP toggle
        blob[95] = 0b111;
        blob[96] = 1; // PD enabled
        blob[97] = 1; // Try.SRC
        blob[99] = 1; // cable discovery
        blob[101] = 1; // error recovery
        blob[105] = 0b11; // FRS rx + tx

        blob[106] = 9; // source PDO count, clamps to 7
        blob[107] = 0x7F;
        blob[108] = 1;
        blob[109] = 0x01;
        for index in 0..7 {
            LittleEndian::write_u32(&mut blob[110 + 4 * index..], PDO_5V_900MA);
        }
        LittleEndian::write_u32(&mut blob[138..], PDO_SNK_5V_3A);
        LittleEndian::write_u16(&mut blob[166..], 0x8000 | 300);

        LittleEndian::write_u32(&mut blob[182..], 0x0003_0200);
        blob[190] = 2; // EPR source PDOs
        blob[191] = 0b11;
        LittleEndian::write_u32(&mut blob[194..], 0x0005_0F00);
        LittleEndian::write_u32(&mut blob[198..], 0x0006_0F00);
        blob
    }

    #[test]
    fn parses_and_clamps() {
        let config = PortConfig::from_blob(&build_blob()).unwrap();

        assert_eq!(config.version, 0x0201);
        assert_eq!(config.role, PortRole::Drp);
        assert_eq!(config.default_role, PowerRole::Source);
        assert_eq!(config.rp_level, RpLevel::Rp3A0);
        assert_eq!(config.try_mode, TryMode::TrySrc);
        assert_eq!(config.vid, 0x04B4);
        assert!(config.frs_rx_enabled && config.frs_tx_enabled);

        // Count 9 in the blob clamps to the 7-PDO maximum.
        assert_eq!(config.src_pdos.len(), 7);
        assert_eq!(config.enabled_source_pdos().count(), 7);
        assert_eq!(config.snk_pdos.len(), 1);
        assert!(config.snk_min_max[0].give_back());
        assert_eq!(config.snk_min_max[0].value(), 300);

        assert_eq!(config.epr_src_pdos.len(), 2);
        assert!(config.epr_capable(PowerRole::Source));
        assert!(!config.epr_capable(PowerRole::Sink));
    }

    #[test]
    fn rejects_bad_signature() {
        let mut blob = build_blob();
        blob[0] = b'X';
        assert_eq!(PortConfig::from_blob(&blob), Err(ConfigError::BadSignature));
    }

    #[test]
    fn rejects_truncated_blob() {
        let blob = build_blob();
        assert!(matches!(
            PortConfig::from_blob(&blob[..100]),
            Err(ConfigError::Truncated { .. })
        ));
    }

    #[test]
    fn source_role_requires_pdos() {
        let mut blob = build_blob();
        blob[107] = 0; // mask disables every source PDO
        assert_eq!(PortConfig::from_blob(&blob), Err(ConfigError::NoSourcePdos));
    }

    #[test]
    fn mfg_info_length_bounds() {
        let mut blob = build_blob();
        blob[6] = 3;
        assert_eq!(
            PortConfig::from_blob(&blob),
            Err(ConfigError::InvalidManufacturerInfoLength(3))
        );
    }
}
