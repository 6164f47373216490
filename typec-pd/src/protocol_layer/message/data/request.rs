//! Definitions of request message content.
//!
//! Sinks build request data objects (RDOs) out of the source's advertised
//! capabilities; sources validate received RDOs against what they offered.
use byteorder::{ByteOrder, LittleEndian};
use proc_bitfield::bitfield;
use uom::si::electric_current::centiampere;

use super::source_capabilities::{self, Augmented, PowerDataObject, SourceCapabilities};
use crate::_20millivolts_mod::_20millivolts;
use crate::_50milliamperes_mod::_50milliamperes;
use crate::_250milliwatts_mod::_250milliwatts;
use crate::config::PdoSelection;
use crate::protocol_layer::message::header::DataMessageType;
use crate::units::{ElectricCurrent, ElectricPotential, Power};

bitfield! {
    /// Type-agnostic view of an RDO; only the object position is universal.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct RawDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14
        pub object_position: u8 @ 28..=31,
    }
}

bitfield! {
    /// RDO towards a fixed or variable supply PDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct FixedVariableSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14
        pub object_position: u8 @ 28..=31,
        /// Give-back support.
        pub giveback_flag: bool @ 27,
        /// Set when the selected PDO cannot satisfy the sink.
        pub capability_mismatch: bool @ 26,
        /// USB communications capable.
        pub usb_communications_capable: bool @ 25,
        /// Request to ignore USB suspend.
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported.
        pub unchunked_extended_messages_supported: bool @ 23,
        /// EPR mode capable.
        pub epr_mode_capable: bool @ 22,
        /// Operating current in 10 mA units.
        pub raw_operating_current: u16 @ 10..=19,
        /// Maximum (or, with give-back, minimum) current in 10 mA units.
        pub raw_max_operating_current: u16 @ 0..=9,
    }
}

impl FixedVariableSupply {
    /// Serialize, returning the written size.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }

    /// The requested operating current.
    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_operating_current().into())
    }

    /// The requested maximum operating current.
    pub fn max_operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_max_operating_current().into())
    }
}

bitfield! {
    /// RDO towards a battery supply PDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct Battery(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14
        pub object_position: u8 @ 28..=31,
        /// Give-back support.
        pub giveback_flag: bool @ 27,
        /// Capability mismatch.
        pub capability_mismatch: bool @ 26,
        /// USB communications capable.
        pub usb_communications_capable: bool @ 25,
        /// Request to ignore USB suspend.
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported.
        pub unchunked_extended_messages_supported: bool @ 23,
        /// EPR mode capable.
        pub epr_mode_capable: bool @ 22,
        /// Operating power in 250 mW units.
        pub raw_operating_power: u16 @ 10..=19,
        /// Maximum operating power in 250 mW units.
        pub raw_max_operating_power: u16 @ 0..=9,
    }
}

impl Battery {
    /// Serialize, returning the written size.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }

    /// The requested operating power.
    pub fn operating_power(&self) -> Power {
        Power::new::<_250milliwatts>(self.raw_operating_power().into())
    }

    /// The requested maximum operating power.
    pub fn max_operating_power(&self) -> Power {
        Power::new::<_250milliwatts>(self.raw_max_operating_power().into())
    }
}

bitfield!(
    /// RDO towards a programmable power supply APDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct Pps(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14
        pub object_position: u8 @ 28..=31,
        /// Capability mismatch.
        pub capability_mismatch: bool @ 26,
        /// USB communications capable.
        pub usb_communications_capable: bool @ 25,
        /// Request to ignore USB suspend.
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported.
        pub unchunked_extended_messages_supported: bool @ 23,
        /// EPR mode capable.
        pub epr_mode_capable: bool @ 22,
        /// Output voltage in 20 mV units.
        pub raw_output_voltage: u16 @ 9..=20,
        /// Operating current in 50 mA units.
        pub raw_operating_current: u16 @ 0..=6,
    }
);

impl Pps {
    /// Serialize, returning the written size.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }

    /// The requested output voltage.
    pub fn output_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_20millivolts>(self.raw_output_voltage().into())
    }

    /// The requested operating current.
    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<_50milliamperes>(self.raw_operating_current().into())
    }
}

bitfield!(
    /// RDO towards an adjustable voltage supply APDO.
    ///
    /// The two voltage LSBs shall be zero, giving the 100 mV effective step.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct Avs(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14
        pub object_position: u8 @ 28..=31,
        /// Capability mismatch.
        pub capability_mismatch: bool @ 26,
        /// USB communications capable.
        pub usb_communications_capable: bool @ 25,
        /// Request to ignore USB suspend.
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported.
        pub unchunked_extended_messages_supported: bool @ 23,
        /// EPR mode capable.
        pub epr_mode_capable: bool @ 22,
        /// Output voltage in 20 mV units.
        pub raw_output_voltage: u16 @ 9..=20,
        /// Operating current in 50 mA units.
        pub raw_operating_current: u16 @ 0..=6,
    }
);

impl Avs {
    /// Serialize, returning the written size.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }

    /// The requested output voltage.
    pub fn output_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_20millivolts>(self.raw_output_voltage().into())
    }

    /// The requested operating current.
    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<_50milliamperes>(self.raw_operating_current().into())
    }
}

/// An EPR request carries the RDO plus a copy of the requested PDO.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EprRequestDataObject {
    /// The raw request data object.
    pub rdo: u32,
    /// The PDO the request refers to, mirrored verbatim.
    pub pdo: PowerDataObject,
}

impl EprRequestDataObject {
    /// The 1-indexed object position from the RDO.
    pub fn object_position(&self) -> u8 {
        RawDataObject(self.rdo).object_position()
    }

    /// Serialize both data objects, returning the written size.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.rdo);
        LittleEndian::write_u32(&mut buf[4..], self.pdo.raw());
        8
    }
}

/// Power requests towards the source.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerSource {
    /// Request towards a fixed or variable supply.
    FixedVariableSupply(FixedVariableSupply),
    /// Request towards a battery supply.
    Battery(Battery),
    /// Request towards a PPS APDO.
    Pps(Pps),
    /// Request towards an AVS APDO.
    Avs(Avs),
    /// EPR request with the mirrored PDO.
    EprRequest(EprRequestDataObject),
    /// A request whose target PDO kind is not known yet.
    Unknown(RawDataObject),
}

/// Errors that can occur when building a request.
#[derive(Debug)]
#[non_exhaustive]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A requested (specific) voltage does not exist in the PDOs.
    VoltageMismatch,
}

/// Source-side validation failures for a received request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestCheckError {
    /// The object position does not address an advertised PDO.
    InvalidObjectPosition(u8),
    /// The operating current exceeds the advertised maximum.
    ExceedsCurrent,
    /// The operating power exceeds the advertised maximum.
    ExceedsPower,
    /// The requested voltage is outside the APDO's range.
    VoltageOutOfRange,
    /// The PDO mirrored in an EPR request does not match the advertisement.
    EprMirrorMismatch,
}

/// Requestable voltage levels.
#[derive(Debug)]
pub enum VoltageRequest {
    /// The safe 5 V supply.
    Safe5V,
    /// The highest voltage that the source can supply.
    Highest,
    /// A specific voltage.
    Specific(ElectricPotential),
}

/// Requestable currents.
#[derive(Debug)]
pub enum CurrentRequest {
    /// The highest current that the source can supply.
    Highest,
    /// A specific current.
    Specific(ElectricCurrent),
}

impl PowerSource {
    /// The 1-indexed object position the request addresses.
    pub fn object_position(&self) -> u8 {
        match self {
            PowerSource::FixedVariableSupply(p) => p.object_position(),
            PowerSource::Battery(p) => p.object_position(),
            PowerSource::Pps(p) => p.object_position(),
            PowerSource::Avs(p) => p.object_position(),
            PowerSource::EprRequest(p) => p.object_position(),
            PowerSource::Unknown(p) => p.object_position(),
        }
    }

    /// The raw RDO word.
    pub fn rdo(&self) -> u32 {
        match self {
            PowerSource::FixedVariableSupply(p) => p.0,
            PowerSource::Battery(p) => p.0,
            PowerSource::Pps(p) => p.0,
            PowerSource::Avs(p) => p.0,
            PowerSource::EprRequest(p) => p.rdo,
            PowerSource::Unknown(p) => p.0,
        }
    }

    /// The data message type that carries this request.
    pub fn message_type(&self) -> DataMessageType {
        match self {
            PowerSource::EprRequest(_) => DataMessageType::EprRequest,
            _ => DataMessageType::Request,
        }
    }

    /// The number of data objects this request serializes to.
    pub fn num_objects(&self) -> u8 {
        match self {
            PowerSource::EprRequest(_) => 2,
            _ => 1,
        }
    }

    /// Type a raw RDO against the capabilities it was issued for.
    pub fn interpret(raw: RawDataObject, source_capabilities: &SourceCapabilities) -> Self {
        match source_capabilities
            .at_object_position(raw.object_position())
            .and_then(PowerDataObject::kind)
        {
            Some(source_capabilities::Kind::FixedSupply | source_capabilities::Kind::VariableSupply) => {
                PowerSource::FixedVariableSupply(FixedVariableSupply(raw.0))
            }
            Some(source_capabilities::Kind::Battery) => PowerSource::Battery(Battery(raw.0)),
            Some(source_capabilities::Kind::Pps) => PowerSource::Pps(Pps(raw.0)),
            Some(source_capabilities::Kind::Avs) => PowerSource::Avs(Avs(raw.0)),
            None => PowerSource::Unknown(raw),
        }
    }

    /// Validate a request against the capabilities that were advertised.
    ///
    /// Used by a source when negotiating a contract. Mismatches lead to a
    /// Reject; only the EPR PDO-mirror mismatch escalates further.
    pub fn validate(&self, advertised: &SourceCapabilities) -> Result<(), RequestCheckError> {
        let position = self.object_position();
        let Some(pdo) = advertised.at_object_position(position) else {
            return Err(RequestCheckError::InvalidObjectPosition(position));
        };

        match (self, pdo) {
            (PowerSource::FixedVariableSupply(rdo), PowerDataObject::FixedSupply(supply)) => {
                if rdo.operating_current() > supply.max_current() {
                    return Err(RequestCheckError::ExceedsCurrent);
                }
            }
            (PowerSource::FixedVariableSupply(rdo), PowerDataObject::VariableSupply(supply)) => {
                if rdo.operating_current() > supply.max_current() {
                    return Err(RequestCheckError::ExceedsCurrent);
                }
            }
            (PowerSource::Battery(rdo), PowerDataObject::Battery(supply)) => {
                if rdo.operating_power() > supply.max_power() {
                    return Err(RequestCheckError::ExceedsPower);
                }
            }
            (PowerSource::Pps(rdo), PowerDataObject::Augmented(Augmented::Spr(supply))) => {
                if rdo.output_voltage() < supply.min_voltage() || rdo.output_voltage() > supply.max_voltage() {
                    return Err(RequestCheckError::VoltageOutOfRange);
                }
                if rdo.operating_current() > supply.max_current() {
                    return Err(RequestCheckError::ExceedsCurrent);
                }
            }
            (PowerSource::Avs(rdo), PowerDataObject::Augmented(Augmented::Epr(supply))) => {
                if rdo.output_voltage() < supply.min_voltage() || rdo.output_voltage() > supply.max_voltage() {
                    return Err(RequestCheckError::VoltageOutOfRange);
                }
            }
            (PowerSource::EprRequest(request), advertised_pdo) => {
                if request.pdo != *advertised_pdo {
                    return Err(RequestCheckError::EprMirrorMismatch);
                }

                // The embedded RDO must also fit the mirrored PDO.
                let inner = PowerSource::interpret(RawDataObject(request.rdo), advertised);
                if !matches!(inner, PowerSource::EprRequest(_) | PowerSource::Unknown(_)) {
                    inner.validate(advertised)?;
                }
            }
            _ => return Err(RequestCheckError::InvalidObjectPosition(position)),
        }

        Ok(())
    }

    /// Find the highest fixed voltage in the source capabilities.
    fn find_highest_fixed_voltage(
        source_capabilities: &SourceCapabilities,
    ) -> Option<(usize, &source_capabilities::FixedSupply)> {
        let mut selected_pdo: Option<(usize, &source_capabilities::FixedSupply)> = None;

        for (index, cap) in source_capabilities.pdos().iter().enumerate().take(7) {
            if let PowerDataObject::FixedSupply(fixed_supply) = cap {
                selected_pdo = match selected_pdo {
                    Some((_, best)) if fixed_supply.voltage() <= best.voltage() => selected_pdo,
                    _ => Some((index, fixed_supply)),
                };
            }
        }

        selected_pdo
    }

    /// Find a specific fixed voltage within the source capabilities.
    fn find_specific_fixed_voltage(
        source_capabilities: &SourceCapabilities,
        voltage: ElectricPotential,
    ) -> Option<(usize, &source_capabilities::FixedSupply)> {
        source_capabilities
            .pdos()
            .iter()
            .enumerate()
            .take(7)
            .find_map(|(index, cap)| match cap {
                PowerDataObject::FixedSupply(fixed_supply) if fixed_supply.voltage() == voltage => {
                    Some((index, fixed_supply))
                }
                _ => None,
            })
    }

    /// Build a fixed-supply request out of the given RDO parameters.
    fn build_fixed(index: usize, raw_current: u16, mismatch: bool) -> Self {
        let object_position = index + 1;
        debug_assert!(object_position > 0b0000 && object_position <= 0b1110);

        Self::FixedVariableSupply(
            FixedVariableSupply(0)
                .with_raw_operating_current(raw_current)
                .with_raw_max_operating_current(raw_current)
                .with_object_position(object_position as u8)
                .with_capability_mismatch(mismatch)
                .with_no_usb_suspend(true)
                .with_usb_communications_capable(true),
        )
    }

    /// Create a new power source request for a fixed supply.
    ///
    /// Finds a suitable PDO by evaluating the provided current and voltage
    /// requests against the source capabilities.
    pub fn new_fixed(
        current_request: CurrentRequest,
        voltage_request: VoltageRequest,
        source_capabilities: &SourceCapabilities,
    ) -> Result<Self, Error> {
        let selected = match voltage_request {
            VoltageRequest::Safe5V => source_capabilities.vsafe_5v().map(|supply| (0, supply)),
            VoltageRequest::Highest => Self::find_highest_fixed_voltage(source_capabilities),
            VoltageRequest::Specific(x) => Self::find_specific_fixed_voltage(source_capabilities, x),
        };

        let Some((index, supply)) = selected else {
            return Err(Error::VoltageMismatch);
        };

        let (current, mismatch) = match current_request {
            CurrentRequest::Highest => (supply.max_current(), false),
            CurrentRequest::Specific(x) => (x, x > supply.max_current()),
        };

        let mut raw_current = current.get::<centiampere>() as u16;

        if raw_current > 0x3ff {
            error!("Clamping invalid current: {} mA", 10 * raw_current);
            raw_current = 0x3ff;
        }

        Ok(Self::build_fixed(index, raw_current, mismatch))
    }

    /// Create a new power source request for a programmable power supply.
    pub fn new_pps(
        current_request: CurrentRequest,
        voltage: ElectricPotential,
        source_capabilities: &SourceCapabilities,
    ) -> Result<Self, Error> {
        let selected = source_capabilities
            .pdos()
            .iter()
            .enumerate()
            .take(7)
            .find_map(|(index, cap)| match cap {
                PowerDataObject::Augmented(Augmented::Spr(spr))
                    if spr.min_voltage() <= voltage && spr.max_voltage() >= voltage =>
                {
                    Some((index, spr))
                }
                _ => None,
            });

        let Some((index, supply)) = selected else {
            trace!("Could not find suitable PPS voltage");
            return Err(Error::VoltageMismatch);
        };

        let (current, mismatch) = match current_request {
            CurrentRequest::Highest => (supply.max_current(), false),
            CurrentRequest::Specific(x) => (x, x > supply.max_current()),
        };

        let mut raw_current = current.get::<_50milliamperes>() as u16;
        if raw_current > 0x7f {
            error!("Clamping invalid current: {} mA", 50 * raw_current);
            raw_current = 0x7f;
        }

        let object_position = index + 1;
        debug_assert!(object_position > 0b0000 && object_position <= 0b1110);

        Ok(Self::Pps(
            Pps(0)
                .with_raw_output_voltage(voltage.get::<_20millivolts>() as u16)
                .with_raw_operating_current(raw_current)
                .with_object_position(object_position as u8)
                .with_capability_mismatch(mismatch)
                .with_no_usb_suspend(true)
                .with_usb_communications_capable(true),
        ))
    }

    /// Create an EPR request for a fixed EPR PDO at the given position.
    pub fn new_epr_fixed(position: u8, pdo: PowerDataObject) -> Self {
        let raw_current = match pdo {
            PowerDataObject::FixedSupply(fixed) => fixed.raw_max_current(),
            _ => 0,
        };

        let rdo = FixedVariableSupply(0)
            .with_object_position(position)
            .with_raw_operating_current(raw_current)
            .with_raw_max_operating_current(raw_current)
            .with_epr_mode_capable(true)
            .with_no_usb_suspend(true)
            .with_usb_communications_capable(true);

        Self::EprRequest(EprRequestDataObject { rdo: rdo.0, pdo })
    }

    /// Select a fixed supply according to the configured policy.
    pub fn select(policy: PdoSelection, source_capabilities: &SourceCapabilities) -> Result<Self, Error> {
        let mut best: Option<(usize, &source_capabilities::FixedSupply)> = None;

        for (index, cap) in source_capabilities.pdos().iter().enumerate().take(7) {
            let PowerDataObject::FixedSupply(fixed) = cap else {
                continue;
            };

            let better = match (policy, best) {
                (_, None) => true,
                (PdoSelection::HighestPower, Some((_, b))) => {
                    fixed.voltage() * fixed.max_current() > b.voltage() * b.max_current()
                }
                (PdoSelection::HighestCurrent, Some((_, b))) => fixed.max_current() > b.max_current(),
                (PdoSelection::HighestVoltage, Some((_, b))) => fixed.voltage() > b.voltage(),
            };

            if better {
                best = Some((index, fixed));
            }
        }

        let Some((index, supply)) = best else {
            return Err(Error::VoltageMismatch);
        };

        Ok(Self::build_fixed(index, supply.raw_max_current(), false))
    }
}
