//! Implements dummy drivers, timers and policies for testing.
use std::future::pending;
use std::vec::Vec;

use typec_pd_traits::{
    CcPull, CcStatus, DriverRxError, DriverTxError, PdDriver, Sop, TypeCDriver,
};

use crate::device_policy_manager::DevicePolicyManager;
use crate::protocol_layer::message::Message;
use crate::protocol_layer::message::data::source_capabilities::{
    Augmented, FixedSupply, PowerDataObject, SprProgrammablePowerSupply,
};
use crate::timers::Timer;

/// Maximum frame size the dummy driver transports.
pub const MAX_FRAME_SIZE: usize = 272;

/// Dummy capabilities to deserialize.
///
/// - Fixed 5 V at 3 A
/// - Fixed 9 V at 3 A
/// - Fixed 15 V at 3 A
/// - Fixed 20 V at 2.25 A
/// - PPS 3.3-11 V at 5 A
/// - PPS 3.3-16 V at 3 A
/// - PPS 3.3-21 V at 2.25 A
pub const DUMMY_CAPABILITIES: [u8; 30] = [
    0xA1, // Header
    0x71, // Header
    0x2c, // +
    0x91, // | Fixed 5V @ 3A
    0x01, // |
    0x08, // +
    0x2c, // +
    0xD1, // |
    0x02, // | Fixed 9V @ 3A
    0x00, // +
    0x2C, // +
    0xB1, // |
    0x04, // | Fixed 15V @ 3A
    0x00, // +
    0xE1, // +
    0x40, // |
    0x06, // | Fixed 20V @ 2.25A
    0x00, // +
    0x64, // +
    0x21, // |
    0xDC, // | PPS 3.3-11V @ 5A
    0xC8, // +
    0x3C, // +
    0x21, // |
    0x40, // | PPS 3.3-16V @ 3A
    0xC9, // +
    0x2D, // +
    0x21, // |
    0xA4, // | PPS 3.3-21V @ 2.25A
    0xC9, // +
];

/// The parsed counterpart of [`DUMMY_CAPABILITIES`].
pub fn dummy_source_capabilities() -> Vec<PowerDataObject> {
    vec![
        PowerDataObject::FixedSupply(
            FixedSupply::default()
                .with_raw_voltage(100)
                .with_raw_max_current(300)
                .with_unconstrained_power(true),
        ),
        PowerDataObject::FixedSupply(FixedSupply::default().with_raw_voltage(180).with_raw_max_current(300)),
        PowerDataObject::FixedSupply(FixedSupply::default().with_raw_voltage(300).with_raw_max_current(300)),
        PowerDataObject::FixedSupply(FixedSupply::default().with_raw_voltage(400).with_raw_max_current(225)),
        PowerDataObject::Augmented(Augmented::Spr(
            SprProgrammablePowerSupply::default()
                .with_raw_max_current(100)
                .with_raw_min_voltage(33)
                .with_raw_max_voltage(110)
                .with_pps_power_limited(true),
        )),
        PowerDataObject::Augmented(Augmented::Spr(
            SprProgrammablePowerSupply::default()
                .with_raw_max_current(60)
                .with_raw_min_voltage(33)
                .with_raw_max_voltage(160)
                .with_pps_power_limited(true),
        )),
        PowerDataObject::Augmented(Augmented::Spr(
            SprProgrammablePowerSupply::default()
                .with_raw_max_current(45)
                .with_raw_min_voltage(33)
                .with_raw_max_voltage(210)
                .with_pps_power_limited(true),
        )),
    ]
}

/// A dummy device that accepts every default policy.
pub struct DummySinkDevice {}

impl DevicePolicyManager for DummySinkDevice {}

/// A dummy device for the source role.
pub struct DummySourceDevice {}

impl DevicePolicyManager for DummySourceDevice {}

/// A timer for testing that never expires.
pub struct DummyTimer {}

impl Timer for DummyTimer {
    async fn after_millis(_milliseconds: u64) {
        pending().await
    }
}

/// A timer for testing that expires immediately.
pub struct InstantTimer {}

impl Timer for InstantTimer {
    async fn after_millis(_milliseconds: u64) {}
}

/// A dummy PD PHY for testing, with frame injection and probing.
pub struct DummyDriver<const N: usize> {
    rx_vec: Vec<(Sop, heapless::Vec<u8, N>)>,
    tx_vec: Vec<(Sop, heapless::Vec<u8, N>)>,
    hard_resets: usize,
}

impl<const N: usize> Default for DummyDriver<N> {
    fn default() -> Self {
        Self {
            rx_vec: Vec::new(),
            tx_vec: Vec::new(),
            hard_resets: 0,
        }
    }
}

impl<const N: usize> DummyDriver<N> {
    /// Create a new dummy driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject received data that the stack will read later.
    pub fn inject_received_data(&mut self, sop: Sop, data: &[u8]) {
        let mut vec = heapless::Vec::new();
        vec.extend_from_slice(data).unwrap();

        self.rx_vec.push((sop, vec));
    }

    /// Probe raw data that was transmitted by the stack.
    pub fn probe_transmitted_data(&mut self) -> (Sop, heapless::Vec<u8, N>) {
        self.tx_vec.remove(0)
    }

    /// Probe a transmitted frame, parsed back into a message.
    pub fn probe_transmitted_message(&mut self) -> Message {
        let (sop, data) = self.probe_transmitted_data();
        Message::from_bytes(&data, sop).unwrap()
    }

    /// Check if there is transmitted data available to probe.
    pub fn has_transmitted_data(&self) -> bool {
        !self.tx_vec.is_empty()
    }

    /// Number of hard resets the stack signalled.
    pub fn hard_resets(&self) -> usize {
        self.hard_resets
    }
}

impl<const N: usize> PdDriver for DummyDriver<N> {
    async fn receive(&mut self, buffer: &mut [u8]) -> Result<(Sop, usize), DriverRxError> {
        // Without pending data, wait indefinitely like real hardware would.
        if self.rx_vec.is_empty() {
            pending().await
        }

        let (sop, first) = self.rx_vec.remove(0);
        let len = first.len();
        buffer[..len].copy_from_slice(&first);

        Ok((sop, len))
    }

    async fn transmit(&mut self, sop: Sop, data: &[u8]) -> Result<(), DriverTxError> {
        let mut vec = heapless::Vec::new();
        vec.extend_from_slice(data).unwrap();
        self.tx_vec.push((sop, vec));

        Ok(())
    }

    async fn transmit_hard_reset(&mut self) -> Result<(), DriverTxError> {
        self.hard_resets += 1;
        Ok(())
    }

    async fn wait_for_vbus(&self) {
        // VBUS is always present.
    }
}

/// A CC driver for testing that reports a fixed line state.
pub struct DummyCcDriver {
    status: CcStatus,
    vbus: bool,
    /// The last termination the stack presented.
    pub pull: Option<CcPull>,
    /// VConn switch states per line, CC1 first.
    pub vconn: [bool; 2],
}

impl DummyCcDriver {
    /// Create a driver with the given static CC state.
    pub fn new(status: CcStatus, vbus: bool) -> Self {
        Self {
            status,
            vbus,
            pull: None,
            vconn: [false; 2],
        }
    }
}

impl TypeCDriver for DummyCcDriver {
    fn set_pull(&mut self, pull: CcPull) {
        self.pull = Some(pull);
    }

    fn cc_state(&mut self) -> CcStatus {
        self.status
    }

    async fn wait_for_cc_change(&mut self) {
        pending().await
    }

    fn vbus_present(&mut self) -> bool {
        self.vbus
    }

    async fn wait_for_vbus_change(&mut self) {
        pending().await
    }

    fn set_vconn(&mut self, line: typec_pd_traits::CcLine, enable: bool) {
        let index = match line {
            typec_pd_traits::CcLine::Cc1 => 0,
            typec_pd_traits::CcLine::Cc2 => 1,
        };
        self.vconn[index] = enable;
    }
}
