//! Hardware traits for the `typec-pd` USB-PD port stack.
//!
//! Two seams separate the protocol core from silicon:
//! - [`PdDriver`], through which the protocol layer talks to the BMC PHY,
//! - [`TypeCDriver`], through which the Type-C connection state machine
//!   controls the CC terminations and observes CC/VBUS.
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
use core::future::Future;

/// Packet classes on the CC wire.
///
/// SOP is addressed to the port partner, SOP' and SOP'' to the near-end and
/// far-end cable markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Sop {
    /// Port partner.
    Sop,
    /// Near-end cable marker.
    SopPrime,
    /// Far-end cable marker.
    SopDoublePrime,
}

impl Sop {
    /// Index for per-SOP bookkeeping tables.
    pub const fn index(self) -> usize {
        match self {
            Sop::Sop => 0,
            Sop::SopPrime => 1,
            Sop::SopDoublePrime => 2,
        }
    }

    /// Number of packet classes.
    pub const COUNT: usize = 3;
}

/// Receive Error.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverRxError {
    /// Received message discarded, e.g. due to CRC errors.
    Discarded,

    /// Hard Reset received before or during reception.
    HardReset,
}

/// Transmit Error.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverTxError {
    /// Concurrent receive in progress or excessive noise on the line.
    Discarded,

    /// Hard Reset received before or during transmission.
    HardReset,
}

/// Driver trait, through which the protocol layer talks to the PHY.
pub trait PdDriver {
    /// If this is `true`, the protocol layer will not send its own
    /// GoodCRC messages and will instead rely on the hardware.
    const HAS_AUTO_GOOD_CRC: bool = false;

    /// If this is `true`, the hardware automatically retries transmission
    /// when no GoodCRC is received, and the protocol layer skips its own
    /// retry loop.
    const HAS_AUTO_RETRY: bool = false;

    /// Wait for availability of VBus voltage.
    fn wait_for_vbus(&self) -> impl Future<Output = ()>;

    /// Wait for VBus to reach vSafe0V.
    ///
    /// Drivers without VBus sensing may leave the default, which resolves
    /// immediately.
    fn wait_for_vbus_absent(&self) -> impl Future<Output = ()> {
        async {}
    }

    /// Receive a packet, reporting its packet class and length.
    fn receive(&mut self, buffer: &mut [u8]) -> impl Future<Output = Result<(Sop, usize), DriverRxError>>;

    /// Transmit a packet towards the given packet class.
    fn transmit(&mut self, sop: Sop, data: &[u8]) -> impl Future<Output = Result<(), DriverTxError>>;

    /// Transmit a hard reset signal.
    fn transmit_hard_reset(&mut self) -> impl Future<Output = Result<(), DriverTxError>>;

    /// Transmit a cable reset signal on SOP'.
    fn transmit_cable_reset(&mut self) -> impl Future<Output = Result<(), DriverTxError>> {
        self.transmit_hard_reset()
    }

    /// Drive the fast-role-swap wire signal.
    ///
    /// Only meaningful for FRS-capable hardware; the default does nothing.
    fn signal_fast_role_swap(&mut self) -> impl Future<Output = ()> {
        async {}
    }
}

impl<T: PdDriver> PdDriver for &mut T {
    const HAS_AUTO_GOOD_CRC: bool = T::HAS_AUTO_GOOD_CRC;
    const HAS_AUTO_RETRY: bool = T::HAS_AUTO_RETRY;

    fn wait_for_vbus(&self) -> impl Future<Output = ()> {
        T::wait_for_vbus(self)
    }

    fn wait_for_vbus_absent(&self) -> impl Future<Output = ()> {
        T::wait_for_vbus_absent(self)
    }

    fn receive(&mut self, buffer: &mut [u8]) -> impl Future<Output = Result<(Sop, usize), DriverRxError>> {
        T::receive(self, buffer)
    }

    fn transmit(&mut self, sop: Sop, data: &[u8]) -> impl Future<Output = Result<(), DriverTxError>> {
        T::transmit(self, sop, data)
    }

    fn transmit_hard_reset(&mut self) -> impl Future<Output = Result<(), DriverTxError>> {
        T::transmit_hard_reset(self)
    }

    fn transmit_cable_reset(&mut self) -> impl Future<Output = Result<(), DriverTxError>> {
        T::transmit_cable_reset(self)
    }

    fn signal_fast_role_swap(&mut self) -> impl Future<Output = ()> {
        T::signal_fast_role_swap(self)
    }
}

/// The two CC lines of a receptacle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcLine {
    /// CC1 pin.
    Cc1,
    /// CC2 pin.
    Cc2,
}

impl CcLine {
    /// The other CC line.
    pub const fn other(self) -> Self {
        match self {
            CcLine::Cc1 => CcLine::Cc2,
            CcLine::Cc2 => CcLine::Cc1,
        }
    }
}

/// Advertised Rp current level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RpLevel {
    /// Default USB current (500/900 mA).
    Default,
    /// 1.5 A. Doubles as SinkTxNG during a PD 3.x AMS.
    Rp1A5,
    /// 3.0 A. Doubles as SinkTxOk.
    Rp3A0,
}

/// CC termination presented by this port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcPull {
    /// High impedance on both lines.
    Open,
    /// Pull-down (sink presentation).
    Rd,
    /// Pull-up (source presentation) at the given current advertisement.
    Rp(RpLevel),
}

/// Termination sensed on a single CC line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcTermination {
    /// Nothing attached, or the partner presents nothing on this line.
    Open,
    /// Accessory/cable-marker termination.
    Ra,
    /// Sink pull-down.
    Rd,
    /// Source pull-up, default current.
    RpDefault,
    /// Source pull-up, 1.5 A.
    Rp1A5,
    /// Source pull-up, 3.0 A.
    Rp3A0,
}

impl CcTermination {
    /// Whether this reading is any source pull-up.
    pub const fn is_rp(self) -> bool {
        matches!(self, CcTermination::RpDefault | CcTermination::Rp1A5 | CcTermination::Rp3A0)
    }
}

/// Snapshot of both CC lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CcStatus {
    /// Termination sensed on CC1.
    pub cc1: CcTermination,
    /// Termination sensed on CC2.
    pub cc2: CcTermination,
}

impl CcStatus {
    /// Both lines open.
    pub const OPEN: CcStatus = CcStatus {
        cc1: CcTermination::Open,
        cc2: CcTermination::Open,
    };

    /// Read one line by identity.
    pub const fn line(&self, line: CcLine) -> CcTermination {
        match line {
            CcLine::Cc1 => self.cc1,
            CcLine::Cc2 => self.cc2,
        }
    }
}

/// Driver trait for CC termination control and CC/VBUS sensing.
///
/// The Type-C state machine is the only user. Implementations sample the
/// CC comparators and VBUS divider of the port controller.
pub trait TypeCDriver {
    /// Present a termination on the CC lines.
    fn set_pull(&mut self, pull: CcPull);

    /// Change the advertised Rp current without dropping the pull-up.
    fn set_rp_level(&mut self, level: RpLevel) {
        self.set_pull(CcPull::Rp(level));
    }

    /// Sample both CC lines.
    fn cc_state(&mut self) -> CcStatus;

    /// Resolve when the sensed CC state changes from the last sample.
    fn wait_for_cc_change(&mut self) -> impl Future<Output = ()>;

    /// Whether VBUS is above vSafe5V minimum.
    fn vbus_present(&mut self) -> bool;

    /// Resolve when VBUS presence changes.
    fn wait_for_vbus_change(&mut self) -> impl Future<Output = ()>;

    /// Resolve when either the CC state or VBUS presence changes.
    ///
    /// The default only watches CC; drivers with VBUS interrupts should
    /// override it so that a sink notices supply loss promptly.
    fn wait_for_cc_or_vbus_change(&mut self) -> impl Future<Output = ()> {
        self.wait_for_cc_change()
    }

    /// Source or cut VConn on the given CC line.
    fn set_vconn(&mut self, line: CcLine, enable: bool);

    /// Switch the VBUS discharge path.
    fn discharge_vbus(&mut self, _enable: bool) {}
}
