//! The Type-C connection state machine.
//!
//! Drives CC terminations, debounces attach and detach, resolves plug
//! polarity, and hands an [`Attachment`] to the device policy manager when
//! a connection commits. While a policy engine runs, this module only
//! watches for detach; the engine owns the connection.
use embassy_futures::select::{Either, select};
use typec_pd_traits::{CcLine, CcPull, CcStatus, CcTermination, RpLevel, TypeCDriver};

use crate::config::{PortConfig, PortRole, TryMode};
use crate::timers::{Timer, TimerType};
use crate::{DataRole, PowerRole};

/// Connection states, per the Type-C specification's port state diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum State {
    Disabled,
    ErrorRecovery,
    UnattachedSnk,
    UnattachedSrc,
    UnattachedWaitSrc,
    AttachWaitSnk,
    AttachWaitSrc,
    TrySrc,
    TryWaitSnk,
    TrySnk,
    TryWaitSrc,
    AttachedSnk,
    AttachedSrc,
    AudioAccessory,
    DebugAccessory,
}

/// Accessory kinds detected from the CC terminations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Accessory {
    /// Both lines present Ra.
    Audio,
    /// Both lines present Rd.
    Debug,
}

/// A committed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Attachment {
    /// The power role taken on this connection.
    pub power_role: PowerRole,
    /// The initial data role (DFP when sourcing, UFP when sinking).
    pub data_role: DataRole,
    /// The CC line that carries the partner.
    pub polarity: CcLine,
    /// The Rp advertisement observed as a sink.
    pub observed_rp: Option<RpLevel>,
    /// Accessory mode, when one was detected instead of a port partner.
    pub accessory: Option<Accessory>,
}

fn rp_from_termination(termination: CcTermination) -> Option<RpLevel> {
    match termination {
        CcTermination::RpDefault => Some(RpLevel::Default),
        CcTermination::Rp1A5 => Some(RpLevel::Rp1A5),
        CcTermination::Rp3A0 => Some(RpLevel::Rp3A0),
        _ => None,
    }
}

/// The Type-C connection state machine for one port.
#[derive(Debug)]
pub struct TypeCPort<DRIVER: TypeCDriver, TIMER: Timer> {
    driver: DRIVER,
    state: State,
    _timer: core::marker::PhantomData<TIMER>,
}

impl<DRIVER: TypeCDriver, TIMER: Timer> TypeCPort<DRIVER, TIMER> {
    /// Create the state machine over a CC driver.
    pub fn new(driver: DRIVER) -> Self {
        Self {
            driver,
            state: State::Disabled,
            _timer: core::marker::PhantomData,
        }
    }

    /// The current connection state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Direct access to the CC driver, e.g. for VConn control.
    pub fn driver(&mut self) -> &mut DRIVER {
        &mut self.driver
    }

    /// Change the advertised Rp level without dropping the connection.
    pub fn set_rp_level(&mut self, level: RpLevel) {
        self.driver.set_rp_level(level);
    }

    /// Hold both CC lines open for tErrorRecovery, then re-initialise.
    pub async fn error_recovery(&mut self) {
        warn!("Type-C error recovery");
        self.state = State::ErrorRecovery;
        self.driver.set_pull(CcPull::Open);
        TimerType::get_timer::<TIMER>(TimerType::ErrorRecovery).await;
        self.state = State::Disabled;
    }

    /// Keep a predicate true over the given debounce time.
    ///
    /// Returns `false` as soon as the predicate fails; the debounce timer
    /// restarts on every CC change that still satisfies the predicate.
    async fn debounce(&mut self, timer_type: TimerType, predicate: impl Fn(CcStatus) -> bool) -> bool {
        loop {
            if !predicate(self.driver.cc_state()) {
                return false;
            }

            match select(
                TimerType::get_timer::<TIMER>(timer_type),
                self.driver.wait_for_cc_change(),
            )
            .await
            {
                Either::First(_) => return predicate(self.driver.cc_state()),
                Either::Second(_) => {
                    // Restart the debounce window.
                }
            }
        }
    }

    /// Wait until the predicate holds on a fresh CC sample.
    async fn wait_cc(&mut self, predicate: impl Fn(CcStatus) -> bool) {
        loop {
            if predicate(self.driver.cc_state()) {
                return;
            }
            self.driver.wait_for_cc_change().await;
        }
    }

    fn attachment_as_sink(&mut self, status: CcStatus) -> Attachment {
        let polarity = if status.cc1.is_rp() { CcLine::Cc1 } else { CcLine::Cc2 };

        Attachment {
            power_role: PowerRole::Sink,
            data_role: DataRole::Ufp,
            polarity,
            observed_rp: rp_from_termination(status.line(polarity)),
            accessory: None,
        }
    }

    fn attachment_as_source(&mut self, status: CcStatus) -> Attachment {
        let polarity = if status.cc1 == CcTermination::Rd {
            CcLine::Cc1
        } else {
            CcLine::Cc2
        };

        Attachment {
            power_role: PowerRole::Source,
            data_role: DataRole::Dfp,
            polarity,
            observed_rp: None,
            accessory: None,
        }
    }

    /// Run the connection state machine until a connection commits.
    pub async fn wait_attach(&mut self, config: &PortConfig) -> Attachment {
        loop {
            trace!("Type-C state: {:?}", self.state);

            self.state = match self.state {
                State::Disabled => {
                    self.driver.set_pull(CcPull::Open);

                    if config.port_disabled {
                        core::future::pending::<()>().await;
                    }

                    match config.role {
                        PortRole::Sink => State::UnattachedSnk,
                        PortRole::Source => State::UnattachedSrc,
                        PortRole::Drp => match config.default_role {
                            PowerRole::Source => State::UnattachedSrc,
                            PowerRole::Sink => State::UnattachedSnk,
                        },
                    }
                }
                State::ErrorRecovery => {
                    self.driver.set_pull(CcPull::Open);
                    TimerType::get_timer::<TIMER>(TimerType::ErrorRecovery).await;
                    State::Disabled
                }
                State::UnattachedSnk => {
                    self.driver.set_pull(CcPull::Rd);

                    let toggling = config.role == PortRole::Drp && config.drp_toggle_enabled;
                    if toggling {
                        // Spend the sink share of the DRP period here, then
                        // present Rp.
                        let period = TimerType::DrpToggle.period_ms();
                        let sink_share = period * (100 - config.drp_source_duty() as u64) / 100;
                        let toggle = TIMER::after_millis(sink_share);
                        let attach = self.wait_cc(|status| status.cc1.is_rp() || status.cc2.is_rp());

                        match select(toggle, attach).await {
                            Either::First(_) => State::UnattachedSrc,
                            Either::Second(_) => State::AttachWaitSnk,
                        }
                    } else {
                        self.wait_cc(|status| status.cc1.is_rp() || status.cc2.is_rp()).await;
                        State::AttachWaitSnk
                    }
                }
                State::UnattachedSrc => {
                    self.driver.set_pull(CcPull::Rp(config.rp_level));

                    let wanted = |status: CcStatus| {
                        status.cc1 == CcTermination::Rd
                            || status.cc2 == CcTermination::Rd
                            || (config.accessory_enabled
                                && status.cc1 == CcTermination::Ra
                                && status.cc2 == CcTermination::Ra)
                    };

                    let toggling = config.role == PortRole::Drp && config.drp_toggle_enabled;
                    if toggling {
                        let period = TimerType::DrpToggle.period_ms();
                        let source_share = period * config.drp_source_duty() as u64 / 100;
                        let toggle = TIMER::after_millis(source_share);
                        let attach = self.wait_cc(wanted);

                        match select(toggle, attach).await {
                            Either::First(_) => State::UnattachedSnk,
                            Either::Second(_) => State::AttachWaitSrc,
                        }
                    } else {
                        self.wait_cc(wanted).await;
                        State::AttachWaitSrc
                    }
                }
                State::UnattachedWaitSrc => {
                    // Discharge VBUS before presenting terminations again.
                    self.driver.set_pull(CcPull::Open);
                    self.driver.discharge_vbus(true);
                    TimerType::get_timer::<TIMER>(TimerType::VBusOff).await;
                    self.driver.discharge_vbus(false);
                    State::Disabled
                }
                State::AttachWaitSnk => {
                    let stable = self
                        .debounce(TimerType::CCDebounce, |status| {
                            status.cc1.is_rp() || status.cc2.is_rp()
                        })
                        .await;

                    if !stable {
                        State::UnattachedSnk
                    } else if config.try_mode == TryMode::TrySrc && config.role == PortRole::Drp {
                        State::TrySrc
                    } else {
                        // A sink commits only with VBUS present.
                        if !self.driver.vbus_present() {
                            self.driver.wait_for_vbus_change().await;
                        }

                        if self
                            .debounce(TimerType::PDDebounce, |status| {
                                status.cc1.is_rp() || status.cc2.is_rp()
                            })
                            .await
                            && self.driver.vbus_present()
                        {
                            State::AttachedSnk
                        } else {
                            State::UnattachedSnk
                        }
                    }
                }
                State::AttachWaitSrc => {
                    let both_ra = |status: CcStatus| {
                        status.cc1 == CcTermination::Ra && status.cc2 == CcTermination::Ra
                    };
                    let both_rd = |status: CcStatus| {
                        status.cc1 == CcTermination::Rd && status.cc2 == CcTermination::Rd
                    };
                    let any_rd = |status: CcStatus| {
                        status.cc1 == CcTermination::Rd || status.cc2 == CcTermination::Rd
                    };

                    let stable = self
                        .debounce(TimerType::CCDebounce, |status| any_rd(status) || both_ra(status))
                        .await;

                    let status = self.driver.cc_state();
                    if !stable {
                        State::UnattachedSrc
                    } else if config.accessory_enabled && both_ra(status) {
                        State::AudioAccessory
                    } else if config.accessory_enabled && both_rd(status) {
                        State::DebugAccessory
                    } else if config.try_mode == TryMode::TrySnk && config.role == PortRole::Drp {
                        State::TrySnk
                    } else if self.debounce(TimerType::PDDebounce, any_rd).await {
                        State::AttachedSrc
                    } else {
                        State::UnattachedSrc
                    }
                }
                State::TrySrc => {
                    // Present Rp and watch for the partner's Rd.
                    self.driver.set_pull(CcPull::Rp(config.rp_level));
                    TimerType::get_timer::<TIMER>(TimerType::DrpTry).await;

                    let found_rd = {
                        let timeout = TimerType::get_timer::<TIMER>(TimerType::TryTimeout);
                        let rd = self.wait_cc(|status| {
                            status.cc1 == CcTermination::Rd || status.cc2 == CcTermination::Rd
                        });

                        matches!(select(timeout, rd).await, Either::Second(_))
                    };

                    if found_rd && self.debounce(TimerType::RdDebounce, |status| {
                        status.cc1 == CcTermination::Rd || status.cc2 == CcTermination::Rd
                    })
                    .await
                    {
                        State::AttachedSrc
                    } else {
                        State::TryWaitSnk
                    }
                }
                State::TryWaitSnk => {
                    self.driver.set_pull(CcPull::Rd);

                    if self
                        .debounce(TimerType::CCDebounce, |status| {
                            status.cc1.is_rp() || status.cc2.is_rp()
                        })
                        .await
                        && self.driver.vbus_present()
                    {
                        State::AttachedSnk
                    } else {
                        State::UnattachedSnk
                    }
                }
                State::TrySnk => {
                    self.driver.set_pull(CcPull::Rd);
                    TimerType::get_timer::<TIMER>(TimerType::DrpTry).await;

                    let found_rp = {
                        let timeout = TimerType::get_timer::<TIMER>(TimerType::TryTimeout);
                        let rp = self.wait_cc(|status| status.cc1.is_rp() || status.cc2.is_rp());

                        matches!(select(timeout, rp).await, Either::Second(_))
                    };

                    if found_rp
                        && self
                            .debounce(TimerType::PDDebounce, |status| {
                                status.cc1.is_rp() || status.cc2.is_rp()
                            })
                            .await
                        && self.driver.vbus_present()
                    {
                        State::AttachedSnk
                    } else {
                        State::TryWaitSrc
                    }
                }
                State::TryWaitSrc => {
                    self.driver.set_pull(CcPull::Rp(config.rp_level));

                    if self
                        .debounce(TimerType::CCDebounce, |status| {
                            status.cc1 == CcTermination::Rd || status.cc2 == CcTermination::Rd
                        })
                        .await
                    {
                        State::AttachedSrc
                    } else {
                        State::UnattachedSnk
                    }
                }
                State::AttachedSnk => {
                    let status = self.driver.cc_state();
                    return self.attachment_as_sink(status);
                }
                State::AttachedSrc => {
                    let status = self.driver.cc_state();
                    return self.attachment_as_source(status);
                }
                State::AudioAccessory => {
                    let status = self.driver.cc_state();
                    return Attachment {
                        accessory: Some(Accessory::Audio),
                        ..self.attachment_as_source(status)
                    };
                }
                State::DebugAccessory => {
                    let status = self.driver.cc_state();
                    return Attachment {
                        accessory: Some(Accessory::Debug),
                        ..self.attachment_as_source(status)
                    };
                }
            };
        }
    }

    /// Resolve when the committed connection is lost.
    ///
    /// As sink, detach is CC open for tPDDebounce or VBUS removal; as
    /// source, CC open for tSrcDisconnect.
    pub async fn wait_detach(&mut self, attachment: Attachment) {
        let polarity = attachment.polarity;

        match attachment.power_role {
            PowerRole::Sink => loop {
                if !self.driver.vbus_present() {
                    break;
                }

                let open = self
                    .debounce(TimerType::PDDebounce, move |status| {
                        !status.line(polarity).is_rp()
                    })
                    .await;

                if open {
                    break;
                }

                // CC is still up; wait for the next change of either line
                // or of VBUS.
                self.driver.wait_for_cc_or_vbus_change().await;
            },
            PowerRole::Source => loop {
                let open = self
                    .debounce(TimerType::SrcDisconnect, move |status| {
                        status.line(polarity) != CcTermination::Rd
                    })
                    .await;

                if open {
                    break;
                }

                self.driver.wait_for_cc_change().await;
            },
        }

        trace!("Type-C detach on {:?}", polarity);
        self.state = match attachment.power_role {
            PowerRole::Sink => State::UnattachedSnk,
            PowerRole::Source => State::UnattachedWaitSrc,
        };
    }
}

#[cfg(test)]
mod tests {
    use typec_pd_traits::{CcStatus, CcTermination};

    use super::{Accessory, State, TypeCPort};
    use crate::config::{PortConfig, PortRole, TryMode};
    use crate::dummy::{DummyCcDriver, InstantTimer};
    use crate::{DataRole, PowerRole};

    fn sink_config() -> PortConfig {
        PortConfig {
            role: PortRole::Sink,
            pd_enabled: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn sink_attach_resolves_polarity_and_rp() {
        let driver = DummyCcDriver::new(
            CcStatus {
                cc1: CcTermination::Open,
                cc2: CcTermination::Rp3A0,
            },
            true,
        );
        let mut port: TypeCPort<_, InstantTimer> = TypeCPort::new(driver);

        let attachment = port.wait_attach(&sink_config()).await;

        assert_eq!(attachment.power_role, PowerRole::Sink);
        assert_eq!(attachment.data_role, DataRole::Ufp);
        assert_eq!(attachment.polarity, typec_pd_traits::CcLine::Cc2);
        assert_eq!(attachment.observed_rp, Some(typec_pd_traits::RpLevel::Rp3A0));
        assert!(attachment.accessory.is_none());
        assert_eq!(port.state(), State::AttachedSnk);
    }

    #[tokio::test]
    async fn source_attach_on_rd() {
        let driver = DummyCcDriver::new(
            CcStatus {
                cc1: CcTermination::Rd,
                cc2: CcTermination::Open,
            },
            false,
        );
        let mut port: TypeCPort<_, InstantTimer> = TypeCPort::new(driver);

        let config = PortConfig {
            role: PortRole::Source,
            pd_enabled: false,
            ..Default::default()
        };

        let attachment = port.wait_attach(&config).await;

        assert_eq!(attachment.power_role, PowerRole::Source);
        assert_eq!(attachment.data_role, DataRole::Dfp);
        assert_eq!(attachment.polarity, typec_pd_traits::CcLine::Cc1);
    }

    #[tokio::test]
    async fn audio_accessory_on_double_ra() {
        let driver = DummyCcDriver::new(
            CcStatus {
                cc1: CcTermination::Ra,
                cc2: CcTermination::Ra,
            },
            false,
        );
        let mut port: TypeCPort<_, InstantTimer> = TypeCPort::new(driver);

        let config = PortConfig {
            role: PortRole::Source,
            accessory_enabled: true,
            pd_enabled: false,
            ..Default::default()
        };

        let attachment = port.wait_attach(&config).await;
        assert_eq!(attachment.accessory, Some(Accessory::Audio));
    }

    #[tokio::test]
    async fn debug_accessory_on_double_rd() {
        let driver = DummyCcDriver::new(
            CcStatus {
                cc1: CcTermination::Rd,
                cc2: CcTermination::Rd,
            },
            false,
        );
        let mut port: TypeCPort<_, InstantTimer> = TypeCPort::new(driver);

        let config = PortConfig {
            role: PortRole::Source,
            accessory_enabled: true,
            pd_enabled: false,
            ..Default::default()
        };

        let attachment = port.wait_attach(&config).await;
        assert_eq!(attachment.accessory, Some(Accessory::Debug));
    }

    #[tokio::test]
    async fn try_src_falls_back_to_sink() {
        // Partner presents Rp only: Try.SRC cannot find Rd and must fall
        // through to TryWait.SNK, attaching as sink.
        let driver = DummyCcDriver::new(
            CcStatus {
                cc1: CcTermination::Rp1A5,
                cc2: CcTermination::Open,
            },
            true,
        );
        let mut port: TypeCPort<_, InstantTimer> = TypeCPort::new(driver);

        let config = PortConfig {
            role: PortRole::Drp,
            try_mode: TryMode::TrySrc,
            drp_toggle_enabled: false,
            pd_enabled: false,
            default_role: PowerRole::Sink,
            ..Default::default()
        };

        let attachment = port.wait_attach(&config).await;
        assert_eq!(attachment.power_role, PowerRole::Sink);
    }
}
