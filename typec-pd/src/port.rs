//! The port task: the device policy manager façade the application runs.
//!
//! A [`Port`] owns the per-port state: configuration, the Type-C connection
//! state machine, the PD PHY and the application policy. Its [`Port::run`]
//! future is the port's single advancing task; everything else happens in
//! interrupt context behind the driver traits.
use embassy_futures::select::{Either, select};
use typec_pd_traits::{PdDriver, TypeCDriver};

use crate::config::{ConfigError, PortConfig};
use crate::device_policy_manager::{DevicePolicyManager, Event};
use crate::policy_engine::sink::Sink;
use crate::policy_engine::source::Source;
use crate::policy_engine::{EngineOutcome, Error};
use crate::timers::Timer;
use crate::type_c::{Attachment, TypeCPort};
use crate::PowerRole;

/// One USB-C port: configuration, connection state machine, PHY and policy.
///
/// Multi-port systems run one `Port` per connector; ports share nothing but
/// read-only configuration.
pub struct Port<CC: TypeCDriver, PHY: PdDriver, TIMER: Timer, POLICY: DevicePolicyManager> {
    config: PortConfig,
    type_c: TypeCPort<CC, TIMER>,
    phy: PHY,
    policy: POLICY,
}

impl<CC: TypeCDriver, PHY: PdDriver, TIMER: Timer, POLICY: DevicePolicyManager> Port<CC, PHY, TIMER, POLICY> {
    /// Create a port over its drivers and policy.
    ///
    /// Fails when the configuration is inconsistent, e.g. a source role
    /// without source PDOs.
    pub fn new(cc_driver: CC, phy: PHY, policy: POLICY, config: PortConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            config,
            type_c: TypeCPort::new(cc_driver),
            phy,
            policy,
        })
    }

    /// Access the application policy, e.g. to drain buffered state.
    pub fn policy(&mut self) -> &mut POLICY {
        &mut self.policy
    }

    /// Run one connection from attach to detach.
    async fn run_connection(&mut self, attachment: Attachment) {
        let mut role = attachment.power_role;

        loop {
            let outcome = match role {
                PowerRole::Sink => {
                    let mut engine = Sink::<_, TIMER, _>::new(&mut self.phy, &mut self.policy, self.config.clone());
                    match select(engine.run(), self.type_c.wait_detach(attachment)).await {
                        Either::First(result) => result,
                        Either::Second(()) => break,
                    }
                }
                PowerRole::Source => {
                    let mut engine = Source::<_, TIMER, _>::new(&mut self.phy, &mut self.policy, self.config.clone());
                    match select(engine.run(), self.type_c.wait_detach(attachment)).await {
                        Either::First(result) => result,
                        Either::Second(()) => break,
                    }
                }
            };

            match outcome {
                Ok(EngineOutcome::PowerRoleSwapped) => {
                    role = role.other();
                }
                Ok(EngineOutcome::NonPdPartner) => {
                    // Stay attached at Type-C level without PD.
                    self.type_c.wait_detach(attachment).await;
                    break;
                }
                Err(Error::PortPartnerUnresponsive) | Err(Error::Protocol(_)) => {
                    self.policy.notify(Event::ErrorRecovery).await;
                    if self.config.error_recovery_enabled {
                        self.type_c.error_recovery().await;
                    }
                    break;
                }
            }
        }

        // Power paths return to cold on disconnect.
        self.policy.psnk_disable().await;
        self.policy.psrc_disable().await;
        self.policy.set_vconn(false).await;
    }

    /// Drive the port forever.
    ///
    /// This is the only task that advances the port; call it from the
    /// application's executor.
    pub async fn run(&mut self) {
        loop {
            let attachment = self.type_c.wait_attach(&self.config).await;
            info!("Attached: {:?}", attachment);
            self.policy.notify(Event::Attached).await;

            if attachment.accessory.is_some() {
                // Accessories carry no PD; hold until detach.
                self.type_c.wait_detach(attachment).await;
                self.policy.notify(Event::Detached).await;
                continue;
            }

            if attachment.power_role == PowerRole::Source {
                // VConn feeds the cable marker on the non-CC line.
                self.type_c.driver().set_vconn(attachment.polarity.other(), true);
                self.policy.set_vconn(true).await;
            }

            if self.config.pd_enabled {
                self.run_connection(attachment).await;
                // run_connection returns once the partner detached or error
                // recovery dropped the connection.
            } else {
                self.type_c.wait_detach(attachment).await;
            }

            if attachment.power_role == PowerRole::Source {
                self.type_c.driver().set_vconn(attachment.polarity.other(), false);
            }

            self.policy.notify(Event::Detached).await;
        }
    }
}
