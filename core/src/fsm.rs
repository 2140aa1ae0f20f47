//! # Lifecycle State Machine
//!
//! Runs on the dispatcher thread and owns `state`, `session_flags` and the
//! per-endpoint handshake state. Each handler checks its own predecessor
//! states; a rejected event changes nothing and fires no notifier.
//!
//! ```text
//!            DEV_ADD            STARTUP                 STARTUP (mask complete)
//!   OFF ───────────────▶ ON ───────────────▶ BOOTUP ─────────────────────────▶ READY
//!    ▲                   │ ╲ DOWNLOAD/POSTDUMP  ▲                                 │
//!    │                   │  ╲                   │ STARTUP                         │ MDEE
//!    │                   │   ▶ DOWNLOAD ────────┘                                 ▼
//!    │  LINKDOWN, AER, … └──────────────────────────────────────────────────▶ MDEE
//!    └────────────────────────────── every non-OFF state ─────────────────────────
//! ```
//!
//! Every applied transition fires the pre list with the old state current,
//! writes the state, fires the post list, then records the lifecycle event.

use std::sync::Arc;
use std::time::Duration;

use mdfsm_handshake::{wire, HandshakeError, HandshakeInfo};
use mdfsm_hal::{
    DeviceConfig, Endpoint, ExceptionKind, ExceptionReporter, H2dEvent, HalError, HostEvent,
    HwVariant, ModemHal, ReinitKind,
};

use crate::dispatcher::{EventHandler, Shared};
use crate::error::{Error, Result};
use crate::event::{EventFlag, EventId, EventRecord};
use crate::notifier::{Phase, Transition};
use crate::routing::Sources;
use crate::state::State;
use crate::timer::Timer;
use crate::watcher::BootWatcher;

/// Completion flags required for `Ready`
pub fn hs_done_mask(variant: HwVariant, config: DeviceConfig) -> EventFlag {
    let mut mask = EventFlag::MD_HS_START | EventFlag::MD_HS2_DONE;
    if config != DeviceConfig::MdOnly {
        mask |= EventFlag::SAP_HS_START | EventFlag::SAP_HS2_DONE;
    }
    if variant.requires_hs4() {
        mask |= EventFlag::MD_HS4_DONE;
    }
    mask
}

fn endpoint_flags(ep: Endpoint) -> EventFlag {
    match ep {
        Endpoint::Md => EventFlag::MD_HS_START | EventFlag::MD_HS2_DONE | EventFlag::MD_HS4_DONE,
        Endpoint::Sap => EventFlag::SAP_HS_START | EventFlag::SAP_HS2_DONE,
    }
}

/// Everything a running state machine needs
pub(crate) struct Fsm {
    state: State,
    session_flags: EventFlag,
    hs_done_mask: EventFlag,
    variant: HwVariant,
    hal: Arc<dyn ModemHal>,
    reporter: Option<Arc<dyn ExceptionReporter>>,
    endpoints: [HandshakeInfo; 2],
    shared: Arc<Shared>,
    sources: Sources,
    watcher: BootWatcher,
    dump_timer: Timer,
    dump_delay: Duration,
}

impl Fsm {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        hal: Arc<dyn ModemHal>,
        reporter: Option<Arc<dyn ExceptionReporter>>,
        variant: HwVariant,
        endpoints: [HandshakeInfo; 2],
        shared: Arc<Shared>,
        sources: Sources,
        watcher: BootWatcher,
        dump_delay: Duration,
    ) -> Result<Self> {
        let dump_hal = hal.clone();
        let dump_timer = Timer::spawn("mdfsm-mdee-dump", move || {
            log::warn!(target: "mdfsm::fsm", "exception handling not finished; dumping");
            dump_hal.dbg_dump();
            crate::timer::TimerControl::Stop
        })?;
        shared.snapshot.store(State::Off, EventFlag::empty());
        Ok(Self {
            state: State::Off,
            session_flags: EventFlag::empty(),
            hs_done_mask: hs_done_mask(variant, DeviceConfig::Normal),
            variant,
            hal,
            reporter,
            endpoints,
            shared,
            sources,
            watcher,
            dump_timer,
            dump_delay,
        })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn expect_state(&self, event: &EventRecord, valid: &[State]) -> Result<()> {
        if valid.contains(&self.state) {
            return Ok(());
        }
        Err(Error::InvalidTransition {
            state: self.state,
            event: event.id(),
        })
    }

    fn endpoint(&mut self, ep: Endpoint) -> &mut HandshakeInfo {
        &mut self.endpoints[ep.index()]
    }

    fn report(&self, kind: ExceptionKind) {
        if let Some(r) = &self.reporter {
            r.report(kind);
        }
    }

    fn hal_op(&self, what: &str, result: core::result::Result<(), HalError>) -> Result<()> {
        result.map_err(|e| {
            log::warn!(target: "mdfsm::fsm", "{} failed: {}", what, e);
            if e.is_link_failure() {
                self.report(ExceptionKind::LinkDown);
            }
            Error::Hal(e)
        })
    }

    fn transition(&mut self, to: State, event: &EventRecord) {
        let t = Transition {
            from: self.state,
            to,
            event: event.id(),
            flag: event.flag(),
        };

        self.shared.notifiers.fire(Phase::Pre, &t);
        self.state = to;
        self.shared.snapshot.store(to, self.session_flags);
        self.shared.notifiers.fire(Phase::Post, &t);

        log::info!(
            target: "mdfsm::lifecycle",
            "{} -> {} on {} {:?} (session {:?})",
            t.from,
            t.to,
            t.event,
            t.flag,
            self.session_flags
        );
        self.shared.history.lock().push(event.seq(), &t);
    }

    fn recompute_mask(&mut self) {
        let config = self.hal.get_dev_state().config();
        self.hs_done_mask = hs_done_mask(self.variant, config);
        log::debug!(
            target: "mdfsm::fsm",
            "handshake completion mask {:?} ({:?}, {:?})",
            self.hs_done_mask,
            self.variant,
            config
        );
    }

    fn reset_handshakes(&mut self) {
        for hs in &mut self.endpoints {
            hs.reset();
        }
    }

    // =========================================================================
    // DEV_ADD / REINIT
    // =========================================================================

    fn on_dev_add(&mut self, event: &EventRecord) -> Result<()> {
        self.expect_state(event, &[State::Off])?;
        self.recompute_mask();
        self.sources.register()?;
        if let Err(e) = self.sources.unmask_all() {
            self.sources.unregister();
            return Err(e);
        }
        self.reset_handshakes();
        self.session_flags = EventFlag::empty();
        self.watcher.start();
        self.transition(State::On, event);
        Ok(())
    }

    fn on_reinit(&mut self, event: &EventRecord) -> Result<()> {
        self.expect_state(event, &[State::Off])?;
        let kind = if event.flag().contains(EventFlag::FULL_REINIT) {
            ReinitKind::Full
        } else {
            ReinitKind::Partial
        };
        self.hal_op("reinit", self.hal.reinit(kind))?;
        self.recompute_mask();
        self.reset_handshakes();
        self.session_flags = EventFlag::empty();
        self.sources.register()?;
        self.sources.unmask_all()?;
        self.watcher.start();
        self.transition(State::On, event);
        Ok(())
    }

    // =========================================================================
    // DOWNLOAD / POSTDUMP
    // =========================================================================

    fn on_download(&mut self, event: &EventRecord) -> Result<()> {
        self.expect_state(event, &[State::On, State::Download])?;
        let flag = event.flag();
        if flag.is_empty() || !EventFlag::DL_ALL.contains(flag) {
            return Err(Error::InvalidFlag {
                event: event.id(),
                flag,
            });
        }
        if flag.contains(EventFlag::DL_JUMP_DA) {
            self.hal_op("enter-DA ack", self.hal.ack_dev_state(HostEvent::EnterDa))?;
        }
        self.transition(State::Download, event);
        Ok(())
    }

    fn on_postdump(&mut self, event: &EventRecord) -> Result<()> {
        self.expect_state(event, &[State::On, State::Download])?;
        self.transition(State::Postdump, event);
        Ok(())
    }

    // =========================================================================
    // STARTUP
    // =========================================================================

    fn on_startup(&mut self, event: &EventRecord) -> Result<()> {
        let flag = event.flag();
        if flag.is_empty() || !EventFlag::HS_PROGRESS.contains(flag) {
            return Err(Error::InvalidFlag {
                event: event.id(),
                flag,
            });
        }
        if self.session_flags.contains(flag) {
            log::debug!(target: "mdfsm::fsm", "{:?} already recorded; ignoring", flag);
            return Ok(());
        }
        self.expect_state(event, &[State::On, State::Download, State::Bootup])?;

        // A Startup event carries progress for exactly one endpoint
        let mut touched = Endpoint::ALL
            .into_iter()
            .filter(|ep| flag.intersects(endpoint_flags(*ep)));
        let ep = match (touched.next(), touched.next()) {
            (Some(ep), None) => ep,
            _ => {
                return Err(Error::InvalidFlag {
                    event: event.id(),
                    flag,
                })
            },
        };
        if !self.hs_done_mask.intersects(endpoint_flags(ep)) {
            return Err(Error::EndpointInactive(ep));
        }
        let fresh = flag - self.session_flags;
        if fresh.contains(EventFlag::MD_HS4_DONE) && !self.hs_done_mask.contains(EventFlag::MD_HS4_DONE) {
            return Err(Error::InvalidFlag {
                event: event.id(),
                flag: EventFlag::MD_HS4_DONE,
            });
        }
        self.run_stages(ep, fresh, event.payload()).map_err(|source| {
            if matches!(source, HandshakeError::Channel(_)) {
                self.report(ExceptionKind::ChannelFault);
            }
            Error::Handshake {
                endpoint: ep,
                source,
            }
        })?;

        self.session_flags |= fresh;
        let to = if self.session_flags.contains(self.hs_done_mask) {
            State::Ready
        } else {
            State::Bootup
        };
        self.transition(to, event);
        Ok(())
    }

    fn run_stages(
        &mut self,
        ep: Endpoint,
        bits: EventFlag,
        payload: &[u8],
    ) -> core::result::Result<(), HandshakeError> {
        let hs = self.endpoint(ep);
        if bits.intersects(EventFlag::MD_HS_START | EventFlag::SAP_HS_START) {
            hs.start()?;
        }
        if bits.intersects(EventFlag::MD_HS2_DONE | EventFlag::SAP_HS2_DONE) {
            hs.on_response(payload)?;
        }
        if bits.contains(EventFlag::MD_HS4_DONE) {
            hs.on_ack()?;
        }
        Ok(())
    }

    // =========================================================================
    // MDEE
    // =========================================================================

    fn on_mdee(&mut self, event: &EventRecord) -> Result<()> {
        let flag = event.flag();
        if flag.bits().count_ones() != 1 || !EventFlag::MDEE_ALL.contains(flag) {
            return Err(Error::InvalidFlag {
                event: event.id(),
                flag,
            });
        }
        if self.state != State::Mdee {
            self.expect_state(event, &[State::On, State::Bootup, State::Ready])?;
            if flag != EventFlag::MDEE_INIT {
                return Err(Error::InvalidTransition {
                    state: self.state,
                    event: event.id(),
                });
            }
        }

        if flag == EventFlag::MDEE_INIT {
            self.hal_op("exception ack", self.hal.send_ext_evt(H2dEvent::EXCEPT_ACK))?;
            self.dump_timer.arm(self.dump_delay);
        } else if flag == EventFlag::MDEE_CLEARQ_DONE {
            self.hal_op(
                "queue-clear ack",
                self.hal.send_ext_evt(H2dEvent::EXCEPT_CLEARQ_ACK),
            )?;
        } else if flag == EventFlag::MDEE_MSG {
            wire::parse_mdee(event.payload()).map_err(|source| Error::Handshake {
                endpoint: Endpoint::Md,
                source,
            })?;
            let reply = wire::build_mdee_rec_ok();
            self.endpoints[Endpoint::Md.index()]
                .channel()
                .write(&reply)
                .map_err(|e| {
                    self.report(ExceptionKind::ChannelFault);
                    Error::Hal(e)
                })?;
        } else if flag == EventFlag::MDEE_PASS {
            self.dump_timer.cancel();
        }

        self.transition(State::Mdee, event);
        Ok(())
    }

    // =========================================================================
    // ENTER OFF
    // =========================================================================

    fn health_check(&self) {
        let link = self.hal.link_check();
        let mmio = self.hal.mmio_check();
        if let Err(e) = link {
            log::error!(target: "mdfsm::fsm", "link check failed: {}", e);
            self.report(ExceptionKind::LinkDown);
        }
        if let Err(e) = mmio {
            log::error!(target: "mdfsm::fsm", "MMIO check failed: {}", e);
            self.report(ExceptionKind::MmioFault);
        }
        if link.is_err() || mmio.is_err() {
            self.hal.dbg_dump();
        }
    }

    fn quiesce(&mut self) {
        self.sources.mask_all();
        self.watcher.stop();
        self.dump_timer.cancel();
        self.reset_handshakes();
        self.session_flags = EventFlag::empty();
    }

    fn on_enter_off(&mut self, event: &EventRecord) -> Result<()> {
        let id = event.id();
        if id != EventId::DevRm && self.state == State::Off {
            return Err(Error::InvalidTransition {
                state: self.state,
                event: id,
            });
        }

        match id {
            EventId::DevResetReq if !event.flag().contains(EventFlag::RESET_BY_DEVICE) => {
                if let Err(e) = self.hal.send_ext_evt(H2dEvent::DEVICE_RESET) {
                    log::warn!(target: "mdfsm::fsm", "device reset request failed: {}", e);
                }
            },
            EventId::Aer => self.health_check(),
            _ => {},
        }

        self.quiesce();
        self.transition(State::Off, event);

        if id == EventId::DevRm {
            self.sources.unregister();
            let drained = self.shared.queue.close_gate();
            log::info!(
                target: "mdfsm::lifecycle",
                "device removed; discarding {} queued events",
                drained.len()
            );
            self.shared.fail_all(drained);
        }
        Ok(())
    }
}

impl EventHandler for Fsm {
    fn handle(&mut self, event: &EventRecord) -> Result<()> {
        log::debug!(
            target: "mdfsm::fsm",
            "{}: handling {} {:?} seq {}",
            self.state,
            event.id(),
            event.flag(),
            event.seq()
        );
        match event.id() {
            EventId::DevAdd => self.on_dev_add(event),
            EventId::Download => self.on_download(event),
            EventId::Postdump => self.on_postdump(event),
            EventId::Startup => self.on_startup(event),
            EventId::Mdee => self.on_mdee(event),
            EventId::Linkdown
            | EventId::Aer
            | EventId::ColdResume
            | EventId::DevResetReq
            | EventId::SoftOff
            | EventId::Pwroff
            | EventId::DevRm => self.on_enter_off(event),
            EventId::Reinit => self.on_reinit(event),
        }
    }

    fn teardown(&mut self) {
        self.watcher.stop();
        self.dump_timer.cancel();
        self.sources.unregister();
        self.reset_handshakes();
    }
}
