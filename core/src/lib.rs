//! # mdfsm Core
//!
//! Lifecycle controller for a PCIe-attached modem co-processor.
//!
//! One [`FsmInstance`] exists per attached device. Everything that can
//! happen to the device (attach, boot progress, handshake messages,
//! exceptions, link loss, power events, removal) becomes an event that is
//! queued and applied by a single dispatcher thread, so the lifecycle
//! state is only ever mutated in one place.
//!
//! ## Components
//!
//! - **Dispatcher**: FIFO queue with head insertion, blocking and atomic
//!   submission, pause/resume and a removal gate
//! - **State machine**: `Off → On → Download/Postdump → Bootup → Ready`,
//!   plus `Mdee` and the convergent enter-off path
//! - **Handshake**: per-endpoint capability negotiation, see
//!   [`mdfsm_handshake`]
//! - **Notifiers**: ordered pre/post transition callbacks
//! - **Watchers**: boot-stage polling, dispatch watchdog, exception dump
//!   delay
//!
//! ## Example
//!
//! ```ignore
//! let fsm = FsmInstance::new(hal, md_channel, sap_channel, FsmConfig::default())?;
//! fsm.register_notifier(OwnerId(1), Arc::new(port_layer), NotifierPriority::High, Phase::Post)?;
//! fsm.submit(EventId::DevAdd, EventFlag::empty(), &[], SubmitMode::BLOCKING)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod diag;
mod dispatcher;
pub mod error;
pub mod event;
mod fsm;
pub mod notifier;
mod queue;
mod routing;
pub mod state;
mod sync;
pub mod timer;
mod watcher;

use std::sync::Arc;

use mdfsm_handshake::{FeatureConsumer, FeatureHooks, FeatureId, FeatureProvider, HandshakeInfo};
use mdfsm_hal::{ControlChannel, Endpoint, ExceptionReporter, HwVariant, ModemHal};

pub use config::{EndpointFeatures, FsmConfig};
pub use diag::{HistoryEntry, Snapshot, StatsSnapshot};
pub use dispatcher::EventSubmitter;
pub use error::{Error, ErrorKind, Result};
pub use event::{EventFlag, EventId, EventRecord, EventStatus, SubmitMode};
pub use fsm::hs_done_mask;
pub use notifier::{NotifierPriority, OwnerId, Phase, Transition, TransitionNotifier};
pub use queue::ActorState;
pub use state::State;

use dispatcher::{Dispatcher, Shared};
use fsm::Fsm;
use routing::{hs_notify, Sources};
use watcher::BootWatcher;

// =============================================================================
// INSTANCE
// =============================================================================

/// Lifecycle controller for one device
///
/// Starts in [`State::Off`]; submit [`EventId::DevAdd`] to bring the device
/// up. Dropping the instance stops the dispatcher and releases every
/// hardware registration.
pub struct FsmInstance {
    shared: Arc<Shared>,
    submitter: EventSubmitter,
    hooks: [Arc<FeatureHooks>; 2],
    flashless: bool,
    dispatcher: spin::Mutex<Dispatcher>,
}

impl FsmInstance {
    /// Create an instance without an exception reporter
    pub fn new(
        hal: Arc<dyn ModemHal>,
        md_channel: Arc<dyn ControlChannel>,
        sap_channel: Arc<dyn ControlChannel>,
        config: FsmConfig,
    ) -> Result<Self> {
        Self::build(hal, md_channel, sap_channel, config, None)
    }

    /// Create an instance that reports link and MMIO failures to `reporter`
    pub fn with_reporter(
        hal: Arc<dyn ModemHal>,
        md_channel: Arc<dyn ControlChannel>,
        sap_channel: Arc<dyn ControlChannel>,
        config: FsmConfig,
        reporter: Arc<dyn ExceptionReporter>,
    ) -> Result<Self> {
        Self::build(hal, md_channel, sap_channel, config, Some(reporter))
    }

    fn build(
        hal: Arc<dyn ModemHal>,
        md_channel: Arc<dyn ControlChannel>,
        sap_channel: Arc<dyn ControlChannel>,
        config: FsmConfig,
        reporter: Option<Arc<dyn ExceptionReporter>>,
    ) -> Result<Self> {
        config.validate()?;
        if md_channel.endpoint() != Endpoint::Md || sap_channel.endpoint() != Endpoint::Sap {
            return Err(Error::InvalidConfig("control channels bound to the wrong endpoints"));
        }

        let flashless = config
            .flashless
            .unwrap_or_else(|| hal.hw_variant().requires_hs4());
        let variant = if flashless {
            HwVariant::Flashless
        } else {
            HwVariant::Standard
        };

        let shared = Arc::new(Shared::new(
            config.event_watchdog,
            config.blocking_timeout(),
            config.history_depth,
        ));
        let submitter = EventSubmitter::new(shared.clone());
        let hooks = [Arc::new(FeatureHooks::new()), Arc::new(FeatureHooks::new())];

        let endpoint_state = |channel: &Arc<dyn ControlChannel>| {
            let ep = channel.endpoint();
            let features = config.features(ep);
            HandshakeInfo::new(
                channel.clone(),
                hs_notify(ep),
                features.requested.clone(),
                features.supported.clone(),
                hooks[ep.index()].clone(),
            )
        };
        let endpoints = [endpoint_state(&md_channel), endpoint_state(&sap_channel)];

        let watcher = BootWatcher::spawn(
            hal.clone(),
            submitter.clone(),
            reporter.clone(),
            config.boot_poll_interval,
            config.boot_timeout,
        )?;
        let sources = Sources::new(
            hal.clone(),
            &endpoints,
            submitter.clone(),
            watcher.poll_handle(),
            flashless,
        );

        let fsm = Fsm::new(
            hal,
            reporter,
            variant,
            endpoints,
            shared.clone(),
            sources,
            watcher,
            config.mdee_dump_delay,
        )?;
        let dispatcher = Dispatcher::spawn(shared.clone(), fsm)?;

        log::info!(
            target: "mdfsm::lifecycle",
            "instance created ({:?}, watchdog {:?})",
            variant,
            config.event_watchdog
        );

        Ok(Self {
            shared,
            submitter,
            hooks,
            flashless,
            dispatcher: spin::Mutex::new(dispatcher),
        })
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    /// Queue an event; see [`EventSubmitter::submit`]
    pub fn submit(
        &self,
        id: EventId,
        flag: EventFlag,
        data: &[u8],
        mode: SubmitMode,
    ) -> Result<EventStatus> {
        self.submitter.submit(id, flag, data, mode)
    }

    /// Queue an event and keep its record
    pub fn submit_tracked(
        &self,
        id: EventId,
        flag: EventFlag,
        data: &[u8],
        mode: SubmitMode,
    ) -> Result<Arc<EventRecord>> {
        self.submitter.submit_tracked(id, flag, data, mode)
    }

    /// Handle for submitting from other components
    pub fn submitter(&self) -> EventSubmitter {
        self.submitter.clone()
    }

    // -------------------------------------------------------------------------
    // Notifiers
    // -------------------------------------------------------------------------

    /// Register a transition callback
    pub fn register_notifier(
        &self,
        owner: OwnerId,
        callback: Arc<dyn TransitionNotifier>,
        priority: NotifierPriority,
        phase: Phase,
    ) -> Result<()> {
        self.shared
            .notifiers
            .register(owner, callback, priority, phase)
    }

    /// Remove every callback held by `owner`
    pub fn unregister_notifier(&self, owner: OwnerId) -> Result<()> {
        self.shared.notifiers.unregister(owner)
    }

    // -------------------------------------------------------------------------
    // Feature hooks
    // -------------------------------------------------------------------------

    fn hook_err(endpoint: Endpoint) -> impl Fn(mdfsm_handshake::HandshakeError) -> Error {
        move |source| Error::Handshake { endpoint, source }
    }

    /// Register the consumer of a feature's runtime data on `endpoint`
    pub fn register_consumer(
        &self,
        endpoint: Endpoint,
        feature: FeatureId,
        consumer: Arc<dyn FeatureConsumer>,
    ) -> Result<()> {
        self.hooks[endpoint.index()]
            .register_consumer(feature, consumer)
            .map_err(Self::hook_err(endpoint))
    }

    /// Remove a consumer
    pub fn unregister_consumer(&self, endpoint: Endpoint, feature: FeatureId) -> Result<()> {
        self.hooks[endpoint.index()]
            .unregister_consumer(feature)
            .map_err(Self::hook_err(endpoint))
    }

    /// Register the provider of a feature's runtime data on `endpoint`
    pub fn register_provider(
        &self,
        endpoint: Endpoint,
        feature: FeatureId,
        provider: Arc<dyn FeatureProvider>,
    ) -> Result<()> {
        self.hooks[endpoint.index()]
            .register_provider(feature, provider)
            .map_err(Self::hook_err(endpoint))
    }

    /// Remove a provider
    pub fn unregister_provider(&self, endpoint: Endpoint, feature: FeatureId) -> Result<()> {
        self.hooks[endpoint.index()]
            .unregister_provider(feature)
            .map_err(Self::hook_err(endpoint))
    }

    // -------------------------------------------------------------------------
    // Control
    // -------------------------------------------------------------------------

    /// Stop dispatching after the current event; returns once idle
    ///
    /// Queued events stay queued. Fails with [`Error::WouldDeadlock`] when
    /// called from a notifier or hook.
    pub fn pause(&self) -> Result<()> {
        if self.shared.on_worker() {
            return Err(Error::WouldDeadlock);
        }
        self.shared.queue.pause()
    }

    /// Continue dispatching
    pub fn resume(&self) -> Result<()> {
        self.shared.queue.resume()
    }

    /// Stop the dispatcher and fail every queued event
    pub fn shutdown(&self) {
        if self.shared.on_worker() {
            let drained = self.shared.queue.stop();
            self.shared.fail_all(drained);
            return;
        }
        self.dispatcher.lock().shutdown();
    }

    /// Dispatcher run state
    pub fn actor_state(&self) -> ActorState {
        self.shared.queue.actor()
    }

    /// Whether the device was removed and submissions are refused
    pub fn is_gate_closed(&self) -> bool {
        self.shared.queue.is_gate_closed()
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    /// Last published `(state, session_flags)`
    pub fn snapshot(&self) -> Snapshot {
        self.shared.snapshot.load()
    }

    /// Current lifecycle state
    pub fn state(&self) -> State {
        self.snapshot().state
    }

    /// Dispatch counters
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Most recent transitions, oldest first
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.shared.history.lock().entries()
    }

    /// Whether the MD endpoint runs the fourth handshake stage
    pub fn is_flashless(&self) -> bool {
        self.flashless
    }
}

impl core::fmt::Debug for FsmInstance {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FsmInstance")
            .field("snapshot", &self.snapshot())
            .field("actor", &self.actor_state())
            .field("queued", &self.shared.queue.len())
            .finish()
    }
}

impl Drop for FsmInstance {
    fn drop(&mut self) {
        self.shutdown();
        let leaked = self.shared.notifiers.force_clear();
        if leaked > 0 {
            log::warn!(
                target: "mdfsm::lifecycle",
                "{} notifiers still registered at teardown",
                leaked
            );
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mdfsm_handshake::wire::{
        frame, FeatureEntry, FeatureQuery, FEATURE_COUNT, HEAD_PATTERN, MDEE_CHK_ID, TAIL_PATTERN,
    };
    use mdfsm_handshake::{CtrlMsgId, FeatureDescriptor, HookError, SupportLevel};
    use mdfsm_hal::mock::{HalCall, MockChannel, MockHal, MockReporter};
    use mdfsm_hal::{D2hEvent, DevState, ExceptionKind, H2dEvent, HostEvent, IrqSource, ReinitKind};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    type Seen = Arc<Mutex<Vec<(Phase, State, State, EventId)>>>;

    struct Rig {
        hal: Arc<MockHal>,
        md: Arc<MockChannel>,
        sap: Arc<MockChannel>,
        seen: Seen,
        fsm: FsmInstance,
    }

    fn config() -> FsmConfig {
        FsmConfig::default()
            .with_event_watchdog(Duration::from_secs(1))
            .with_boot_poll_interval(Duration::from_millis(10))
            .with_mdee_dump_delay(Duration::from_millis(50))
    }

    fn rig_with(variant: HwVariant, cfg: FsmConfig, reporter: Option<Arc<MockReporter>>) -> Rig {
        let hal = Arc::new(MockHal::new(variant));
        let md = Arc::new(MockChannel::new(Endpoint::Md));
        let sap = Arc::new(MockChannel::new(Endpoint::Sap));
        let fsm = match reporter {
            Some(r) => FsmInstance::with_reporter(hal.clone(), md.clone(), sap.clone(), cfg, r),
            None => FsmInstance::new(hal.clone(), md.clone(), sap.clone(), cfg),
        }
        .unwrap();

        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        for (owner, phase) in [(1, Phase::Pre), (2, Phase::Post)] {
            let sink = seen.clone();
            fsm.register_notifier(
                OwnerId(owner),
                Arc::new(move |t: &Transition| {
                    sink.lock().unwrap().push((phase, t.from, t.to, t.event));
                }),
                NotifierPriority::Normal,
                phase,
            )
            .unwrap();
        }
        Rig {
            hal,
            md,
            sap,
            seen,
            fsm,
        }
    }

    fn rig(variant: HwVariant) -> Rig {
        rig_with(variant, config(), None)
    }

    impl Rig {
        fn send(&self, id: EventId, flag: EventFlag) -> EventStatus {
            self.send_with(id, flag, &[])
        }

        fn send_with(&self, id: EventId, flag: EventFlag, data: &[u8]) -> EventStatus {
            self.fsm
                .submit(id, flag, data, SubmitMode::BLOCKING)
                .unwrap()
        }

        fn notified(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn wait_for(&self, state: State) {
            let deadline = Instant::now() + Duration::from_secs(2);
            while self.fsm.state() != state {
                assert!(Instant::now() < deadline, "stuck in {}", self.fsm.state());
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    fn must(id: FeatureId) -> FeatureDescriptor {
        FeatureDescriptor::new(id, SupportLevel::MustSupport, 0)
    }

    fn hs2(device_asks: &[FeatureDescriptor], offer: FeatureId) -> Vec<u8> {
        let mut table = [0u8; FEATURE_COUNT];
        for d in device_asks {
            table[d.id.index()] = d.info_byte();
        }
        let mut body = Vec::new();
        FeatureQuery::new(table).encode_into(&mut body);
        FeatureEntry {
            id: offer,
            info: must(offer).info_byte(),
            data: &[1, 2, 3],
        }
        .encode_into(&mut body);
        frame(CtrlMsgId::Hs2, 0, &body)
    }

    fn md_hs2() -> Vec<u8> {
        hs2(&[must(FeatureId::MD_PORT_CFG)], FeatureId::MD_PORT_ENUM)
    }

    fn sap_hs2() -> Vec<u8> {
        hs2(&[], FeatureId::SAP_PORT_ENUM)
    }

    fn up(r: &Rig) {
        assert_eq!(r.send(EventId::DevAdd, EventFlag::empty()), EventStatus::Done);
    }

    fn ready(r: &Rig) {
        up(r);
        r.send(EventId::Startup, EventFlag::MD_HS_START);
        r.send_with(EventId::Startup, EventFlag::MD_HS2_DONE, &md_hs2());
        r.send(EventId::Startup, EventFlag::SAP_HS_START);
        assert_eq!(
            r.send_with(EventId::Startup, EventFlag::SAP_HS2_DONE, &sap_hs2()),
            EventStatus::Done
        );
        assert_eq!(r.fsm.state(), State::Ready);
    }

    #[test]
    fn test_dev_add_registers_sources() {
        let r = rig(HwVariant::Standard);
        assert_eq!(r.fsm.state(), State::Off);
        up(&r);

        assert_eq!(r.fsm.state(), State::On);
        assert!(r.hal.has_ext_handler(D2hEvent::ASYNC_HS_NOTIFY_MD));
        assert!(r.hal.has_ext_handler(D2hEvent::EXCEPT_INIT));
        assert!(!r.hal.is_ext_masked(D2hEvent::ASYNC_HS_NOTIFY_SAP));
        assert!(!r.hal.is_irq_masked(IrqSource::ALL[0]));
        assert!(r.md.has_rx_handler() && r.sap.has_rx_handler());
        assert_eq!(*r.seen.lock().unwrap(), vec![
            (Phase::Pre, State::Off, State::On, EventId::DevAdd),
            (Phase::Post, State::Off, State::On, EventId::DevAdd),
        ]);
    }

    #[test]
    fn test_pre_sees_old_state_post_sees_new() {
        let r = rig(HwVariant::Standard);
        let observed = Arc::new(Mutex::new(Vec::new()));
        let shared = r.fsm.shared.clone();
        let sink = observed.clone();
        r.fsm
            .register_notifier(
                OwnerId(9),
                Arc::new(move |_: &Transition| sink.lock().unwrap().push(shared.snapshot.load().state)),
                NotifierPriority::High,
                Phase::Pre,
            )
            .unwrap();
        let shared = r.fsm.shared.clone();
        let sink = observed.clone();
        r.fsm
            .register_notifier(
                OwnerId(9),
                Arc::new(move |_: &Transition| sink.lock().unwrap().push(shared.snapshot.load().state)),
                NotifierPriority::High,
                Phase::Post,
            )
            .unwrap();

        up(&r);
        assert_eq!(*observed.lock().unwrap(), vec![State::Off, State::On]);
    }

    #[test]
    fn test_startup_sends_hs1() {
        let r = rig(HwVariant::Standard);
        up(&r);
        assert_eq!(r.send(EventId::Startup, EventFlag::MD_HS_START), EventStatus::Done);
        assert_eq!(r.fsm.state(), State::Bootup);

        let hs1 = r.md.last_written().unwrap();
        assert_eq!(hs1.len(), 12 + FeatureQuery::SIZE);
        assert_eq!(&hs1[12..16], &HEAD_PATTERN.to_le_bytes());
        assert_eq!(&hs1[hs1.len() - 4..], &TAIL_PATTERN.to_le_bytes());
        assert!(r.sap.written().is_empty());
    }

    #[test]
    fn test_round_trip_reaches_ready_once() {
        let r = rig(HwVariant::Flashless);
        let cfg_seen = Arc::new(Mutex::new(Vec::new()));
        let sink = cfg_seen.clone();
        r.fsm
            .register_consumer(
                Endpoint::Md,
                FeatureId::MD_PORT_ENUM,
                Arc::new(move |_: FeatureId, data: &[u8]| {
                    sink.lock().unwrap().extend_from_slice(data);
                    Ok::<(), HookError>(())
                }),
            )
            .unwrap();

        up(&r);
        for (flag, data) in [
            (EventFlag::MD_HS_START, Vec::new()),
            (EventFlag::MD_HS2_DONE, md_hs2()),
            (EventFlag::MD_HS4_DONE, Vec::new()),
            (EventFlag::SAP_HS_START, Vec::new()),
            (EventFlag::SAP_HS2_DONE, sap_hs2()),
        ] {
            assert_eq!(r.send_with(EventId::Startup, flag, &data), EventStatus::Done);
        }

        let snap = r.fsm.snapshot();
        assert_eq!(snap.state, State::Ready);
        assert_eq!(
            snap.session_flags,
            hs_done_mask(HwVariant::Flashless, mdfsm_hal::DeviceConfig::Normal)
        );
        assert_eq!(*cfg_seen.lock().unwrap(), vec![1, 2, 3]);

        let into_ready = r
            .seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _, to, _)| *p == Phase::Post && *to == State::Ready)
            .count();
        assert_eq!(into_ready, 1);

        let hs3 = r.md.last_written().unwrap();
        assert_eq!(
            mdfsm_handshake::wire::CtrlHeader::parse(&hs3).unwrap().0.msg_id().unwrap(),
            CtrlMsgId::Hs3
        );
    }

    #[test]
    fn test_md_only_ready_without_sap() {
        let r = rig(HwVariant::Standard);
        r.hal.set_dev_state(DevState::compose(0, 0, 0, 1));
        up(&r);
        r.send(EventId::Startup, EventFlag::MD_HS_START);
        r.send_with(EventId::Startup, EventFlag::MD_HS2_DONE, &md_hs2());
        assert_eq!(r.fsm.state(), State::Ready);
        assert_eq!(r.send(EventId::Startup, EventFlag::SAP_HS_START), EventStatus::Fail);
    }

    #[test]
    fn test_resubmitted_flag_is_noop() {
        let r = rig(HwVariant::Standard);
        up(&r);
        r.send(EventId::Startup, EventFlag::MD_HS_START);
        let before = r.notified();
        let writes = r.md.written().len();

        assert_eq!(r.send(EventId::Startup, EventFlag::MD_HS_START), EventStatus::Done);
        assert_eq!(r.notified(), before);
        assert_eq!(r.md.written().len(), writes);
        assert_eq!(r.fsm.state(), State::Bootup);
    }

    #[test]
    fn test_bad_hs2_fails_without_transition() {
        let r = rig(HwVariant::Standard);
        up(&r);
        r.send(EventId::Startup, EventFlag::MD_HS_START);
        let before = r.notified();

        let mut bad = md_hs2();
        bad[12] ^= 0xff;
        assert_eq!(
            r.send_with(EventId::Startup, EventFlag::MD_HS2_DONE, &bad),
            EventStatus::Fail
        );
        assert_eq!(r.notified(), before);
        assert_eq!(r.fsm.snapshot().session_flags, EventFlag::MD_HS_START);
    }

    #[test]
    fn test_invalid_pairs_change_nothing() {
        let r = rig(HwVariant::Standard);
        let rejected_from_off = [
            (EventId::Download, EventFlag::DL_JUMP_BL),
            (EventId::Postdump, EventFlag::empty()),
            (EventId::Startup, EventFlag::MD_HS_START),
            (EventId::Mdee, EventFlag::MDEE_INIT),
            (EventId::Linkdown, EventFlag::empty()),
            (EventId::SoftOff, EventFlag::empty()),
        ];
        for (id, flag) in rejected_from_off {
            assert_eq!(r.send(id, flag), EventStatus::Fail, "{} from OFF", id);
        }
        assert_eq!(r.notified(), 0);
        assert_eq!(r.fsm.state(), State::Off);

        ready(&r);
        let before = r.notified();
        for (id, flag) in [
            (EventId::DevAdd, EventFlag::empty()),
            (EventId::Download, EventFlag::DL_JUMP_BL),
            (EventId::Postdump, EventFlag::empty()),
            (EventId::Reinit, EventFlag::empty()),
            (EventId::Mdee, EventFlag::MDEE_PASS),
        ] {
            assert_eq!(r.send(id, flag), EventStatus::Fail, "{} from READY", id);
        }
        assert_eq!(r.notified(), before);
        assert_eq!(r.fsm.state(), State::Ready);
    }

    #[test]
    fn test_cross_endpoint_startup_rejected_before_any_stage() {
        let r = rig(HwVariant::Standard);
        r.hal.set_dev_state(DevState::compose(0, 0, 0, 1));
        up(&r);
        let before = r.notified();

        assert_eq!(
            r.send(EventId::Startup, EventFlag::MD_HS_START | EventFlag::SAP_HS_START),
            EventStatus::Fail
        );
        assert!(r.md.written().is_empty());
        assert!(r.sap.written().is_empty());
        assert_eq!(r.notified(), before);
        assert_eq!(r.fsm.snapshot().session_flags, EventFlag::empty());
        assert_eq!(r.fsm.state(), State::On);

        // The MD endpoint is still fresh and can complete on its own
        assert_eq!(r.send(EventId::Startup, EventFlag::MD_HS_START), EventStatus::Done);
        assert_eq!(r.fsm.state(), State::Bootup);
        assert_eq!(
            r.send_with(EventId::Startup, EventFlag::MD_HS2_DONE, &md_hs2()),
            EventStatus::Done
        );
        assert_eq!(r.fsm.state(), State::Ready);
    }

    #[test]
    fn test_inactive_endpoint_rejected_before_any_stage() {
        let r = rig(HwVariant::Standard);
        r.hal.set_dev_state(DevState::compose(0, 0, 0, 1));
        up(&r);
        assert_eq!(
            r.send(EventId::Startup, EventFlag::SAP_HS_START | EventFlag::SAP_HS2_DONE),
            EventStatus::Fail
        );
        assert!(r.sap.written().is_empty());
        assert_eq!(r.fsm.state(), State::On);
    }

    fn drive_to(r: &Rig, state: State) {
        match state {
            State::Off => {},
            State::On => up(r),
            State::Download => {
                up(r);
                r.send(EventId::Download, EventFlag::DL_JUMP_BL);
            },
            State::Postdump => {
                up(r);
                r.send(EventId::Postdump, EventFlag::empty());
            },
            State::Bootup => {
                up(r);
                r.send(EventId::Startup, EventFlag::MD_HS_START);
            },
            State::Ready => ready(r),
            State::Mdee => {
                ready(r);
                r.send(EventId::Mdee, EventFlag::MDEE_INIT);
            },
        }
        assert_eq!(r.fsm.state(), state);
    }

    fn sample_flag(id: EventId) -> EventFlag {
        match id {
            EventId::Download => EventFlag::DL_JUMP_BL,
            EventId::Startup => EventFlag::MD_HS_START,
            EventId::Mdee => EventFlag::MDEE_INIT,
            _ => EventFlag::empty(),
        }
    }

    /// Next state for `id` in `state`, or `None` when nothing may change
    fn documented_next(state: State, id: EventId) -> Option<State> {
        use State::*;
        match (id, state) {
            (EventId::DevAdd | EventId::Reinit, Off) => Some(On),
            (EventId::Download, On | Download) => Some(Download),
            (EventId::Postdump, On | Download) => Some(Postdump),
            // MD_HS_START is already recorded in Bootup, Ready and Mdee
            (EventId::Startup, On | Download) => Some(Bootup),
            (EventId::Mdee, On | Bootup | Ready | Mdee) => Some(Mdee),
            (EventId::DevRm, _) => Some(Off),
            (
                EventId::Linkdown
                | EventId::Aer
                | EventId::ColdResume
                | EventId::DevResetReq
                | EventId::SoftOff
                | EventId::Pwroff,
                On | Download | Postdump | Bootup | Ready | Mdee,
            ) => Some(Off),
            _ => None,
        }
    }

    #[test]
    fn test_transition_table() {
        for state in State::ALL {
            for id in EventId::ALL {
                let r = rig(HwVariant::Standard);
                drive_to(&r, state);
                let before = r.notified();
                let status = r.send(id, sample_flag(id));

                match documented_next(state, id) {
                    Some(to) => {
                        assert_eq!(status, EventStatus::Done, "{} in {}", id, state);
                        assert_eq!(r.fsm.state(), to, "{} in {}", id, state);
                        assert_eq!(
                            r.seen.lock().unwrap()[before..],
                            [(Phase::Pre, state, to, id), (Phase::Post, state, to, id)],
                            "{} in {}",
                            id,
                            state
                        );
                    },
                    None => {
                        assert_eq!(r.fsm.state(), state, "{} in {}", id, state);
                        assert_eq!(r.notified(), before, "{} in {}", id, state);
                    },
                }
            }
        }
    }

    #[test]
    fn test_download_flow() {
        let r = rig(HwVariant::Standard);
        up(&r);
        assert_eq!(r.send(EventId::Download, EventFlag::DL_JUMP_BL), EventStatus::Done);
        assert_eq!(r.send(EventId::Download, EventFlag::DL_JUMP_DA), EventStatus::Done);
        assert_eq!(r.hal.count(HalCall::AckDevState(HostEvent::EnterDa)), 1);
        assert_eq!(r.send(EventId::Download, EventFlag::MDEE_INIT), EventStatus::Fail);
        assert_eq!(r.send(EventId::Postdump, EventFlag::empty()), EventStatus::Done);
        assert_eq!(r.fsm.state(), State::Postdump);
        assert_eq!(r.send(EventId::Startup, EventFlag::MD_HS_START), EventStatus::Fail);
    }

    #[test]
    fn test_boot_watcher_submits_download() {
        let r = rig(HwVariant::Standard);
        up(&r);
        r.hal.set_dev_state(DevState::compose(1, 1, 0, 0));
        r.wait_for(State::Download);
        assert!(r
            .fsm
            .history()
            .iter()
            .any(|h| h.flag == EventFlag::DL_JUMP_BL));
    }

    #[test]
    fn test_doorbell_and_rx_drive_handshake() {
        let r = rig(HwVariant::Standard);
        up(&r);

        r.hal.fire_ext_evt(D2hEvent::ASYNC_HS_NOTIFY_MD | D2hEvent::ASYNC_HS_NOTIFY_SAP);
        r.wait_for(State::Bootup);
        let deadline = Instant::now() + Duration::from_secs(2);
        while r.sap.written().is_empty() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(r.md.inject(&md_hs2()));
        assert!(r.sap.inject(&sap_hs2()));
        r.wait_for(State::Ready);
    }

    #[test]
    fn test_mdee_init_acks_and_dumps() {
        let r = rig(HwVariant::Standard);
        ready(&r);
        assert_eq!(r.send(EventId::Mdee, EventFlag::MDEE_INIT), EventStatus::Done);
        assert_eq!(r.fsm.state(), State::Mdee);
        assert_eq!(r.hal.sent_events(), vec![H2dEvent::EXCEPT_ACK]);

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(r.hal.count(HalCall::DbgDump), 1);
    }

    #[test]
    fn test_mdee_flow_passes() {
        let cfg = config().with_mdee_dump_delay(Duration::from_millis(500));
        let r = rig_with(HwVariant::Standard, cfg, None);
        ready(&r);
        r.send(EventId::Mdee, EventFlag::MDEE_INIT);
        assert_eq!(r.send(EventId::Mdee, EventFlag::MDEE_CLEARQ_DONE), EventStatus::Done);

        let msg = frame(CtrlMsgId::Mdee, MDEE_CHK_ID, &[]);
        assert_eq!(r.send_with(EventId::Mdee, EventFlag::MDEE_MSG, &msg), EventStatus::Done);
        let reply = r.md.last_written().unwrap();
        let (hdr, _) = mdfsm_handshake::wire::CtrlHeader::parse(&reply).unwrap();
        assert_eq!(hdr.msg_id().unwrap(), CtrlMsgId::MdeeRecOk);

        let bad = frame(CtrlMsgId::Mdee, 0, &[]);
        assert_eq!(r.send_with(EventId::Mdee, EventFlag::MDEE_MSG, &bad), EventStatus::Fail);

        assert_eq!(r.send(EventId::Mdee, EventFlag::MDEE_PASS), EventStatus::Done);
        std::thread::sleep(Duration::from_millis(600));
        assert_eq!(r.hal.count(HalCall::DbgDump), 0);
        assert_eq!(
            r.hal.sent_events(),
            vec![H2dEvent::EXCEPT_ACK, H2dEvent::EXCEPT_CLEARQ_ACK]
        );
    }

    #[test]
    fn test_linkdown_masks_everything() {
        let cfg = config().with_mdee_dump_delay(Duration::from_millis(500));
        let r = rig_with(HwVariant::Standard, cfg, None);
        ready(&r);
        r.send(EventId::Mdee, EventFlag::MDEE_INIT);
        assert_eq!(r.send(EventId::Linkdown, EventFlag::empty()), EventStatus::Done);

        let snap = r.fsm.snapshot();
        assert_eq!(snap.state, State::Off);
        assert!(snap.session_flags.is_empty());
        assert!(r.hal.is_ext_masked(D2hEvent::HS_NOTIFY | D2hEvent::EXCEPT_INIT));
        for src in IrqSource::ALL {
            assert!(r.hal.is_irq_masked(src));
        }
        std::thread::sleep(Duration::from_millis(600));
        assert_eq!(r.hal.count(HalCall::DbgDump), 0);
    }

    #[test]
    fn test_device_reset_request() {
        let r = rig(HwVariant::Standard);
        up(&r);
        assert_eq!(r.send(EventId::DevResetReq, EventFlag::empty()), EventStatus::Done);
        assert_eq!(r.hal.sent_events(), vec![H2dEvent::DEVICE_RESET]);

        r.send(EventId::Reinit, EventFlag::empty());
        r.hal.clear_calls();
        assert!(r.hal.fire_irq(IrqSource::ALL[0]));
        r.wait_for(State::Off);
        assert!(r.hal.sent_events().is_empty());
    }

    #[test]
    fn test_aer_checks_health() {
        let reporter = Arc::new(MockReporter::new());
        let r = rig_with(HwVariant::Standard, config(), Some(reporter.clone()));
        up(&r);
        r.hal.set_mmio_ok(false);
        assert_eq!(r.send(EventId::Aer, EventFlag::empty()), EventStatus::Done);
        assert_eq!(reporter.reports(), vec![ExceptionKind::MmioFault]);
        assert_eq!(r.hal.count(HalCall::DbgDump), 1);
    }

    #[test]
    fn test_reinit_after_off() {
        let r = rig(HwVariant::Standard);
        ready(&r);
        r.send(EventId::SoftOff, EventFlag::empty());
        assert_eq!(r.send(EventId::Reinit, EventFlag::FULL_REINIT), EventStatus::Done);
        assert_eq!(r.hal.count(HalCall::Reinit(ReinitKind::Full)), 1);
        assert_eq!(r.fsm.state(), State::On);
        assert!(r.fsm.snapshot().session_flags.is_empty());

        r.send(EventId::Pwroff, EventFlag::empty());
        r.send(EventId::Reinit, EventFlag::empty());
        assert_eq!(r.hal.count(HalCall::Reinit(ReinitKind::Partial)), 1);

        // Handshake state was reset with the session
        let writes = r.md.written().len();
        r.send(EventId::Startup, EventFlag::MD_HS_START);
        assert_eq!(r.fsm.state(), State::Bootup);
        assert_eq!(r.md.written().len(), writes + 1);
    }

    #[test]
    fn test_head_insert_preempts_tail() {
        let r = rig(HwVariant::Standard);
        up(&r);
        r.fsm.pause().unwrap();
        assert_eq!(r.fsm.actor_state(), ActorState::Paused);

        let tail: Vec<_> = (0..3)
            .map(|_| {
                r.fsm
                    .submit_tracked(EventId::Download, EventFlag::DL_JUMP_BL, &[], SubmitMode::empty())
                    .unwrap()
            })
            .collect();
        let head = r
            .fsm
            .submit_tracked(EventId::Linkdown, EventFlag::empty(), &[], SubmitMode::TO_HEAD)
            .unwrap();
        r.fsm.resume().unwrap();

        assert_eq!(head.wait(Duration::from_secs(2)).unwrap(), EventStatus::Done);
        for ev in &tail {
            assert_eq!(ev.wait(Duration::from_secs(2)).unwrap(), EventStatus::Fail);
            assert!(ev.seq() < head.seq());
        }
        assert_eq!(r.fsm.state(), State::Off);
    }

    #[test]
    fn test_dev_rm_closes_gate() {
        let r = rig(HwVariant::Standard);
        up(&r);
        r.fsm.pause().unwrap();
        let queued = r
            .fsm
            .submit_tracked(EventId::Download, EventFlag::DL_JUMP_BL, &[], SubmitMode::empty())
            .unwrap();
        let rm = r
            .fsm
            .submit_tracked(EventId::DevRm, EventFlag::empty(), &[], SubmitMode::TO_HEAD)
            .unwrap();
        r.fsm.resume().unwrap();

        assert_eq!(rm.wait(Duration::from_secs(2)).unwrap(), EventStatus::Done);
        assert_eq!(queued.wait(Duration::from_secs(2)).unwrap(), EventStatus::Fail);
        assert!(r.fsm.is_gate_closed());
        assert_eq!(
            r.fsm.submit(EventId::DevAdd, EventFlag::empty(), &[], SubmitMode::BLOCKING),
            Err(Error::GateClosed)
        );
        assert!(!r.hal.has_ext_handler(D2hEvent::all()));
        assert!(!r.md.has_rx_handler());
        assert_eq!(r.fsm.history().last().map(|h| h.event), Some(EventId::DevRm));
    }

    #[test]
    fn test_blocking_submit_from_notifier_deadlocks() {
        let r = rig(HwVariant::Standard);
        let result = Arc::new(Mutex::new(None));
        let sink = result.clone();
        let submitter = r.fsm.submitter();
        r.fsm
            .register_notifier(
                OwnerId(7),
                Arc::new(move |_: &Transition| {
                    *sink.lock().unwrap() = Some(submitter.submit(
                        EventId::SoftOff,
                        EventFlag::empty(),
                        &[],
                        SubmitMode::BLOCKING,
                    ));
                }),
                NotifierPriority::Normal,
                Phase::Post,
            )
            .unwrap();
        up(&r);
        assert_eq!(*result.lock().unwrap(), Some(Err(Error::WouldDeadlock)));
    }

    #[test]
    fn test_shutdown_fails_new_work() {
        let r = rig(HwVariant::Standard);
        up(&r);
        r.fsm.unregister_notifier(OwnerId(1)).unwrap();
        assert_eq!(r.fsm.unregister_notifier(OwnerId(1)), Err(Error::UnknownOwner(OwnerId(1))));
        r.fsm.shutdown();
        assert_eq!(r.fsm.actor_state(), ActorState::Stopped);
        assert!(r
            .fsm
            .submit(EventId::SoftOff, EventFlag::empty(), &[], SubmitMode::empty())
            .is_err());
        assert_eq!(r.fsm.pause(), Err(Error::Stopped));
        assert!(!r.md.has_rx_handler());
    }

    #[test]
    fn test_channel_binding_checked() {
        let hal = Arc::new(MockHal::new(HwVariant::Standard));
        let md = Arc::new(MockChannel::new(Endpoint::Md));
        let result = FsmInstance::new(hal, md.clone(), md, config());
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_flashless_override() {
        let r = rig_with(HwVariant::Standard, config().with_flashless(true), None);
        assert!(r.fsm.is_flashless());
        up(&r);
        r.send(EventId::Startup, EventFlag::MD_HS_START);
        r.send_with(EventId::Startup, EventFlag::MD_HS2_DONE, &md_hs2());
        r.send(EventId::Startup, EventFlag::SAP_HS_START);
        r.send_with(EventId::Startup, EventFlag::SAP_HS2_DONE, &sap_hs2());
        assert_eq!(r.fsm.state(), State::Bootup);
        r.send(EventId::Startup, EventFlag::MD_HS4_DONE);
        assert_eq!(r.fsm.state(), State::Ready);
    }
}
