//! # Recording Mocks
//!
//! Host-side stand-ins for the HAL, control channels and exception reporter.
//! Every call is recorded so tests can assert on side effects, and the
//! registered handlers can be fired to simulate interrupts and doorbells.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use crate::channel::{ControlChannel, Endpoint, RxHandler};
use crate::device::{DevState, HostEvent, HwVariant, ReinitKind};
use crate::error::{HalError, HalResult};
use crate::event::{D2hEvent, ExtEventHandler, H2dEvent, IrqHandler, IrqSource};
use crate::exception::{ExceptionKind, ExceptionReporter};
use crate::ModemHal;

// =============================================================================
// CALL RECORD
// =============================================================================

/// One recorded HAL call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalCall {
    /// `ack_dev_state`
    AckDevState(HostEvent),
    /// `register_irq`
    RegisterIrq(IrqSource),
    /// `unregister_irq`
    UnregisterIrq(IrqSource),
    /// `mask_irq`
    MaskIrq(IrqSource),
    /// `unmask_irq`
    UnmaskIrq(IrqSource),
    /// `clear_irq`
    ClearIrq(IrqSource),
    /// `register_ext_evt`
    RegisterExtEvt(D2hEvent),
    /// `unregister_ext_evt`
    UnregisterExtEvt(D2hEvent),
    /// `mask_ext_evt`
    MaskExtEvt(D2hEvent),
    /// `unmask_ext_evt`
    UnmaskExtEvt(D2hEvent),
    /// `clear_ext_evt`
    ClearExtEvt(D2hEvent),
    /// `send_ext_evt`
    SendExtEvt(H2dEvent),
    /// `reinit`
    Reinit(ReinitKind),
    /// `link_check`
    LinkCheck,
    /// `mmio_check`
    MmioCheck,
    /// `dbg_dump`
    DbgDump,
}

// =============================================================================
// MOCK HAL
// =============================================================================

#[derive(Default)]
struct MockHalState {
    calls: Vec<HalCall>,
    irq_handlers: BTreeMap<IrqSource, IrqHandler>,
    ext_handlers: Vec<(D2hEvent, ExtEventHandler)>,
    irq_masked: BTreeMap<IrqSource, bool>,
    ext_masked: D2hEvent,
}

/// Recording [`ModemHal`] implementation
pub struct MockHal {
    variant: HwVariant,
    dev_state: AtomicU32,
    link_ok: AtomicBool,
    mmio_ok: AtomicBool,
    state: Mutex<MockHalState>,
}

impl MockHal {
    /// Create a mock for the given variant with an `Init` device state
    pub fn new(variant: HwVariant) -> Self {
        Self {
            variant,
            dev_state: AtomicU32::new(0),
            link_ok: AtomicBool::new(true),
            mmio_ok: AtomicBool::new(true),
            state: Mutex::new(MockHalState {
                ext_masked: D2hEvent::all(),
                ..MockHalState::default()
            }),
        }
    }

    /// Set the value returned by `get_dev_state`
    pub fn set_dev_state(&self, state: DevState) {
        self.dev_state.store(state.raw(), Ordering::SeqCst);
    }

    /// Make `link_check` succeed or fail
    pub fn set_link_ok(&self, ok: bool) {
        self.link_ok.store(ok, Ordering::SeqCst);
    }

    /// Make `mmio_check` succeed or fail
    pub fn set_mmio_ok(&self, ok: bool) {
        self.mmio_ok.store(ok, Ordering::SeqCst);
    }

    /// Snapshot of every recorded call
    pub fn calls(&self) -> Vec<HalCall> {
        self.state.lock().calls.clone()
    }

    /// Number of recorded calls equal to `call`
    pub fn count(&self, call: HalCall) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Host-to-device events sent so far, in order
    pub fn sent_events(&self) -> Vec<H2dEvent> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                HalCall::SendExtEvt(e) => Some(*e),
                _ => None,
            })
            .collect()
    }

    /// Whether every bit in `events` is currently masked
    pub fn is_ext_masked(&self, events: D2hEvent) -> bool {
        self.state.lock().ext_masked.contains(events)
    }

    /// Whether a line interrupt is currently masked
    pub fn is_irq_masked(&self, source: IrqSource) -> bool {
        self.state
            .lock()
            .irq_masked
            .get(&source)
            .copied()
            .unwrap_or(true)
    }

    /// Whether any handler is registered for `events`
    pub fn has_ext_handler(&self, events: D2hEvent) -> bool {
        self.state
            .lock()
            .ext_handlers
            .iter()
            .any(|(mask, _)| mask.intersects(events))
    }

    /// Simulate device-to-host events; masked bits are dropped
    ///
    /// Returns the number of handlers invoked.
    pub fn fire_ext_evt(&self, events: D2hEvent) -> usize {
        let targets: Vec<(D2hEvent, ExtEventHandler)> = {
            let st = self.state.lock();
            let live = events & !st.ext_masked;
            st.ext_handlers
                .iter()
                .filter(|(mask, _)| mask.intersects(live))
                .map(|(mask, h)| (*mask & live, h.clone()))
                .collect()
        };
        for (bits, handler) in &targets {
            log::trace!(target: "mdfsm::hal", "mock doorbell {:?}", bits);
            handler(*bits);
        }
        targets.len()
    }

    /// Simulate a line interrupt; ignored while masked
    pub fn fire_irq(&self, source: IrqSource) -> bool {
        let handler = {
            let st = self.state.lock();
            if st.irq_masked.get(&source).copied().unwrap_or(true) {
                return false;
            }
            st.irq_handlers.get(&source).cloned()
        };
        match handler {
            Some(h) => {
                log::trace!(target: "mdfsm::hal", "mock interrupt {:?}", source);
                h(source);
                true
            },
            None => false,
        }
    }

    fn record(&self, call: HalCall) {
        self.state.lock().calls.push(call);
    }
}

impl ModemHal for MockHal {
    fn hw_variant(&self) -> HwVariant {
        self.variant
    }

    fn get_dev_state(&self) -> DevState {
        DevState::new(self.dev_state.load(Ordering::SeqCst))
    }

    fn ack_dev_state(&self, event: HostEvent) -> HalResult<()> {
        self.record(HalCall::AckDevState(event));
        Ok(())
    }

    fn register_irq(&self, source: IrqSource, handler: IrqHandler) -> HalResult<()> {
        let mut st = self.state.lock();
        if st.irq_handlers.contains_key(&source) {
            return Err(HalError::AlreadyRegistered);
        }
        st.calls.push(HalCall::RegisterIrq(source));
        st.irq_handlers.insert(source, handler);
        st.irq_masked.insert(source, true);
        Ok(())
    }

    fn unregister_irq(&self, source: IrqSource) -> HalResult<()> {
        let mut st = self.state.lock();
        st.calls.push(HalCall::UnregisterIrq(source));
        st.irq_handlers
            .remove(&source)
            .map(|_| ())
            .ok_or(HalError::NotRegistered)
    }

    fn mask_irq(&self, source: IrqSource) -> HalResult<()> {
        let mut st = self.state.lock();
        st.calls.push(HalCall::MaskIrq(source));
        st.irq_masked.insert(source, true);
        Ok(())
    }

    fn unmask_irq(&self, source: IrqSource) -> HalResult<()> {
        let mut st = self.state.lock();
        st.calls.push(HalCall::UnmaskIrq(source));
        st.irq_masked.insert(source, false);
        Ok(())
    }

    fn clear_irq(&self, source: IrqSource) -> HalResult<()> {
        self.record(HalCall::ClearIrq(source));
        Ok(())
    }

    fn register_ext_evt(&self, events: D2hEvent, handler: ExtEventHandler) -> HalResult<()> {
        let mut st = self.state.lock();
        if st.ext_handlers.iter().any(|(mask, _)| mask.intersects(events)) {
            return Err(HalError::AlreadyRegistered);
        }
        st.calls.push(HalCall::RegisterExtEvt(events));
        st.ext_handlers.push((events, handler));
        st.ext_masked |= events;
        Ok(())
    }

    fn unregister_ext_evt(&self, events: D2hEvent) -> HalResult<()> {
        let mut st = self.state.lock();
        st.calls.push(HalCall::UnregisterExtEvt(events));
        let before = st.ext_handlers.len();
        st.ext_handlers.retain(|(mask, _)| !mask.intersects(events));
        if st.ext_handlers.len() == before {
            return Err(HalError::NotRegistered);
        }
        Ok(())
    }

    fn mask_ext_evt(&self, events: D2hEvent) -> HalResult<()> {
        let mut st = self.state.lock();
        st.calls.push(HalCall::MaskExtEvt(events));
        st.ext_masked |= events;
        Ok(())
    }

    fn unmask_ext_evt(&self, events: D2hEvent) -> HalResult<()> {
        let mut st = self.state.lock();
        st.calls.push(HalCall::UnmaskExtEvt(events));
        st.ext_masked &= !events;
        Ok(())
    }

    fn clear_ext_evt(&self, events: D2hEvent) -> HalResult<()> {
        self.record(HalCall::ClearExtEvt(events));
        Ok(())
    }

    fn send_ext_evt(&self, events: H2dEvent) -> HalResult<()> {
        self.record(HalCall::SendExtEvt(events));
        Ok(())
    }

    fn reinit(&self, kind: ReinitKind) -> HalResult<()> {
        self.record(HalCall::Reinit(kind));
        Ok(())
    }

    fn link_check(&self) -> HalResult<()> {
        self.record(HalCall::LinkCheck);
        if self.link_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HalError::LinkDown)
        }
    }

    fn mmio_check(&self) -> HalResult<()> {
        self.record(HalCall::MmioCheck);
        if self.mmio_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HalError::MmioFault)
        }
    }

    fn dbg_dump(&self) {
        self.record(HalCall::DbgDump);
    }
}

// =============================================================================
// MOCK CHANNEL
// =============================================================================

/// Recording [`ControlChannel`] implementation
pub struct MockChannel {
    endpoint: Endpoint,
    written: Mutex<Vec<Vec<u8>>>,
    rx: Mutex<Option<RxHandler>>,
    fail_writes: AtomicBool,
}

impl MockChannel {
    /// Create a channel for `endpoint`
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            written: Mutex::new(Vec::new()),
            rx: Mutex::new(None),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Messages written so far
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    /// Most recent message written
    pub fn last_written(&self) -> Option<Vec<u8>> {
        self.written.lock().last().cloned()
    }

    /// Make subsequent writes fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Whether a receive handler is installed
    pub fn has_rx_handler(&self) -> bool {
        self.rx.lock().is_some()
    }

    /// Deliver a message from the device side
    pub fn inject(&self, msg: &[u8]) -> bool {
        let handler = self.rx.lock().clone();
        match handler {
            Some(h) => {
                h(msg);
                true
            },
            None => false,
        }
    }
}

impl ControlChannel for MockChannel {
    fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    fn write(&self, msg: &[u8]) -> HalResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(HalError::ChannelWrite);
        }
        self.written.lock().push(msg.to_vec());
        Ok(())
    }

    fn set_rx_handler(&self, handler: Option<RxHandler>) {
        *self.rx.lock() = handler;
    }
}

// =============================================================================
// MOCK REPORTER
// =============================================================================

/// Recording [`ExceptionReporter`]
#[derive(Default)]
pub struct MockReporter {
    reports: Mutex<Vec<ExceptionKind>>,
}

impl MockReporter {
    /// Create an empty reporter
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports received so far
    pub fn reports(&self) -> Vec<ExceptionKind> {
        self.reports.lock().clone()
    }
}

impl ExceptionReporter for MockReporter {
    fn report(&self, kind: ExceptionKind) {
        self.reports.lock().push(kind);
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;

    #[test]
    fn test_masked_ext_events_are_dropped() {
        let hal = MockHal::new(HwVariant::Standard);
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        hal.register_ext_evt(
            D2hEvent::ASYNC_HS_NOTIFY_MD,
            Arc::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        assert_eq!(hal.fire_ext_evt(D2hEvent::ASYNC_HS_NOTIFY_MD), 0);
        hal.unmask_ext_evt(D2hEvent::ASYNC_HS_NOTIFY_MD).unwrap();
        assert_eq!(hal.fire_ext_evt(D2hEvent::ASYNC_HS_NOTIFY_MD), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let hal = MockHal::new(HwVariant::Standard);
        let noop: ExtEventHandler = Arc::new(|_| {});
        hal.register_ext_evt(D2hEvent::EXCEPT, noop.clone()).unwrap();
        assert_eq!(
            hal.register_ext_evt(D2hEvent::EXCEPT_INIT, noop),
            Err(HalError::AlreadyRegistered)
        );
    }

    #[test]
    fn test_channel_records_and_injects() {
        let ch = MockChannel::new(Endpoint::Md);
        ch.write(&[1, 2, 3]).unwrap();
        assert_eq!(ch.last_written(), Some(alloc::vec![1, 2, 3]));

        let seen = Arc::new(AtomicU32::new(0));
        let s = seen.clone();
        ch.set_rx_handler(Some(Arc::new(move |m: &[u8]| {
            s.store(m.len() as u32, Ordering::SeqCst);
        })));
        assert!(ch.inject(&[0; 12]));
        assert_eq!(seen.load(Ordering::SeqCst), 12);

        ch.set_fail_writes(true);
        assert_eq!(ch.write(&[0]), Err(HalError::ChannelWrite));
    }
}
