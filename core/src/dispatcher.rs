//! # Event Dispatcher
//!
//! A single worker thread drains the [`EventQueue`] and hands each event to
//! an [`EventHandler`]. Only that thread ever runs a handler, so the
//! handler's state needs no locking.
//!
//! ```text
//!  producers (irq / doorbell / rx / timers / API)
//!        │ EventSubmitter::submit
//!        ▼
//!  ┌──────────────┐   next()   ┌──────────────────┐
//!  │  EventQueue  │──────────▶│ dispatcher thread │──▶ EventHandler::handle
//!  └──────────────┘            └──────────────────┘
//!                                   │ arm/cancel
//!                                   ▼
//!                               watchdog timer (logs overruns)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::diag::{DispatchStats, History, SnapshotCell};
use crate::error::{Error, Result};
use crate::event::{EventFlag, EventId, EventRecord, EventStatus, SubmitMode};
use crate::notifier::NotifierRegistry;
use crate::queue::EventQueue;
use crate::timer::{Timer, TimerControl};

// =============================================================================
// HANDLER SEAM
// =============================================================================

/// Consumer of dispatched events; runs only on the dispatcher thread
pub(crate) trait EventHandler: Send + 'static {
    /// Handle one event; an error fails only this event
    fn handle(&mut self, event: &EventRecord) -> Result<()>;

    /// Release resources after the loop ends
    fn teardown(&mut self) {}
}

// =============================================================================
// SHARED STATE
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct InFlight {
    seq: u64,
    id: EventId,
    flag: EventFlag,
    armed_at: Instant,
}

/// State reachable from producers, the dispatcher and the public API
pub(crate) struct Shared {
    pub(crate) queue: EventQueue,
    pub(crate) stats: DispatchStats,
    pub(crate) snapshot: SnapshotCell,
    pub(crate) history: spin::Mutex<History>,
    pub(crate) notifiers: NotifierRegistry,
    seq: AtomicU64,
    watchdog: Duration,
    blocking_timeout: Duration,
    worker: spin::Once<ThreadId>,
    current: spin::Mutex<Option<InFlight>>,
}

impl Shared {
    pub(crate) fn new(watchdog: Duration, blocking_timeout: Duration, history: usize) -> Self {
        Self {
            queue: EventQueue::new(),
            stats: DispatchStats::default(),
            snapshot: SnapshotCell::default(),
            history: spin::Mutex::new(History::new(history)),
            notifiers: NotifierRegistry::new(),
            seq: AtomicU64::new(0),
            watchdog,
            blocking_timeout,
            worker: spin::Once::new(),
            current: spin::Mutex::new(None),
        }
    }

    /// Whether the caller is the dispatcher thread
    pub(crate) fn on_worker(&self) -> bool {
        self.worker.get() == Some(&thread::current().id())
    }

    /// Resolve discarded events as failed
    pub(crate) fn fail_all(&self, events: Vec<Arc<EventRecord>>) {
        for ev in events {
            log::debug!(
                target: "mdfsm::dispatch",
                "discarding {} seq {} without dispatch",
                ev.id(),
                ev.seq()
            );
            DispatchStats::bump(&self.stats.failed);
            ev.resolve(EventStatus::Fail);
        }
    }
}

// =============================================================================
// SUBMITTER
// =============================================================================

/// Cloneable handle for queueing events from any thread or callback
#[derive(Clone)]
pub struct EventSubmitter {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EventSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubmitter")
            .field("queued", &self.shared.queue.len())
            .finish()
    }
}

impl EventSubmitter {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Queue an event
    ///
    /// Without [`SubmitMode::BLOCKING`] this returns
    /// [`EventStatus::Ongoing`] as soon as the event is queued. With it, the
    /// caller waits for the resolved status, up to the blocking timeout.
    pub fn submit(
        &self,
        id: EventId,
        flag: EventFlag,
        data: &[u8],
        mode: SubmitMode,
    ) -> Result<EventStatus> {
        if mode.contains(SubmitMode::BLOCKING) && self.shared.on_worker() {
            return Err(Error::WouldDeadlock);
        }
        let record = self.enqueue(id, flag, data, mode)?;
        if !mode.contains(SubmitMode::BLOCKING) {
            return Ok(EventStatus::Ongoing);
        }
        record.wait(self.shared.blocking_timeout).map_err(|e| {
            log::warn!(
                target: "mdfsm::dispatch",
                "blocking submit of {} seq {} timed out",
                id,
                record.seq()
            );
            e
        })
    }

    /// Queue an event and return its record for later inspection
    pub fn submit_tracked(
        &self,
        id: EventId,
        flag: EventFlag,
        data: &[u8],
        mode: SubmitMode,
    ) -> Result<Arc<EventRecord>> {
        self.enqueue(id, flag, data, mode - SubmitMode::BLOCKING)
    }

    fn enqueue(
        &self,
        id: EventId,
        flag: EventFlag,
        data: &[u8],
        mode: SubmitMode,
    ) -> Result<Arc<EventRecord>> {
        let payload = if mode.contains(SubmitMode::ATOMIC) {
            let mut buf = Vec::new();
            if buf.try_reserve_exact(data.len()).is_err() {
                DispatchStats::bump(&self.shared.stats.rejected);
                return Err(Error::OutOfMemory);
            }
            buf.extend_from_slice(data);
            buf
        } else {
            data.to_vec()
        };

        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(EventRecord::new(id, flag, payload, mode, seq));

        if let Err(e) = self.shared.queue.push(record.clone(), mode) {
            DispatchStats::bump(&self.shared.stats.rejected);
            record.resolve(EventStatus::Fail);
            log::debug!(
                target: "mdfsm::dispatch",
                "rejected {} {:?}: {}",
                id,
                flag,
                e
            );
            return Err(e);
        }

        DispatchStats::bump(&self.shared.stats.submitted);
        log::debug!(
            target: "mdfsm::dispatch",
            "queued {} {:?} seq {} ({:?})",
            id,
            flag,
            seq,
            mode
        );
        Ok(record)
    }
}

// =============================================================================
// WORKER
// =============================================================================

/// Owner of the dispatcher thread
pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Start the worker thread
    pub(crate) fn spawn<H: EventHandler>(shared: Arc<Shared>, handler: H) -> Result<Self> {
        let watchdog = {
            let shared = shared.clone();
            Timer::spawn("mdfsm-watchdog", move || {
                check_overrun(&shared);
                TimerControl::Stop
            })?
        };

        let worker = shared.clone();
        let thread = thread::Builder::new()
            .name("mdfsm-fsm".to_string())
            .spawn(move || run(&worker, handler, watchdog))
            .map_err(|_| Error::Spawn)?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Stop the loop, fail everything queued and join the thread
    pub(crate) fn shutdown(&mut self) {
        let drained = self.shared.queue.stop();
        self.shared.fail_all(drained);
        if let Some(t) = self.thread.take() {
            if t.thread().id() == thread::current().id() {
                return;
            }
            if t.join().is_err() {
                log::error!(target: "mdfsm::dispatch", "dispatcher thread panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Count and log the in-flight event if its own watchdog period has run out
///
/// A firing that lost the race with `cancel` may land while the next event
/// is already in flight; that event was armed too recently to be blamed.
fn check_overrun(shared: &Shared) -> bool {
    let cur = match *shared.current.lock() {
        Some(cur) => cur,
        None => return false,
    };
    let running = cur.armed_at.elapsed();
    if running < shared.watchdog {
        log::trace!(
            target: "mdfsm::dispatch",
            "stale watchdog firing ignored for seq {}",
            cur.seq
        );
        return false;
    }
    DispatchStats::bump(&shared.stats.watchdog_expired);
    log::warn!(
        target: "mdfsm::dispatch",
        "{} {:?} seq {} still running after {:?}",
        cur.id,
        cur.flag,
        cur.seq,
        running
    );
    true
}

fn run<H: EventHandler>(shared: &Shared, mut handler: H, watchdog: Timer) {
    shared.worker.call_once(|| thread::current().id());
    log::debug!(target: "mdfsm::dispatch", "dispatcher started");

    while let Some(event) = shared.queue.next() {
        log::trace!(
            target: "mdfsm::dispatch",
            "dispatching {} seq {} ({:?}) after {:?} queued",
            event.id(),
            event.seq(),
            event.mode(),
            event.age()
        );
        *shared.current.lock() = Some(InFlight {
            seq: event.seq(),
            id: event.id(),
            flag: event.flag(),
            armed_at: Instant::now(),
        });
        watchdog.arm(shared.watchdog);

        let result = handler.handle(&event);

        watchdog.cancel();
        *shared.current.lock() = None;
        DispatchStats::bump(&shared.stats.dispatched);

        match result {
            Ok(()) => event.resolve(EventStatus::Done),
            Err(e) => {
                DispatchStats::bump(&shared.stats.failed);
                log::warn!(
                    target: "mdfsm::dispatch",
                    "{} {:?} seq {} failed: {}",
                    event.id(),
                    event.flag(),
                    event.seq(),
                    e
                );
                event.resolve(EventStatus::Fail);
            },
        }
    }

    handler.teardown();
    log::debug!(target: "mdfsm::dispatch", "dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        seen: Arc<Mutex<Vec<(EventId, u64)>>>,
        delay: Duration,
    }

    impl EventHandler for Recorder {
        fn handle(&mut self, event: &EventRecord) -> Result<()> {
            thread::sleep(self.delay);
            self.seen.lock().unwrap().push((event.id(), event.seq()));
            match event.id() {
                EventId::Aer => Err(Error::InvalidTransition {
                    state: crate::state::State::Off,
                    event: EventId::Aer,
                }),
                _ => Ok(()),
            }
        }
    }

    fn start(
        delay: Duration,
        watchdog: Duration,
    ) -> (Dispatcher, EventSubmitter, Arc<Mutex<Vec<(EventId, u64)>>>) {
        let shared = Arc::new(Shared::new(watchdog, watchdog * 2, 8));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let d = Dispatcher::spawn(shared.clone(), Recorder {
            seen: seen.clone(),
            delay,
        })
        .unwrap();
        (d, EventSubmitter::new(shared), seen)
    }

    #[test]
    fn test_blocking_submit_resolves() {
        let (_d, sub, _) = start(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(
            sub.submit(EventId::DevAdd, EventFlag::empty(), &[], SubmitMode::BLOCKING),
            Ok(EventStatus::Done)
        );
        assert_eq!(
            sub.submit(EventId::Aer, EventFlag::empty(), &[], SubmitMode::BLOCKING),
            Ok(EventStatus::Fail)
        );
        // The loop survives a failed handler
        assert_eq!(
            sub.submit(EventId::SoftOff, EventFlag::empty(), &[], SubmitMode::BLOCKING),
            Ok(EventStatus::Done)
        );
    }

    #[test]
    fn test_head_insert_runs_first() {
        let (_d, sub, seen) = start(Duration::from_millis(20), Duration::from_secs(1));
        sub.queue_pause();
        for _ in 0..3 {
            sub.submit(EventId::Download, EventFlag::empty(), &[], SubmitMode::empty())
                .unwrap();
        }
        let head = sub
            .submit_tracked(EventId::Postdump, EventFlag::empty(), &[], SubmitMode::TO_HEAD)
            .unwrap();
        sub.queue_resume();
        assert_eq!(head.wait(Duration::from_secs(2)), Ok(EventStatus::Done));
        assert_eq!(seen.lock().unwrap()[0].0, EventId::Postdump);
    }

    #[test]
    fn test_shutdown_fails_queued() {
        let (mut d, sub, seen) = start(Duration::ZERO, Duration::from_secs(1));
        sub.queue_pause();
        let queued = sub
            .submit_tracked(EventId::Download, EventFlag::empty(), &[], SubmitMode::empty())
            .unwrap();
        d.shutdown();
        assert_eq!(queued.status(), EventStatus::Fail);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(
            sub.submit(EventId::DevAdd, EventFlag::empty(), &[], SubmitMode::empty()),
            Err(Error::Stopped)
        );
        // Both the queue and this test hold the record until now
        assert_eq!(Arc::strong_count(&queued), 1);
    }

    #[test]
    fn test_watchdog_is_diagnostic_only() {
        let (_d, sub, _) = start(Duration::from_millis(40), Duration::from_millis(10));
        let status = sub
            .submit_tracked(EventId::DevAdd, EventFlag::empty(), &[], SubmitMode::empty())
            .unwrap()
            .wait(Duration::from_secs(2));
        assert_eq!(status, Ok(EventStatus::Done));
        assert_eq!(sub.shared.stats.snapshot().watchdog_expired, 1);
    }

    #[test]
    fn test_late_watchdog_spares_next_event() {
        let shared = Shared::new(Duration::from_millis(50), Duration::from_millis(100), 8);
        assert!(!check_overrun(&shared));

        // Next event armed just now: a stale firing must not count it
        *shared.current.lock() = Some(InFlight {
            seq: 7,
            id: EventId::Startup,
            flag: EventFlag::MD_HS_START,
            armed_at: Instant::now(),
        });
        assert!(!check_overrun(&shared));
        assert_eq!(shared.stats.snapshot().watchdog_expired, 0);

        let overdue = Instant::now()
            .checked_sub(Duration::from_millis(200))
            .unwrap();
        if let Some(cur) = shared.current.lock().as_mut() {
            cur.armed_at = overdue;
        }
        assert!(check_overrun(&shared));
        assert_eq!(shared.stats.snapshot().watchdog_expired, 1);
    }

    #[test]
    fn test_blocking_timeout_leaves_event_live() {
        let (_d, sub, _) = start(Duration::from_millis(80), Duration::from_millis(10));
        assert_eq!(
            sub.submit(EventId::DevAdd, EventFlag::empty(), &[], SubmitMode::BLOCKING),
            Err(Error::Timeout)
        );
        // Handler still completes afterwards
        thread::sleep(Duration::from_millis(120));
        assert_eq!(sub.shared.stats.snapshot().dispatched, 1);
    }

    impl EventSubmitter {
        fn queue_pause(&self) {
            self.shared.queue.pause().unwrap();
        }

        fn queue_resume(&self) {
            self.shared.queue.resume().unwrap();
        }
    }
}
