//! # Diagnostics
//!
//! Read-only views of the dispatcher-owned state: a lock-free
//! `(state, session_flags)` snapshot, dispatch counters and a bounded
//! transition history.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::event::{EventFlag, EventId};
use crate::notifier::Transition;
use crate::state::State;

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Consistent view of state and session progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Current state
    pub state: State,
    /// Accumulated handshake progress
    pub session_flags: EventFlag,
}

/// Snapshot packed into one atomic word so readers never tear
#[derive(Debug, Default)]
pub(crate) struct SnapshotCell(AtomicU64);

impl SnapshotCell {
    pub(crate) fn store(&self, state: State, session_flags: EventFlag) {
        let packed = ((state as u64) << 32) | u64::from(session_flags.bits());
        self.0.store(packed, Ordering::Release);
    }

    pub(crate) fn load(&self) -> Snapshot {
        let packed = self.0.load(Ordering::Acquire);
        Snapshot {
            state: State::from_raw((packed >> 32) as u32).unwrap_or_default(),
            session_flags: EventFlag::from_bits_retain(packed as u32),
        }
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Dispatch counters
#[derive(Debug, Default)]
pub(crate) struct DispatchStats {
    pub(crate) submitted: AtomicU64,
    pub(crate) dispatched: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) watchdog_expired: AtomicU64,
}

impl DispatchStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            watchdog_expired: self.watchdog_expired.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the dispatch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Events accepted into the queue
    pub submitted: u64,
    /// Events whose handler ran
    pub dispatched: u64,
    /// Events resolved `Fail` (handler error or discarded)
    pub failed: u64,
    /// Submissions refused before queueing
    pub rejected: u64,
    /// Handlers that overran the watchdog
    pub watchdog_expired: u64,
}

// =============================================================================
// HISTORY
// =============================================================================

/// One applied transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Sequence number of the causing event
    pub seq: u64,
    /// State left
    pub from: State,
    /// State entered
    pub to: State,
    /// Causing event
    pub event: EventId,
    /// Causing flag
    pub flag: EventFlag,
    /// When it was applied
    pub at: Instant,
}

/// Ring of the most recent transitions
#[derive(Debug)]
pub(crate) struct History {
    depth: usize,
    entries: VecDeque<HistoryEntry>,
}

impl History {
    pub(crate) fn new(depth: usize) -> Self {
        Self {
            depth,
            entries: VecDeque::with_capacity(depth),
        }
    }

    pub(crate) fn push(&mut self, seq: u64, t: &Transition) {
        if self.entries.len() == self.depth {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry {
            seq,
            from: t.from,
            to: t.to,
            event: t.event,
            flag: t.flag,
            at: Instant::now(),
        });
    }

    pub(crate) fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.iter().copied().collect()
    }
}
