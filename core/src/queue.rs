//! # Event Queue
//!
//! FIFO of pending events shared by every producer and the single
//! dispatcher. The queue also carries the dispatcher's actor state, so one
//! mutex orders enqueue, pause, gate-close and stop against dequeue.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{Error, Result};
use crate::event::{EventRecord, SubmitMode};
use crate::sync::{lock, wait};

/// Dispatcher actor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    /// Dequeuing events
    Running,
    /// Holding events until resumed
    Paused,
    /// Gone for good
    Stopped,
}

#[derive(Debug)]
struct QueueInner {
    events: VecDeque<Arc<EventRecord>>,
    actor: ActorState,
    /// Dispatcher has acknowledged the pause and is idle
    parked: bool,
    gate_closed: bool,
}

/// Pending events plus dispatcher control
#[derive(Debug)]
pub(crate) struct EventQueue {
    inner: Mutex<QueueInner>,
    /// Wakes the dispatcher
    wake: Condvar,
    /// Wakes pausers once the dispatcher parks
    parked: Condvar,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                events: VecDeque::new(),
                actor: ActorState::Running,
                parked: false,
                gate_closed: false,
            }),
            wake: Condvar::new(),
            parked: Condvar::new(),
        }
    }

    /// Queue an event at the tail, or at the head for `TO_HEAD`
    pub(crate) fn push(&self, event: Arc<EventRecord>, mode: SubmitMode) -> Result<()> {
        let mut q = lock(&self.inner);
        if q.actor == ActorState::Stopped {
            return Err(Error::Stopped);
        }
        if q.gate_closed {
            return Err(Error::GateClosed);
        }
        if mode.contains(SubmitMode::ATOMIC) {
            q.events.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        }
        if mode.contains(SubmitMode::TO_HEAD) {
            q.events.push_front(event);
        } else {
            q.events.push_back(event);
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Block until an event is runnable; `None` once stopped
    pub(crate) fn next(&self) -> Option<Arc<EventRecord>> {
        let mut q = lock(&self.inner);
        loop {
            match q.actor {
                ActorState::Stopped => return None,
                ActorState::Paused => {
                    if !q.parked {
                        q.parked = true;
                        self.parked.notify_all();
                    }
                },
                ActorState::Running => {
                    if let Some(ev) = q.events.pop_front() {
                        return Some(ev);
                    }
                },
            }
            q = wait(&self.wake, q);
        }
    }

    /// Request a pause and wait until the dispatcher is idle
    pub(crate) fn pause(&self) -> Result<()> {
        let mut q = lock(&self.inner);
        match q.actor {
            ActorState::Stopped => return Err(Error::Stopped),
            ActorState::Paused => {},
            ActorState::Running => {
                q.actor = ActorState::Paused;
                q.parked = false;
                self.wake.notify_all();
            },
        }
        while q.actor == ActorState::Paused && !q.parked {
            q = wait(&self.parked, q);
        }
        if q.actor == ActorState::Stopped {
            return Err(Error::Stopped);
        }
        Ok(())
    }

    /// Leave the paused state
    pub(crate) fn resume(&self) -> Result<()> {
        let mut q = lock(&self.inner);
        match q.actor {
            ActorState::Stopped => Err(Error::Stopped),
            _ => {
                q.actor = ActorState::Running;
                q.parked = false;
                self.wake.notify_all();
                Ok(())
            },
        }
    }

    /// Refuse further submissions and hand back every queued event
    pub(crate) fn close_gate(&self) -> Vec<Arc<EventRecord>> {
        let mut q = lock(&self.inner);
        q.gate_closed = true;
        q.events.drain(..).collect()
    }

    /// Stop the dispatcher and hand back every queued event
    pub(crate) fn stop(&self) -> Vec<Arc<EventRecord>> {
        let mut q = lock(&self.inner);
        q.actor = ActorState::Stopped;
        q.gate_closed = true;
        self.wake.notify_all();
        self.parked.notify_all();
        q.events.drain(..).collect()
    }

    pub(crate) fn actor(&self) -> ActorState {
        lock(&self.inner).actor
    }

    pub(crate) fn is_gate_closed(&self) -> bool {
        lock(&self.inner).gate_closed
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.inner).events.len()
    }
}
