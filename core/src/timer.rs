//! # One-Shot Timers
//!
//! Each [`Timer`] parks a thread on a condvar until its deadline, runs the
//! callback with no lock held, and either stops or re-arms according to the
//! returned [`TimerControl`]. Arming or cancelling bumps a generation count
//! so a callback racing with `cancel` cannot resurrect the timer.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::sync::{lock, wait, wait_timeout};

/// What a timer does after its callback returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerControl {
    /// Stay disarmed
    Stop,
    /// Fire again after the given delay
    Rearm(Duration),
}

#[derive(Debug, Default)]
struct TimerState {
    deadline: Option<Instant>,
    generation: u64,
    fired: u64,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    cv: Condvar,
}

/// Cloneable arm/cancel handle
#[derive(Debug, Clone)]
pub struct TimerHandle {
    shared: Arc<TimerShared>,
}

impl TimerHandle {
    /// Arm (or re-arm) to fire once after `after`
    pub fn arm(&self, after: Duration) {
        let mut st = lock(&self.shared.state);
        if st.shutdown {
            return;
        }
        st.generation += 1;
        st.deadline = Some(Instant::now() + after);
        self.shared.cv.notify_one();
    }

    /// Disarm; a callback already running still completes
    pub fn cancel(&self) {
        let mut st = lock(&self.shared.state);
        st.generation += 1;
        st.deadline = None;
        self.shared.cv.notify_one();
    }

    /// Whether a deadline is pending
    pub fn is_armed(&self) -> bool {
        lock(&self.shared.state).deadline.is_some()
    }

    /// Number of times the callback has run
    pub fn fired(&self) -> u64 {
        lock(&self.shared.state).fired
    }
}

/// Timer owning its thread; dropping it joins the thread
#[derive(Debug)]
pub struct Timer {
    handle: TimerHandle,
    thread: Option<JoinHandle<()>>,
}

impl Timer {
    /// Spawn a disarmed timer named `name`
    pub fn spawn<F>(name: &str, callback: F) -> Result<Self>
    where
        F: FnMut() -> TimerControl + Send + 'static,
    {
        let shared = Arc::new(TimerShared::default());
        let worker = shared.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&worker, callback))
            .map_err(|_| Error::Spawn)?;
        Ok(Self {
            handle: TimerHandle { shared },
            thread: Some(thread),
        })
    }

    /// Cloneable handle
    pub fn handle(&self) -> TimerHandle {
        self.handle.clone()
    }

    /// See [`TimerHandle::arm`]
    pub fn arm(&self, after: Duration) {
        self.handle.arm(after);
    }

    /// See [`TimerHandle::cancel`]
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// See [`TimerHandle::is_armed`]
    pub fn is_armed(&self) -> bool {
        self.handle.is_armed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        {
            let mut st = lock(&self.handle.shared.state);
            st.shutdown = true;
            st.deadline = None;
            self.handle.shared.cv.notify_all();
        }
        if let Some(t) = self.thread.take() {
            if t.thread().id() != thread::current().id() {
                let _ = t.join();
            }
        }
    }
}

fn run<F>(shared: &TimerShared, mut callback: F)
where
    F: FnMut() -> TimerControl,
{
    let mut st = lock(&shared.state);
    loop {
        if st.shutdown {
            return;
        }
        let deadline = match st.deadline {
            None => {
                st = wait(&shared.cv, st);
                continue;
            },
            Some(d) => d,
        };
        let now = Instant::now();
        if now < deadline {
            st = wait_timeout(&shared.cv, st, deadline - now);
            continue;
        }

        st.deadline = None;
        st.fired += 1;
        let generation = st.generation;
        drop(st);

        let control = callback();

        st = lock(&shared.state);
        if let TimerControl::Rearm(after) = control {
            if !st.shutdown && st.generation == generation {
                st.deadline = Some(Instant::now() + after);
            }
        }
    }
}
