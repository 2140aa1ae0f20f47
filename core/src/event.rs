//! # Events
//!
//! Everything that reaches the state machine is an [`EventRecord`]: an
//! [`EventId`] selecting the handler, an [`EventFlag`] reason mask, an
//! optional payload and the [`SubmitMode`] it was queued with.
//!
//! Records are shared as `Arc<EventRecord>` between the queue and a blocking
//! submitter; the resolved [`EventStatus`] sits behind the record's own
//! mutex so each submitter waits only on its own event.

use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::sync::{lock, wait_timeout};

// =============================================================================
// EVENT ID
// =============================================================================

/// Event kinds understood by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventId {
    /// Device attached
    DevAdd      = 0,
    /// Download-flow progress
    Download    = 1,
    /// Post-crash dump flow
    Postdump    = 2,
    /// Handshake progress
    Startup     = 3,
    /// Device exception progress
    Mdee        = 4,
    /// Link lost
    Linkdown    = 5,
    /// Advanced error reporting fault
    Aer         = 6,
    /// Resume from a power state that lost device context
    ColdResume  = 7,
    /// Reset requested
    DevResetReq = 8,
    /// Orderly power-down
    SoftOff     = 9,
    /// Power removed
    Pwroff      = 10,
    /// Device detached
    DevRm       = 11,
    /// Reinitialize after `Off`
    Reinit      = 12,
}

impl EventId {
    /// Every event id
    pub const ALL: [EventId; 13] = [
        EventId::DevAdd,
        EventId::Download,
        EventId::Postdump,
        EventId::Startup,
        EventId::Mdee,
        EventId::Linkdown,
        EventId::Aer,
        EventId::ColdResume,
        EventId::DevResetReq,
        EventId::SoftOff,
        EventId::Pwroff,
        EventId::DevRm,
        EventId::Reinit,
    ];
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DevAdd => "DEV_ADD",
            Self::Download => "DOWNLOAD",
            Self::Postdump => "POSTDUMP",
            Self::Startup => "STARTUP",
            Self::Mdee => "MDEE",
            Self::Linkdown => "LINKDOWN",
            Self::Aer => "AER",
            Self::ColdResume => "COLD_RESUME",
            Self::DevResetReq => "DEV_RESET_REQ",
            Self::SoftOff => "SOFT_OFF",
            Self::Pwroff => "PWROFF",
            Self::DevRm => "DEV_RM",
            Self::Reinit => "REINIT",
        };
        f.write_str(name)
    }
}

// =============================================================================
// EVENT FLAG
// =============================================================================

bitflags::bitflags! {
    /// Reason mask carried by an event
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventFlag: u32 {
        // Handshake progress
        /// SAP stage 1 requested
        const SAP_HS_START = 1 << 0;
        /// SAP stage 2 response arrived
        const SAP_HS2_DONE = 1 << 1;
        /// MD stage 1 requested
        const MD_HS_START  = 1 << 2;
        /// MD stage 2 response arrived
        const MD_HS2_DONE  = 1 << 3;
        /// MD stage 4 acknowledgement arrived
        const MD_HS4_DONE  = 1 << 4;

        // Download flow
        /// Boot ROM jumped to the bootloader
        const DL_JUMP_BL        = 1 << 8;
        /// Boot ROM download window timed out
        const DL_TIMEOUT        = 1 << 9;
        /// Boot ROM jumped to the download agent
        const DL_JUMP_DA        = 1 << 10;
        /// Download port requested
        const DL_PORT_CREATE    = 1 << 11;
        /// Jumped to LK
        const DL_JUMP_LK        = 1 << 12;
        /// Primary loader download started
        const DL_PRIMARY_LOADER = 1 << 13;
        /// Fallback port requested
        const DL_FALLBACK_PORT  = 1 << 14;

        // Exception flow
        /// Device entered exception handling
        const MDEE_INIT        = 1 << 16;
        /// Device cleared its queues
        const MDEE_CLEARQ_DONE = 1 << 17;
        /// Device reset all queues
        const MDEE_ALLQ_RESET  = 1 << 18;
        /// Exception control message arrived
        const MDEE_MSG         = 1 << 19;
        /// Device confirmed our receive-ok
        const MDEE_RECV_OK     = 1 << 20;
        /// Device finished exception handling
        const MDEE_PASS        = 1 << 21;

        /// Reinit with a full hardware reset
        const FULL_REINIT     = 1 << 24;
        /// Reset originated from the device
        const RESET_BY_DEVICE = 1 << 25;

        /// All handshake-progress bits
        const HS_PROGRESS = Self::SAP_HS_START.bits()
            | Self::SAP_HS2_DONE.bits()
            | Self::MD_HS_START.bits()
            | Self::MD_HS2_DONE.bits()
            | Self::MD_HS4_DONE.bits();
        /// All download bits
        const DL_ALL = Self::DL_JUMP_BL.bits()
            | Self::DL_TIMEOUT.bits()
            | Self::DL_JUMP_DA.bits()
            | Self::DL_PORT_CREATE.bits()
            | Self::DL_JUMP_LK.bits()
            | Self::DL_PRIMARY_LOADER.bits()
            | Self::DL_FALLBACK_PORT.bits();
        /// All exception bits
        const MDEE_ALL = Self::MDEE_INIT.bits()
            | Self::MDEE_CLEARQ_DONE.bits()
            | Self::MDEE_ALLQ_RESET.bits()
            | Self::MDEE_MSG.bits()
            | Self::MDEE_RECV_OK.bits()
            | Self::MDEE_PASS.bits();
    }
}

static_assertions::const_assert_eq!(EventFlag::HS_PROGRESS.bits() & EventFlag::DL_ALL.bits(), 0);
static_assertions::const_assert_eq!(EventFlag::DL_ALL.bits() & EventFlag::MDEE_ALL.bits(), 0);
static_assertions::const_assert_eq!(EventFlag::MDEE_ALL.bits() & EventFlag::HS_PROGRESS.bits(), 0);

// =============================================================================
// SUBMIT MODE
// =============================================================================

bitflags::bitflags! {
    /// How an event is queued
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SubmitMode: u32 {
        /// Wait for the event to resolve
        const BLOCKING = 1 << 0;
        /// Queue ahead of every not-yet-started event
        const TO_HEAD  = 1 << 1;
        /// Caller cannot block or fail on allocation (interrupt-like context)
        const ATOMIC   = 1 << 2;
    }
}

// =============================================================================
// STATUS
// =============================================================================

/// Resolution of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventStatus {
    /// Queued or being handled
    Ongoing,
    /// Handler succeeded
    Done,
    /// Handler failed, or the event was discarded
    Fail,
}

// =============================================================================
// RECORD
// =============================================================================

/// A queued event
pub struct EventRecord {
    id: EventId,
    flag: EventFlag,
    data: Vec<u8>,
    mode: SubmitMode,
    seq: u64,
    queued_at: Instant,
    status: Mutex<EventStatus>,
    resolved: Condvar,
}

impl EventRecord {
    pub(crate) fn new(
        id: EventId,
        flag: EventFlag,
        data: Vec<u8>,
        mode: SubmitMode,
        seq: u64,
    ) -> Self {
        Self {
            id,
            flag,
            data,
            mode,
            seq,
            queued_at: Instant::now(),
            status: Mutex::new(EventStatus::Ongoing),
            resolved: Condvar::new(),
        }
    }

    /// Event id
    pub fn id(&self) -> EventId {
        self.id
    }

    /// Reason mask
    pub fn flag(&self) -> EventFlag {
        self.flag
    }

    /// Payload (empty when none was given)
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    /// Submission mode
    pub fn mode(&self) -> SubmitMode {
        self.mode
    }

    /// Submission sequence number
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Time spent since submission
    pub fn age(&self) -> Duration {
        self.queued_at.elapsed()
    }

    /// Current status
    pub fn status(&self) -> EventStatus {
        *lock(&self.status)
    }

    /// Resolve the event; only the first resolution sticks
    pub(crate) fn resolve(&self, status: EventStatus) {
        let mut cur = lock(&self.status);
        if *cur == EventStatus::Ongoing {
            *cur = status;
            self.resolved.notify_all();
        }
    }

    /// Wait until the event resolves or `timeout` passes
    pub fn wait(&self, timeout: Duration) -> Result<EventStatus> {
        let deadline = Instant::now() + timeout;
        let mut cur = lock(&self.status);
        while *cur == EventStatus::Ongoing {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            cur = wait_timeout(&self.resolved, cur, deadline - now);
        }
        Ok(*cur)
    }
}

impl fmt::Debug for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRecord")
            .field("seq", &self.seq)
            .field("id", &self.id)
            .field("flag", &self.flag)
            .field("len", &self.data.len())
            .field("mode", &self.mode)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn record() -> EventRecord {
        EventRecord::new(
            EventId::Startup,
            EventFlag::MD_HS_START,
            vec![1, 2],
            SubmitMode::BLOCKING,
            7,
        )
    }

    #[test]
    fn test_first_resolution_sticks() {
        let r = record();
        assert_eq!(r.status(), EventStatus::Ongoing);
        r.resolve(EventStatus::Done);
        r.resolve(EventStatus::Fail);
        assert_eq!(r.status(), EventStatus::Done);
    }

    #[test]
    fn test_wait_times_out() {
        let r = record();
        assert_eq!(r.wait(Duration::from_millis(10)), Err(Error::Timeout));
    }

    #[test]
    fn test_wait_wakes_on_resolve() {
        let r = Arc::new(record());
        let r2 = r.clone();
        let t = thread::spawn(move || r2.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(10));
        r.resolve(EventStatus::Fail);
        assert_eq!(t.join().unwrap(), Ok(EventStatus::Fail));
    }

    #[test]
    fn test_flag_groups_disjoint() {
        assert!(!EventFlag::HS_PROGRESS.intersects(EventFlag::DL_ALL));
        assert!(!EventFlag::HS_PROGRESS.intersects(EventFlag::MDEE_ALL));
        assert!(!EventFlag::DL_ALL.intersects(EventFlag::MDEE_ALL));
    }
}
