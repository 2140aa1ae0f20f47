//! # Controller Errors
//!
//! Every failure maps onto one of four [`ErrorKind`]s. Protocol errors fail
//! only the event that caused them; fatal errors mean the instance is gone.

use std::fmt;

use mdfsm_handshake::HandshakeError;
use mdfsm_hal::{Endpoint, HalError};

use crate::event::{EventFlag, EventId};
use crate::notifier::OwnerId;
use crate::state::State;

/// Result type alias
pub type Result<T> = core::result::Result<T, Error>;

/// Error class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Event or message invalid for the current state
    Protocol,
    /// Allocation failed on a non-blocking path
    Resource,
    /// A bounded wait expired
    Timeout,
    /// The instance was torn down
    Fatal,
}

/// Controller error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Event is not valid from the current state
    InvalidTransition {
        /// Current state
        state: State,
        /// Rejected event
        event: EventId,
    },
    /// Event carries a flag its handler does not accept
    InvalidFlag {
        /// Event
        event: EventId,
        /// Offending flag
        flag: EventFlag,
    },
    /// Endpoint takes no part in this session
    EndpointInactive(Endpoint),
    /// Handshake failed on an endpoint
    Handshake {
        /// Endpoint
        endpoint: Endpoint,
        /// Cause
        source: HandshakeError,
    },
    /// Hardware operation failed
    Hal(HalError),
    /// Device was removed; no more events are accepted
    GateClosed,
    /// Dispatcher has stopped
    Stopped,
    /// Event record could not be allocated
    OutOfMemory,
    /// Wait budget exceeded
    Timeout,
    /// Owner already holds an entry in this list
    DuplicateOwner(OwnerId),
    /// Owner holds no entry
    UnknownOwner(OwnerId),
    /// Call would wait on the dispatcher from the dispatcher itself
    WouldDeadlock,
    /// Configuration rejected
    InvalidConfig(&'static str),
    /// Worker thread could not be spawned
    Spawn,
}

impl Error {
    /// Error class
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfMemory => ErrorKind::Resource,
            Self::Timeout => ErrorKind::Timeout,
            Self::GateClosed | Self::Stopped | Self::Spawn => ErrorKind::Fatal,
            _ => ErrorKind::Protocol,
        }
    }
}

impl From<HalError> for Error {
    fn from(e: HalError) -> Self {
        Self::Hal(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTransition { state, event } => {
                write!(f, "event {} not valid in state {}", event, state)
            },
            Self::InvalidFlag { event, flag } => {
                write!(f, "event {} does not accept flag {:?}", event, flag)
            },
            Self::EndpointInactive(ep) => write!(f, "{} endpoint inactive this session", ep),
            Self::Handshake { endpoint, source } => {
                write!(f, "{} handshake failed: {}", endpoint, source)
            },
            Self::Hal(e) => write!(f, "hardware: {}", e),
            Self::GateClosed => write!(f, "device removed"),
            Self::Stopped => write!(f, "dispatcher stopped"),
            Self::OutOfMemory => write!(f, "event allocation failed"),
            Self::Timeout => write!(f, "timed out"),
            Self::DuplicateOwner(o) => write!(f, "owner {} already registered", o),
            Self::UnknownOwner(o) => write!(f, "owner {} not registered", o),
            Self::WouldDeadlock => write!(f, "call would block the dispatcher on itself"),
            Self::InvalidConfig(why) => write!(f, "invalid config: {}", why),
            Self::Spawn => write!(f, "failed to spawn worker thread"),
        }
    }
}

impl std::error::Error for Error {}
