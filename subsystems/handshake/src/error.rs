//! Handshake errors

use core::fmt;

use mdfsm_hal::{Endpoint, HalError};

use crate::feature::{FeatureId, SupportLevel};

/// Result type for handshake operations
pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// Handshake failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum HandshakeError {
    /// Message shorter than its framing requires
    Truncated {
        /// Bytes required
        needed: usize,
        /// Bytes available
        got: usize,
    },
    /// Header id differs from what the stage expects
    UnexpectedMessage {
        /// Expected id
        expected: u32,
        /// Received id
        got: u32,
    },
    /// Header id is not a known control message
    UnknownMessage(u32),
    /// Query head/tail sentinels are wrong
    BadSentinel {
        /// Received head
        head: u32,
        /// Received tail
        tail: u32,
    },
    /// Level nibble outside the rule table
    UnknownSupportLevel(u8),
    /// Version does not fit in a nibble
    InvalidVersion(u8),
    /// Feature id outside the query table
    FeatureIdOutOfRange(u8),
    /// Feature listed twice
    DuplicateFeature(FeatureId),
    /// Host requires a feature the peer did not offer as must-support
    MustSupportMismatch {
        /// Feature
        feature: FeatureId,
        /// Peer's level
        response: SupportLevel,
    },
    /// Consumer rejected the peer's payload
    ConsumerRejected(FeatureId),
    /// Provider failed to fill a payload
    ProviderFailed(FeatureId),
    /// A hook is already registered for the feature
    HookExists(FeatureId),
    /// No hook registered for the feature
    HookMissing(FeatureId),
    /// Stage-3 payload exceeds the runtime-data budget
    PayloadOverflow {
        /// Budget in bytes
        budget: usize,
    },
    /// Exception message carried the wrong check id
    BadCheckId(u32),
    /// Stage arrived before its predecessor completed
    OutOfOrder {
        /// Endpoint
        endpoint: Endpoint,
        /// Stage number that arrived
        stage: u8,
    },
    /// Endpoint handshake was aborted earlier in this session
    Aborted(Endpoint),
    /// Control channel failure
    Channel(HalError),
}

impl HandshakeError {
    /// Whether the error came from malformed or unexpected peer data
    pub const fn is_protocol(&self) -> bool {
        !matches!(
            self,
            Self::Channel(_)
                | Self::PayloadOverflow { .. }
                | Self::HookExists(_)
                | Self::HookMissing(_)
        )
    }
}

impl From<HalError> for HandshakeError {
    fn from(e: HalError) -> Self {
        Self::Channel(e)
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { needed, got } => {
                write!(f, "truncated message: need {} bytes, got {}", needed, got)
            },
            Self::UnexpectedMessage { expected, got } => {
                write!(f, "unexpected message id {} (expected {})", got, expected)
            },
            Self::UnknownMessage(id) => write!(f, "unknown message id {}", id),
            Self::BadSentinel { head, tail } => {
                write!(f, "bad query sentinels: head {:#x} tail {:#x}", head, tail)
            },
            Self::UnknownSupportLevel(l) => write!(f, "unknown support level {}", l),
            Self::InvalidVersion(v) => write!(f, "feature version {} out of range", v),
            Self::FeatureIdOutOfRange(id) => write!(f, "feature id {} out of range", id),
            Self::DuplicateFeature(id) => write!(f, "feature {} listed twice", id),
            Self::MustSupportMismatch { feature, response } => {
                write!(f, "feature {} required but peer offers {:?}", feature, response)
            },
            Self::ConsumerRejected(id) => write!(f, "consumer rejected feature {}", id),
            Self::ProviderFailed(id) => write!(f, "provider failed for feature {}", id),
            Self::HookExists(id) => write!(f, "hook already registered for feature {}", id),
            Self::HookMissing(id) => write!(f, "no hook registered for feature {}", id),
            Self::PayloadOverflow { budget } => {
                write!(f, "runtime data exceeds {} byte budget", budget)
            },
            Self::BadCheckId(id) => write!(f, "bad exception check id {:#x}", id),
            Self::OutOfOrder { endpoint, stage } => {
                write!(f, "{} stage {} arrived out of order", endpoint, stage)
            },
            Self::Aborted(ep) => write!(f, "{} handshake aborted", ep),
            Self::Channel(e) => write!(f, "control channel: {}", e),
        }
    }
}
