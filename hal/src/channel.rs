//! # Control Channels
//!
//! Reliable byte channels, one per logical endpoint, carrying handshake and
//! control messages. Framing below the message level belongs to the
//! transport and is not visible here.

use alloc::sync::Arc;
use core::fmt;

use crate::error::HalResult;

// =============================================================================
// ENDPOINTS
// =============================================================================

/// Logical processor on the device that negotiates with the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Endpoint {
    /// Modem baseband processor
    Md  = 0,
    /// Secondary application processor
    Sap = 1,
}

impl Endpoint {
    /// Both endpoints, in index order
    pub const ALL: [Endpoint; 2] = [Endpoint::Md, Endpoint::Sap];

    /// Array index
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md => write!(f, "MD"),
            Self::Sap => write!(f, "SAP"),
        }
    }
}

// =============================================================================
// CHANNEL TRAIT
// =============================================================================

/// Receive callback; invoked by the transport with one complete message
pub type RxHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Control channel bound to one endpoint
pub trait ControlChannel: Send + Sync {
    /// Endpoint this channel talks to
    fn endpoint(&self) -> Endpoint;

    /// Send one complete message
    fn write(&self, msg: &[u8]) -> HalResult<()>;

    /// Install or clear the receive callback
    fn set_rx_handler(&self, handler: Option<RxHandler>);
}
