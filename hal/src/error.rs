//! # HAL Errors
//!
//! Error type returned by hardware and control-channel operations.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// HAL result type alias
pub type HalResult<T> = core::result::Result<T, HalError>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Hardware abstraction error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum HalError {
    /// PCIe link is down (config space or BAR reads return all-ones)
    LinkDown,
    /// MMIO window is not responding
    MmioFault,
    /// Event source is already registered
    AlreadyRegistered,
    /// Event source was never registered
    NotRegistered,
    /// Control channel refused or dropped the frame
    ChannelWrite,
    /// Control channel is closed
    ChannelClosed,
    /// Hardware reinitialization failed
    ReinitFailed,
    /// Operation not supported by this hardware variant
    NotSupported,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkDown => write!(f, "PCIe link down"),
            Self::MmioFault => write!(f, "MMIO access fault"),
            Self::AlreadyRegistered => write!(f, "event source already registered"),
            Self::NotRegistered => write!(f, "event source not registered"),
            Self::ChannelWrite => write!(f, "control channel write failed"),
            Self::ChannelClosed => write!(f, "control channel closed"),
            Self::ReinitFailed => write!(f, "hardware reinit failed"),
            Self::NotSupported => write!(f, "operation not supported"),
        }
    }
}

impl HalError {
    /// Whether this error means the device is no longer reachable
    pub fn is_link_failure(&self) -> bool {
        matches!(self, Self::LinkDown | Self::MmioFault)
    }
}
