//! # Exception Reporting
//!
//! Sink for link and MMIO failures detected by the controller. Recovery is
//! decided elsewhere; the controller only reports.

use core::fmt;

/// Kind of hardware failure being reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    /// Link check failed
    LinkDown,
    /// MMIO check failed
    MmioFault,
    /// Device did not reach the OS stage in time
    BootTimeout,
    /// A control-channel write failed during handshake
    ChannelFault,
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkDown => write!(f, "link down"),
            Self::MmioFault => write!(f, "MMIO fault"),
            Self::BootTimeout => write!(f, "boot timeout"),
            Self::ChannelFault => write!(f, "control channel fault"),
        }
    }
}

/// Receiver of exception reports
pub trait ExceptionReporter: Send + Sync {
    /// Report a failure
    fn report(&self, kind: ExceptionKind);
}
