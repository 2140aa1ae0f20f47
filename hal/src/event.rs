//! # Event Sources
//!
//! Line interrupts and out-of-band (doorbell style) event channels between
//! host and modem.

use alloc::sync::Arc;

// =============================================================================
// OUT-OF-BAND EVENTS
// =============================================================================

bitflags::bitflags! {
    /// Device-to-host out-of-band events
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct D2hEvent: u32 {
        /// Deep-sleep lock acknowledged
        const PCIE_DS_LOCK = 1 << 8;
        /// Suspend request acknowledged
        const PM_SUSPEND_ACK = 1 << 9;
        /// Resume request acknowledged
        const PM_RESUME_ACK = 1 << 10;
        /// SAP is ready to start its handshake
        const ASYNC_HS_NOTIFY_SAP = 1 << 15;
        /// MD is ready to start its handshake
        const ASYNC_HS_NOTIFY_MD = 1 << 16;
        /// Device entered exception handling
        const EXCEPT_INIT = 1 << 24;
        /// Device finished exception init
        const EXCEPT_INIT_DONE = 1 << 25;
        /// Device cleared its queues
        const EXCEPT_CLEARQ_DONE = 1 << 26;
        /// Device reset all queues
        const EXCEPT_ALLQ_RESET = 1 << 27;
        /// Boot flow advanced; device-state register changed
        const BOOT_FLOW_SYNC = 1 << 28;

        /// Handshake notifications
        const HS_NOTIFY = Self::ASYNC_HS_NOTIFY_SAP.bits() | Self::ASYNC_HS_NOTIFY_MD.bits();
        /// Exception notifications
        const EXCEPT = Self::EXCEPT_INIT.bits()
            | Self::EXCEPT_INIT_DONE.bits()
            | Self::EXCEPT_CLEARQ_DONE.bits()
            | Self::EXCEPT_ALLQ_RESET.bits();
    }
}

bitflags::bitflags! {
    /// Host-to-device out-of-band events
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct H2dEvent: u32 {
        /// Acknowledge exception init
        const EXCEPT_ACK = 1 << 1;
        /// Acknowledge exception queue clear
        const EXCEPT_CLEARQ_ACK = 1 << 2;
        /// Request deep-sleep lock
        const PCIE_DS_LOCK = 1 << 3;
        /// Request suspend
        const PM_SUSPEND_REQ = 1 << 9;
        /// Request resume
        const PM_RESUME_REQ = 1 << 10;
        /// Ask the device to reset itself
        const DEVICE_RESET = 1 << 13;
    }
}

// =============================================================================
// LINE INTERRUPTS
// =============================================================================

/// Line interrupt sources owned by the lifecycle controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum IrqSource {
    /// SAP reset generation unit
    SapRgu = 0,
    /// MD reset generation unit
    MdRgu  = 1,
}

impl IrqSource {
    /// Every line interrupt the controller registers
    pub const ALL: [IrqSource; 2] = [IrqSource::SapRgu, IrqSource::MdRgu];
}

// =============================================================================
// HANDLERS
// =============================================================================

/// Callback for a line interrupt; runs in interrupt-like context
pub type IrqHandler = Arc<dyn Fn(IrqSource) + Send + Sync>;

/// Callback for out-of-band events; receives the bits that fired
pub type ExtEventHandler = Arc<dyn Fn(D2hEvent) + Send + Sync>;
