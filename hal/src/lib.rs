//! # mdfsm HAL
//!
//! Hardware abstraction consumed by the modem lifecycle controller.
//!
//! The controller never touches registers directly. Everything it needs from
//! the PCIe function (device-state register, interrupt and doorbell
//! plumbing, reinit, health checks, debug dumps) goes through [`ModemHal`],
//! and handshake/control traffic goes through one [`ControlChannel`] per
//! [`Endpoint`].
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   lifecycle controller                   │
//! └───────────┬──────────────────────────────┬───────────────┘
//!             │ ModemHal                     │ ControlChannel (MD, SAP)
//! ┌───────────┴──────────────┐   ┌───────────┴───────────────┐
//! │ dev-state │ IRQ │ D2H/H2D│   │  port layer / transport   │
//! └──────────────────────────┘   └───────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod channel;
pub mod device;
pub mod error;
pub mod event;
pub mod exception;

#[cfg(any(test, feature = "testing"))]
pub mod mock;

pub use channel::{ControlChannel, Endpoint, RxHandler};
pub use device::{
    BootStage, BromEvent, DevState, DeviceConfig, HostEvent, HwVariant, LkEvent, ReinitKind,
};
pub use error::{HalError, HalResult};
pub use event::{D2hEvent, ExtEventHandler, H2dEvent, IrqHandler, IrqSource};
pub use exception::{ExceptionKind, ExceptionReporter};

// =============================================================================
// HAL TRAIT
// =============================================================================

/// Operations the lifecycle controller needs from the PCIe function
///
/// Implementations must be callable from any thread. Handlers registered
/// here may be invoked from interrupt-like context and must not block.
pub trait ModemHal: Send + Sync {
    /// Silicon variant
    fn hw_variant(&self) -> HwVariant;

    /// Read the device-state register
    fn get_dev_state(&self) -> DevState;

    /// Write the host-event field of the device-state register
    fn ack_dev_state(&self, event: HostEvent) -> HalResult<()>;

    // -------------------------------------------------------------------------
    // Line interrupts
    // -------------------------------------------------------------------------

    /// Register a handler for a line interrupt (left masked)
    fn register_irq(&self, source: IrqSource, handler: IrqHandler) -> HalResult<()>;

    /// Drop the handler for a line interrupt
    fn unregister_irq(&self, source: IrqSource) -> HalResult<()>;

    /// Mask a line interrupt
    fn mask_irq(&self, source: IrqSource) -> HalResult<()>;

    /// Unmask a line interrupt
    fn unmask_irq(&self, source: IrqSource) -> HalResult<()>;

    /// Clear a latched line interrupt
    fn clear_irq(&self, source: IrqSource) -> HalResult<()>;

    // -------------------------------------------------------------------------
    // Out-of-band events
    // -------------------------------------------------------------------------

    /// Register a handler for a set of device-to-host events (left masked)
    fn register_ext_evt(&self, events: D2hEvent, handler: ExtEventHandler) -> HalResult<()>;

    /// Drop the handler for a set of device-to-host events
    fn unregister_ext_evt(&self, events: D2hEvent) -> HalResult<()>;

    /// Mask device-to-host events
    fn mask_ext_evt(&self, events: D2hEvent) -> HalResult<()>;

    /// Unmask device-to-host events
    fn unmask_ext_evt(&self, events: D2hEvent) -> HalResult<()>;

    /// Clear latched device-to-host events
    fn clear_ext_evt(&self, events: D2hEvent) -> HalResult<()>;

    /// Raise host-to-device events
    fn send_ext_evt(&self, events: H2dEvent) -> HalResult<()>;

    // -------------------------------------------------------------------------
    // Recovery and diagnostics
    // -------------------------------------------------------------------------

    /// Reinitialize the hardware interface
    fn reinit(&self, kind: ReinitKind) -> HalResult<()>;

    /// Check that the PCIe link is up
    fn link_check(&self) -> HalResult<()>;

    /// Check that the MMIO window responds
    fn mmio_check(&self) -> HalResult<()>;

    /// Dump debug registers to the log
    fn dbg_dump(&self);
}
