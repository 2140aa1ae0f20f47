//! # Device State Register
//!
//! Decoding of the 32-bit device-state register the modem updates while it
//! walks through its boot ROM, bootloader and OS stages, plus the host-event
//! field the driver writes back.
//!
//! ```text
//!  31    28 27  26 25 24 23        12 11     8 7      4 3      0
//! ┌────────┬──────┬─────┬────────────┬────────┬────────┬────────┐
//! │  HOST  │ rsvd │ CFG │  reserved  │ LK EVT │BROM EVT│ STAGE  │
//! └────────┴──────┴─────┴────────────┴────────┴────────┴────────┘
//! ```

use core::fmt;

// =============================================================================
// FIELD LAYOUT
// =============================================================================

/// Register field masks and shifts
pub mod layout {
    //! Device-state register bit layout

    /// Boot stage field mask
    pub const STAGE_MASK: u32 = 0xF;
    /// Boot ROM event shift
    pub const BROM_EVT_SHIFT: u32 = 4;
    /// Bootloader (LK) event shift
    pub const LK_EVT_SHIFT: u32 = 8;
    /// Width mask shared by the event fields
    pub const EVT_MASK: u32 = 0xF;
    /// Device configuration shift
    pub const DEVICE_CFG_SHIFT: u32 = 24;
    /// Device configuration mask
    pub const DEVICE_CFG_MASK: u32 = 0x3;
    /// Host event shift
    pub const HOST_EVT_SHIFT: u32 = 28;
    /// Host event mask
    pub const HOST_EVT_MASK: u32 = 0xF;
    /// Value read back when the link is gone
    pub const LINK_DOWN_PATTERN: u32 = 0xFFFF_FFFF;
}

use layout::*;

static_assertions::const_assert_eq!(STAGE_MASK & (EVT_MASK << BROM_EVT_SHIFT), 0);
static_assertions::const_assert_eq!((EVT_MASK << BROM_EVT_SHIFT) & (EVT_MASK << LK_EVT_SHIFT), 0);
static_assertions::const_assert_eq!(
    (DEVICE_CFG_MASK << DEVICE_CFG_SHIFT) & (HOST_EVT_MASK << HOST_EVT_SHIFT),
    0
);

// =============================================================================
// FIELD ENUMS
// =============================================================================

/// Boot stage reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum BootStage {
    /// Power-on, nothing running yet
    Init    = 0,
    /// Primary boot ROM
    Brom1   = 1,
    /// Secondary boot ROM (download capable)
    Brom2   = 2,
    /// Bootloader
    Lk      = 3,
    /// Modem OS running; handshake takes over
    Linux   = 4,
    /// Value outside the documented range
    Unknown = 0xF,
}

impl From<u32> for BootStage {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::Init,
            1 => Self::Brom1,
            2 => Self::Brom2,
            3 => Self::Lk,
            4 => Self::Linux,
            _ => Self::Unknown,
        }
    }
}

/// Boot ROM event field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BromEvent {
    /// Normal boot
    Normal       = 0,
    /// Jump to bootloader
    JumpBl       = 1,
    /// Download handshake timed out
    TimeOut      = 2,
    /// Jump to download agent
    JumpDa       = 3,
    /// Host should create the download port
    CreateDlPort = 4,
    /// Primary loader download started
    StartDl      = 5,
    /// Unrecognised value
    Unknown      = 0xF,
}

impl From<u32> for BromEvent {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::Normal,
            1 => Self::JumpBl,
            2 => Self::TimeOut,
            3 => Self::JumpDa,
            4 => Self::CreateDlPort,
            5 => Self::StartDl,
            _ => Self::Unknown,
        }
    }
}

/// Bootloader event field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LkEvent {
    /// Normal boot
    Normal           = 0,
    /// Create the fallback download port
    CreatePdPort     = 1,
    /// Create the reboot port
    CreateRebootPort = 2,
    /// Create the remote port
    CreateRemotePort = 3,
    /// Dump information available
    DumpInfo         = 4,
    /// Create the post-mortem dump port
    CreateDumpPort   = 5,
    /// Unrecognised value
    Unknown          = 0xF,
}

impl From<u32> for LkEvent {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::Normal,
            1 => Self::CreatePdPort,
            2 => Self::CreateRebootPort,
            3 => Self::CreateRemotePort,
            4 => Self::DumpInfo,
            5 => Self::CreateDumpPort,
            _ => Self::Unknown,
        }
    }
}

/// Device configuration strap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceConfig {
    /// MD and SAP both present
    Normal,
    /// Only the MD endpoint is present
    MdOnly,
}

/// Host event written back through `ack_dev_state`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HostEvent {
    /// Host driver initialised
    Init    = 0,
    /// Host acknowledges the jump to the download agent
    EnterDa = 2,
}

impl HostEvent {
    /// Encode into register position
    pub const fn to_reg(self) -> u32 {
        ((self as u32) & HOST_EVT_MASK) << HOST_EVT_SHIFT
    }
}

// =============================================================================
// DEVICE STATE
// =============================================================================

/// Raw device-state register value
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DevState(pub u32);

impl DevState {
    /// Wrap a raw register value
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw value
    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Whether the read came back as all-ones
    pub const fn is_link_down(&self) -> bool {
        self.0 == LINK_DOWN_PATTERN
    }

    /// Boot stage
    pub fn stage(&self) -> BootStage {
        BootStage::from(self.0 & STAGE_MASK)
    }

    /// Boot ROM event
    pub fn brom_event(&self) -> BromEvent {
        BromEvent::from((self.0 >> BROM_EVT_SHIFT) & EVT_MASK)
    }

    /// Bootloader event
    pub fn lk_event(&self) -> LkEvent {
        LkEvent::from((self.0 >> LK_EVT_SHIFT) & EVT_MASK)
    }

    /// Device configuration strap
    pub fn config(&self) -> DeviceConfig {
        match (self.0 >> DEVICE_CFG_SHIFT) & DEVICE_CFG_MASK {
            1 => DeviceConfig::MdOnly,
            _ => DeviceConfig::Normal,
        }
    }

    /// Build a register value from its fields
    pub const fn compose(stage: u32, brom: u32, lk: u32, cfg: u32) -> Self {
        Self(
            (stage & STAGE_MASK)
                | ((brom & EVT_MASK) << BROM_EVT_SHIFT)
                | ((lk & EVT_MASK) << LK_EVT_SHIFT)
                | ((cfg & DEVICE_CFG_MASK) << DEVICE_CFG_SHIFT),
        )
    }
}

impl fmt::Debug for DevState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_link_down() {
            return write!(f, "DevState(link down)");
        }
        f.debug_struct("DevState")
            .field("raw", &format_args!("{:#010x}", self.0))
            .field("stage", &self.stage())
            .field("brom", &self.brom_event())
            .field("lk", &self.lk_event())
            .field("cfg", &self.config())
            .finish()
    }
}

// =============================================================================
// HARDWARE VARIANT
// =============================================================================

/// Silicon variant of the attached modem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwVariant {
    /// Firmware lives in device flash
    Standard,
    /// Firmware is pushed by the host; requires the fourth handshake stage
    Flashless,
}

impl HwVariant {
    /// Whether the MD endpoint must complete the fourth handshake stage
    pub fn requires_hs4(&self) -> bool {
        matches!(self, Self::Flashless)
    }
}

/// Scope of a hardware reinitialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReinitKind {
    /// Reinitialize only the host-visible queues and interrupt routing
    Partial,
    /// Full reinitialization including PCIe windows
    Full,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_decode() {
        let st = DevState::compose(2, 3, 0, 1);
        assert_eq!(st.stage(), BootStage::Brom2);
        assert_eq!(st.brom_event(), BromEvent::JumpDa);
        assert_eq!(st.lk_event(), LkEvent::Normal);
        assert_eq!(st.config(), DeviceConfig::MdOnly);
        assert!(!st.is_link_down());
    }

    #[test]
    fn test_link_down_pattern() {
        let st = DevState::new(LINK_DOWN_PATTERN);
        assert!(st.is_link_down());
    }

    #[test]
    fn test_unknown_stage() {
        assert_eq!(DevState::new(0x9).stage(), BootStage::Unknown);
        assert_eq!(DevState::new(0x90).brom_event(), BromEvent::Unknown);
    }

    #[test]
    fn test_host_event_encoding() {
        assert_eq!(HostEvent::EnterDa.to_reg(), 0x2000_0000);
        assert_eq!(HostEvent::Init.to_reg(), 0);
    }
}
