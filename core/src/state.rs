//! Lifecycle states

use core::fmt;

/// Lifecycle state of the co-processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum State {
    /// Powered down or detached; initial and terminal
    #[default]
    Off      = 0,
    /// Device added, boot in progress
    On       = 1,
    /// Firmware download flow
    Download = 2,
    /// Post-crash dump flow
    Postdump = 3,
    /// OS running, handshakes in progress
    Bootup   = 4,
    /// All required handshakes complete
    Ready    = 5,
    /// Device exception handling
    Mdee     = 6,
}

impl State {
    /// Every state, in encoding order
    pub const ALL: [State; 7] = [
        State::Off,
        State::On,
        State::Download,
        State::Postdump,
        State::Bootup,
        State::Ready,
        State::Mdee,
    ];

    /// Decode the raw representation
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Off),
            1 => Some(Self::On),
            2 => Some(Self::Download),
            3 => Some(Self::Postdump),
            4 => Some(Self::Bootup),
            5 => Some(Self::Ready),
            6 => Some(Self::Mdee),
            _ => None,
        }
    }

    /// Short name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::On => "ON",
            Self::Download => "DOWNLOAD",
            Self::Postdump => "POSTDUMP",
            Self::Bootup => "BOOTUP",
            Self::Ready => "READY",
            Self::Mdee => "MDEE",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
