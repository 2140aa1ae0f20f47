//! # mdfsm Handshake
//!
//! Capability negotiation between the host and each control endpoint of the
//! modem co-processor.
//!
//! ```text
//!   host                                   device
//!    │  HS1  feature query (requested)  ──▶  │
//!    │  ◀──  HS2  device query + runtime data│
//!    │  HS3  host runtime data          ──▶  │
//!    │  ◀──  HS4  ack (flashless only)       │
//! ```
//!
//! The crate is transport agnostic: messages go out through
//! [`mdfsm_hal::ControlChannel`] and incoming messages are handed to
//! [`HandshakeInfo`] by the lifecycle controller.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod endpoint;
pub mod error;
pub mod feature;
pub mod hooks;
pub mod wire;

pub use endpoint::{HandshakeInfo, StageFlags, StageOutcome};
pub use error::{HandshakeError, HandshakeResult};
pub use feature::{negotiate, FeatureDescriptor, FeatureId, FeatureSet, SupportLevel};
pub use hooks::{FeatureConsumer, FeatureHooks, FeatureProvider, HookError};
pub use wire::CtrlMsgId;
