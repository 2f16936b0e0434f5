//! Recording session management
//!
//! This module provides the `SessionController` that manages:
//! - The single-active-session invariant
//! - Starting the encoder, the mixer clock and participant admission
//! - Ordered, idempotent teardown on stop, transport loss or encoder failure
//! - Session events for whatever layer drives the recorder

mod controller;
mod state;
mod summary;

pub use controller::SessionController;
pub use summary::{EndReason, SessionEvent, SessionSummary};
