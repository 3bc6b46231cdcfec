//! arcdeck - event fabric for a single-device arc media controller.
//!
//! Cooperating services exchange typed messages over localhost:
//! - Input daemon: HID decode, menu hosting, event fan-out
//! - Router: active-source state machine, media gating, command fan-out
//! - Player adapters: networked speaker and local decoder backends
//! - Volume adapters: debounced control of the configured output path
//! - Remote ingress: IR and Bluetooth LE key-code translation
//! - Supervisor: timer-driven non-authoritative restarts

// =============================================================================
// Lints - Enforce code quality and consistency
// =============================================================================

// Deny truly dangerous patterns (these will fail the build)
#![deny(unsafe_code)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

pub mod bus;
pub mod config;
pub mod ingress;
pub mod input;
pub mod peer;
pub mod players;
pub mod router;
pub mod source;
pub mod supervisor;
pub mod volume;
