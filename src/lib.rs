//! Replay Harness - conformance replay verifier for a two-player game engine
//!
//! Replays a captured session against a freshly started engine, writing every
//! recorded client message and byte-comparing every message the engine sends
//! back.

pub mod batch;
pub mod config;
pub mod error;
pub mod logger;
pub mod replay;
pub mod roster;
pub mod session;
pub mod verify;
pub mod wire;

pub use error::{HarnessError, Result};
