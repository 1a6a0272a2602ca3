//! Router configuration module
//!
//! This module provides:
//! - State machine tracking each router's configuration phase
//! - The configuration engine (forwarding, reverse-path filtering, static routes)

pub mod engine;
pub mod state;

pub use state::{Phase, RouterState};
