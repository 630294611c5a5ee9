//! # lib-types
//!
//! Value types shared across the LLM runtime bridge workspace.
//!
//! This crate provides the host-side vocabulary used by the FFI layer and
//! the command-line driver:
//! - Model and context configuration with validated defaults
//! - Session state and per-session statistics
//! - Token identifiers, generation input and output units

pub mod config;
pub mod session;
pub mod token;

pub use config::*;
pub use session::*;
pub use token::*;
