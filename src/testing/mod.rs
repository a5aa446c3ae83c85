//! Testing utilities and mock implementations
//!
//! This module provides mock implementations for testing the bridge without
//! a backend, a message broker or a subscription socket.

pub mod mocks;

pub use mocks::*;
