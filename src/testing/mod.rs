//! Testing utilities and mock implementations
//!
//! Test doubles for the router's injected seams: a scriptable dispatcher,
//! a store that can be made to fail, and a manually advanced clock.

pub mod mocks;

pub use crate::clock::ManualClock;
pub use mocks::*;
