//! Testing utilities and mock implementations
//!
//! Scripted stand-ins for the registry gateway and the progress channel, used
//! by unit tests and by the integration tests under `tests/`.

pub mod mocks;

pub use mocks::*;
