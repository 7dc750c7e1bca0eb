//! Shared utilities.

pub mod clock;
pub mod telemetry;
pub mod worker;

pub use clock::*;
pub use telemetry::*;
pub use worker::*;
