//! The `utils` module provides definitions shared across `smsgate`:
//! error types and logging setup.

pub mod error;
pub mod logging;
