//! Infrastructure: telemetry bootstrap and infrastructure errors.

pub mod error;
pub mod telemetry;
