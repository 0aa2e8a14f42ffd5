//! Small, broker-agnostic utilities

mod backoff;

pub use backoff::*;
