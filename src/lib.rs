//! Turnstile - Request Admission Control
//!
//! This crate implements the admission-control engine embedded in an HTTP
//! service: the component that decides, for every inbound request, whether
//! to admit it or reject it with a retry signal. Three counting algorithms
//! sit behind one store trait, backed either by in-process memory or by a
//! shared Redis sorted set, with a hot-swappable policy layer for
//! whitelists, blacklists, and bypasses.

pub mod clock;
pub mod config;
pub mod error;
pub mod limit;
pub mod middleware;
pub mod store;

pub use config::AdmissionConfig;
pub use error::{Result, TurnstileError};
pub use limit::{AdmissionEngine, Decision, RequestDescriptor};
