//! Request admission: tier resolution, identity extraction, policy, and
//! the orchestrating engine.

mod engine;
mod key;
mod policy;
mod response;
mod tier;

pub use engine::{AdmissionEngine, Hooks, RequestDescriptor};
pub use key::{CounterKey, Identity};
pub use policy::{compile_wildcard, BypassReason, PolicyState, SkipMatcher};
pub use response::{Decision, Rejection, RejectionBody};
pub use tier::{normalize_path, EffectiveLimit, TierTable};
