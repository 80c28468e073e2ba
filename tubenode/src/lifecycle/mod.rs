//! Video lifecycle state machine.
//!
//! Per-video status flags plus the rule engine deciding which
//! REST-triggered transition is legal and what broadcast it produces.
//! Every legal transition issues exactly one write job through the
//! coordinator; commit-sensitive broadcasts are emitted only after the
//! write's completion confirms success.

pub mod rules;
pub mod service;

pub use rules::Transition;
pub use service::{LifecycleService, NewVideo};
