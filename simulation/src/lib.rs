//! Inject reproducible faults and delays into distributed inference.
//!
//! This crate perturbs the data and timing of a host inference engine so its
//! resilience and throughput can be exercised under controlled, degraded
//! conditions. It never performs inference itself: the host asks whether
//! simulation is active and, if so, routes payloads through the fault injector
//! and inserts delays around its real transfers and computations.
//!
//! # Components
//!
//! - [config]: resolve the active simulation profile (memoized per [config::Resolver]).
//! - [fault]: flip bits in raw buffers and perturb token sequences.
//! - [network]: model a lossy, rate-limited link.
//! - [throttle]: model a slower (or faster) accelerator.
//!
//! Delays are expressed through the [Clock] trait so that every suspension is a
//! cooperative yield. A zero delay never touches the clock.
//!
//! # Failure Policy
//!
//! Every public operation has a total contract. When configuration cannot be
//! resolved or a delay cannot be computed, the host behaves exactly as if
//! simulation were disabled. The underlying [Error] remains inspectable through
//! the fallible building blocks (e.g. [config::load], [throttle::compute_delay]).

use std::{future::Future, path::PathBuf, time::Duration};
use thiserror::Error;

pub mod config;
pub mod fault;
pub mod mocks;
pub mod network;
pub mod throttle;
pub mod tokio;

pub use config::{Resolver, Scope, SimulationConfig, Sources};
pub use fault::{DType, Lane, Tensor};
pub use network::Network;
pub use throttle::{Throttle, Tuning, Workload};

/// Errors that can occur while resolving or applying a simulation.
#[derive(Error, Debug)]
pub enum Error {
    #[error("config missing: {0}")]
    ConfigMissing(PathBuf),
    #[error("config unreadable: {0}: {1}")]
    ConfigUnreadable(PathBuf, std::io::Error),
    #[error("config malformed: {0}")]
    Malformed(serde_json::Error),
    #[error("config invalid: {0}")]
    Invalid(serde_json::Error),
    #[error("invalid bit error rate (must be in [0, 1]): {0}")]
    InvalidBitErrorRate(f64),
    #[error("no usable profile")]
    NoProfile,
    #[error("shape mismatch: expected {expected} bytes, found {found}")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("invalid {0}: {1}")]
    InvalidParameter(&'static str, String),
    #[error("invalid delay: {0}ms")]
    InvalidDelay(f64),
}

/// Interface that any scheduler must implement to insert simulated delays.
///
/// Only plain timed suspensions are required: no cancellation, no external
/// signal. Implementations must yield to the scheduler rather than park the
/// calling thread.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Sleep for the given duration.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static;
}
