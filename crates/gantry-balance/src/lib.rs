//! # gantry-balance
//!
//! The load-balancer family: every route rule owns one [`Balancer`] built
//! from its configured [`StrategyKind`]. Balancers select one instance from
//! a candidate list; the request-aware strategies (consistent-hash, sticky
//! session) additionally see the request itself.
//!
//! Statistics (in-flight counts, latency EWMAs, adaptive weights) are keyed
//! by instance id, never by reference, so they survive an instance briefly
//! disappearing from discovery; stale keys age out.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adaptive;
pub mod balancer;
pub mod basic;
pub mod ring;
pub mod sticky;

pub use adaptive::Adaptive;
pub use balancer::{BalanceError, Balancer, Result, StrategyKind};
pub use basic::{LeastConnections, ResponseTime, RoundRobin, WeightedRandom, WeightedRoundRobin};
pub use ring::ConsistentHash;
pub use sticky::{
    AffinitySource, MemorySessionStore, SessionAffinityConfig, SessionStore, StickySession,
};
