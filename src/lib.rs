//! Joshua: a distributed test-simulation supercomputer.
//!
//! This crate is the coordination and scheduling core (§1 PURPOSE &
//! SCOPE): the ensemble registry and its lifecycle (C2), the
//! work-stealing run-claim/heartbeat protocol (C3), the transactional
//! result sink (C4), the per-agent run loop (C5), the local pool manager
//! that scales a fleet of run loops (C6), and the tail/subscribe result
//! stream (C7) — all built on top of the KV namespace and blob store
//! abstraction in [`store`] (C1).
//!
//! The CLI, web upload UI, authentication, and the SQL user database are
//! out of scope (§1) and live outside this crate.

pub mod agent;
pub mod claim;
pub mod config;
pub mod error;
pub mod model;
pub mod registry;
pub mod results;
pub mod store;
pub mod tail;
pub mod wait;
pub mod xml;

pub use agent::{Agent, PoolManager};
pub use claim::{ClaimProtocol, InstanceId};
pub use config::{AgentConfig, PoolConfig, SaveOn};
pub use error::{JoshuaError, JoshuaResult};
pub use registry::Registry;
pub use results::ResultSink;
pub use store::Store;
pub use tail::{TailFilter, TailStream};
pub use wait::Waitable;
