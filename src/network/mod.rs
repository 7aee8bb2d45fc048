//! Connection engine.
//!
//! The manager owns a set of connections and drives them through a
//! pluggable mux backend: readiness events set per-connection work
//! flags, the executor runs `work()` passes that move bytes between
//! the socket and the byte streams, decode packets and dispatch them.
//!
//! # Components
//!
//! - `Socket`: non-blocking TCP/UDP handle
//! - `Connection`: work-flag state machine around one peer
//! - `Manager`: connection table, listener, executor, rpc registry
//! - `backend`: the sweep / readiness / completion drivers

pub use backend::{CompletionBackend, MuxBackend, ReadinessBackend, SweepBackend};
pub use connection::{work_flag, Connection, PacketDispatcher};
pub use manager::{ConnectionCallback, Manager, ManagerStats, WorkItem};
pub use socket::{IoOutcome, Socket};

pub mod backend;
mod connection;
mod manager;
mod socket;
