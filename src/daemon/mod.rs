//! Daemon process, RPC server, and RPC client.
//!
//! One daemon per database, enforced by the PID file and the socket; at
//! most one auto-start attempt at a time, enforced by `.startlock`;
//! clients that cannot reach a daemon fall back to direct storage access.

pub mod client;
pub mod lifecycle;
pub mod protocol;
pub mod server;

pub use client::{connect, connect_or_start, warn_direct_fallback, RpcClient};
pub use lifecycle::{run, DaemonPhase, PidFile};
pub use protocol::PROTOCOL_VERSION;
