//! Driplet agent: discovers the services it may stream for, then keeps one
//! relay session per service alive, forwarding log lines and heartbeats
//! until interrupted.

pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod heartbeat;
pub mod log_source;
pub mod metrics;
pub mod relay;
pub mod session;
pub mod shutdown;
pub mod supervisor;
pub mod telemetry;
