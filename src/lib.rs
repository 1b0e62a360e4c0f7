//! pyrunner library
//!
//! Remote, stateful Python execution over WebSocket:
//! - Configuration from defaults, a JSON file and environment variables
//! - Per-connection interpreter sessions with deadline-bounded execution
//! - Output capture and memory reclamation bookkeeping
//! - The axum server exposing `/ws` and `/health`

pub mod backend;
pub mod capture;
pub mod config;
pub mod reclaim;
pub mod server;
pub mod session;
pub mod transport;
