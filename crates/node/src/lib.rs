//! Conclave node: composed state machine plus threaded runner.
//!
//! The state machines in `conclave-abba` and `conclave-consensus` are
//! synchronous and deterministic; this crate gives them a home with real
//! threads, storage, and timers:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Node                                   │
//! │                                                                  │
//! │  dispatch thread:  event = recv(); actions = machine.handle();   │
//! │       │                                                          │
//! │       ├── per-peer delivery workers (conclave-net fan-out)       │
//! │       ├── envelope verification pool (rayon)                     │
//! │       ├── timer thread                                           │
//! │       └── monitoring thread                                      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The embedder supplies the socket layer (via [`Transport`] and
//! [`WireIntake`]), the pending-transaction pool ([`BlockFactory`]), and
//! the commit callback ([`CommitSink`]).
//!
//! [`Transport`]: conclave_net::Transport

mod config;
mod error;
mod health;
mod runner;
mod state;
mod timers;
mod traits;

pub use config::{ConfigError, NodeConfig};
pub use error::EngineError;
pub use health::{HealthCheck, HealthStatus, HEALTH_CHECK_FILE};
pub use runner::{NodeHandle, NodeRunner, WireIntake};
pub use state::NodeStateMachine;
pub use timers::{TimerHandle, TimerManager};
pub use traits::{BlockFactory, CommitSink};
