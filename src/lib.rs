//! Core subsystems of a peer-to-peer file-synchronization daemon:
//! peer discovery, identity/trust, the wire protocol engine, folder
//! synchronization, and the filesystem watcher that feeds it.
//!
//! This crate has no network listener or CLI of its own; it is the set
//! of leaf components a daemon binary wires together (see each
//! module's `Service` impls for the long-running pieces and
//! `config::CoreConfig` for how they're configured).

pub mod cache;
pub mod cert;
pub mod config;
pub mod discovery;
pub mod error;
pub mod health;
pub mod memory_budget;
pub mod metrics;
pub mod protocol;
pub mod service;
pub mod sync;
pub mod watcher;

pub use config::{ConfigBuilder, CoreConfig};
pub use error::{CoreError, CoreResult};
pub use service::{Service, Supervisor, SupervisorConfig};
