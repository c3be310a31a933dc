//! VeilTunnel updater library
//!
//! Self-update pipeline and service supervision for the VeilTunnel client:
//! release discovery, artifact staging and integrity verification, and
//! fault-tolerant service transitions around the install. Logging is the
//! embedding application's responsibility; this crate only emits through
//! the `log` facade.

pub mod config;
pub mod mfa;
pub mod service;
pub mod updater;
pub mod utils;
pub mod version;

// Re-export commonly used items
pub use config::UpdaterConfig;
pub use service::{ServiceState, ServiceSupervisor};
pub use updater::{run_update_cycle, CycleOutcome, UpdateChecker};
pub use utils::hidden_command;
pub use utils::with_retry;
pub use version::Version;
