//! SSH tunnel supervisor.
//!
//! Launches the system `ssh` client for each configured port forward, answers
//! its authentication prompts (passwords, TOTP codes, YubiKey OATH and
//! challenge-response) and keeps track of the running sessions.

pub mod cleanup;
pub mod command;
pub mod config;
pub mod error;
pub mod health;
pub mod process;
pub mod responder;
pub mod store;
pub mod supervisor;
pub mod totp;
pub mod tunnel;
pub mod yubikey;

#[cfg(test)]
mod testing;

pub use error::TunnelError;
pub use supervisor::{BatchSummary, SessionInfo, SessionState, Supervisor, SupervisorOptions};
pub use tunnel::{AuthMethod, TunnelConfig};
