#![forbid(unsafe_code)]

//! Autonomous supervision of long-lived AI coding-agent terminal sessions.
//!
//! Agents run inside pseudo-terminals or tmux panes. The crate watches
//! their output, hands them queued work, nudges them when they stall,
//! delivers scheduled check-ins and validates what they produce.

pub mod audit;
pub mod backend;
pub mod config;
pub mod errors;
pub mod ipc;
pub mod models;
pub mod orchestrator;
pub mod persistence;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
