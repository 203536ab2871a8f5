//! Orchestration of supervised agent sessions.
//!
//! Covers activity tracking, output classification, the task queue and its
//! validator, the scheduler and the supervisor sweep that ties them
//! together on each control-loop tick.

pub mod activity;
pub mod auto_assign;
pub mod continuation;
pub mod output_window;
pub mod patterns;
pub mod scheduler;
pub mod supervisor;
pub mod validator;
