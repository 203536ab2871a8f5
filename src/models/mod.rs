//! Domain model module declarations.

pub mod schedule;
pub mod session;
pub mod task;
pub mod validation;
pub mod workload;
