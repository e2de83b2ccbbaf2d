//! Operational subsystems layered on the core server.

pub mod upgrade;
pub mod watcher;
