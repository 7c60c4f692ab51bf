pub mod agent;
pub mod config;
pub mod logging;
pub mod rate_limit;
pub mod web;

pub use chatrelay_core::agent_types;
pub use chatrelay_core::error;
