pub mod agent_types;
pub mod error;
