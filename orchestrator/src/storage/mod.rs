//! Orchestrator state storage

pub mod layout;
pub mod run_log;
pub mod settings;
pub mod state_file;
