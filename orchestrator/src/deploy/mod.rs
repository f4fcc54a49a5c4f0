//! Deployment components

pub mod backup;
pub mod command;
pub mod cron;
pub mod fsm;
pub mod git;
pub mod health;
pub mod lock;
pub mod rollback;
pub mod service;
pub mod update;
