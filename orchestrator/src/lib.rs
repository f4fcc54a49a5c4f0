//! redeploy library
//!
//! Snapshot, update, restart, verify and roll back a server-hosted
//! application from a git checkout.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod host;
pub mod logs;
pub mod models;
pub mod storage;
pub mod utils;
