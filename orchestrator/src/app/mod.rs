//! Application layer: options, component wiring and the run pipeline

pub mod options;
pub mod run;
pub mod state;
