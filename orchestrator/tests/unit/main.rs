//! Integration tests, compiled as a single binary

mod common;
mod test_fsm;
mod test_pipeline;
mod test_rollback;
