//! CLI command implementations.

pub mod repair;
pub mod run;
pub mod runs;
pub mod serve;
