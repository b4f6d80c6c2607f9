//! Domain layer for the rehearse engine
//!
//! Graph, test and result models plus the port traits that adapters implement.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult, LlmError};
