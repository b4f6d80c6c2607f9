//! Infrastructure layer module
//!
//! Process-wide concerns that sit outside the core:
//! - Configuration management (figment)
//! - Logging infrastructure (tracing-subscriber, tracing-appender)

pub mod config;
pub mod logging;
