//! Adapters for external systems: storage, model providers and the HTTP surface.

pub mod http;
pub mod llm;
pub mod sqlite;
