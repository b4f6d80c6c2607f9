//! Language-model backends implementing the model-role ports.

pub mod anthropic;
pub mod scripted;

pub use anthropic::AnthropicBackend;
pub use scripted::ScriptedBackend;
