//! Port trait definitions (Hexagonal Architecture)
//!
//! This module defines async trait interfaces that adapters must implement:
//! - AgentModel, UserSimulator, ConditionJudge, Judge: language-model roles
//! - RunRepository: durable storage for runs and results
//!
//! These traits keep the conversation engine and orchestrator independent of
//! any particular model provider or storage engine.

pub mod language_model;
pub mod run_repository;

pub use language_model::{
    AgentModel, AgentReply, AgentRequest, ConditionJudge, ConditionRequest, DiagnosisRequest,
    Judge, RequestedToolCall, SimulatorRequest, SimulatorTurn, UserSimulator,
};
pub use run_repository::RunRepository;
