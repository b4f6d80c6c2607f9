//! Live progress protocol.
//!
//! Every message is a JSON object tagged by `type`. Observers receive a `state`
//! snapshot first, then any queued messages, then live broadcasts.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::Message;
use super::result::TestStatus;
use super::run::RunWithResults;

/// Which side of the conversation produced a streamed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenSource {
    Agent,
    Simulator,
}

/// Server-to-observer message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressMessage {
    /// Full snapshot, always the first message an observer receives.
    State {
        run: RunWithResults,
    },
    /// A test was admitted and is about to execute.
    TestStarted {
        result_id: Uuid,
        test_case_id: String,
        test_name: String,
    },
    /// Whole transcript so far, sent after each completed turn.
    TranscriptUpdate {
        result_id: Uuid,
        transcript: Vec<Message>,
    },
    /// Streamed model text. Live only: never queued for late observers.
    TokenUpdate {
        result_id: Uuid,
        token: String,
        source: TokenSource,
    },
    /// A model call failed and will be retried. Token text streamed for
    /// this result since its last transcript update is void.
    RetryError {
        result_id: Uuid,
        error_kind: String,
        message: String,
        attempt: u32,
        max_attempts: u32,
        /// Seconds until the next attempt.
        retry_after: f64,
    },
    /// A test finished with `pass` or `fail`.
    TestCompleted {
        result_id: Uuid,
        status: TestStatus,
    },
    /// A test was skipped while queued, or stopped by shutdown.
    TestCancelled {
        result_id: Uuid,
    },
    /// A test ended in `error`.
    TestError {
        result_id: Uuid,
        error: String,
    },
    /// Last message of a run; the connection closes after it.
    RunCompleted {},
    /// Connection-level failure: unknown run, rejected or unparseable command.
    Error {
        message: String,
    },
}

impl ProgressMessage {
    /// Value of the `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::State { .. } => "state",
            Self::TestStarted { .. } => "test_started",
            Self::TranscriptUpdate { .. } => "transcript_update",
            Self::TokenUpdate { .. } => "token_update",
            Self::RetryError { .. } => "retry_error",
            Self::TestCompleted { .. } => "test_completed",
            Self::TestCancelled { .. } => "test_cancelled",
            Self::TestError { .. } => "test_error",
            Self::RunCompleted {} => "run_completed",
            Self::Error { .. } => "error",
        }
    }

    /// Result this message concerns, if any.
    pub fn result_id(&self) -> Option<Uuid> {
        match self {
            Self::TestStarted { result_id, .. }
            | Self::TranscriptUpdate { result_id, .. }
            | Self::TokenUpdate { result_id, .. }
            | Self::RetryError { result_id, .. }
            | Self::TestCompleted { result_id, .. }
            | Self::TestCancelled { result_id }
            | Self::TestError { result_id, .. } => Some(*result_id),
            Self::State { .. } | Self::RunCompleted {} | Self::Error { .. } => None,
        }
    }

    /// True for messages that end a test.
    pub fn is_test_terminal(&self) -> bool {
        matches!(
            self,
            Self::TestCompleted { .. } | Self::TestCancelled { .. } | Self::TestError { .. }
        )
    }
}

/// Observer-to-server command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Skip one test that has not started yet.
    CancelTest { result_id: Uuid },
    /// Skip every test that has not started yet.
    CancelRun {},
}
