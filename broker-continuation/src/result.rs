use crate::error::{ContinuationError, Result};
use crate::state::OperationState;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Input to one continuation step.
///
/// `body` carries operation parameters and is echoed unchanged into every
/// follow-up; the token is what advances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinuationInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl ContinuationInput {
    pub fn new(body: serde_json::Value) -> Self {
        Self {
            continuation_token: None,
            body,
        }
    }

    pub fn from_body<T: Serialize>(body: &T) -> Result<Self> {
        serde_json::to_value(body)
            .map(Self::new)
            .map_err(|e| ContinuationError::InvalidInput(e.to_string()))
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.continuation_token = Some(token.into());
        self
    }

    /// The token, treating an empty string as absent.
    pub fn token(&self) -> Option<&str> {
        self.continuation_token.as_deref().filter(|t| !t.is_empty())
    }

    /// Parses the body into the handler's typed input.
    pub fn typed_body<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| ContinuationError::InvalidInput(e.to_string()))
    }
}

/// Outcome of one continuation step.
///
/// Only the constructors can build one, so `next_input` is present exactly
/// when the status is [`OperationState::InProgress`].
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuationResult {
    status: OperationState,
    retry_after: Duration,
    next_input: Option<ContinuationInput>,
    error_reason: Option<String>,
    note: Option<String>,
}

impl ContinuationResult {
    pub fn in_progress(next_input: ContinuationInput, retry_after: Duration) -> Self {
        Self {
            status: OperationState::InProgress,
            retry_after,
            next_input: Some(next_input),
            error_reason: None,
            note: None,
        }
    }

    pub fn succeeded() -> Self {
        Self::terminal(OperationState::Succeeded, None)
    }

    /// Success with an informational reason attached.
    pub fn succeeded_with(note: impl Into<String>) -> Self {
        let mut result = Self::succeeded();
        result.note = Some(note.into());
        result
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::terminal(OperationState::Failed, Some(reason.into()))
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::terminal(OperationState::Cancelled, Some(reason.into()))
    }

    fn terminal(status: OperationState, error_reason: Option<String>) -> Self {
        Self {
            status,
            retry_after: Duration::ZERO,
            next_input: None,
            error_reason,
            note: None,
        }
    }

    pub fn status(&self) -> OperationState {
        self.status
    }

    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }

    pub fn next_input(&self) -> Option<&ContinuationInput> {
        self.next_input.as_ref()
    }

    pub fn into_next_input(self) -> Option<ContinuationInput> {
        self.next_input
    }

    pub fn error_reason(&self) -> Option<&str> {
        self.error_reason.as_deref()
    }

    pub fn note(&self) -> Option<&str> {
        self.note.as_deref()
    }

    /// The error reason for failures, otherwise the note.
    pub fn reason(&self) -> Option<&str> {
        self.error_reason().or(self.note())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_next_input_only_while_in_progress() {
        let running = ContinuationResult::in_progress(
            ContinuationInput::new(json!({})).with_token("t"),
            Duration::from_secs(5),
        );
        assert!(running.next_input().is_some());
        assert!(running.error_reason().is_none());

        for done in [
            ContinuationResult::succeeded(),
            ContinuationResult::failed("boom"),
            ContinuationResult::cancelled("gone"),
        ] {
            assert!(done.is_terminal());
            assert!(done.next_input().is_none());
            assert_eq!(done.retry_after(), Duration::ZERO);
        }
    }

    #[test]
    fn test_empty_token_is_absent() {
        let input = ContinuationInput::new(json!({"id": "a"})).with_token("");
        assert_eq!(input.token(), None);
    }

    #[test]
    fn test_typed_body_rejects_wrong_shape() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Expected {
            resource_id: String,
        }

        let input = ContinuationInput::new(json!({"other": 1}));
        assert!(matches!(
            input.typed_body::<Expected>(),
            Err(ContinuationError::InvalidInput(_))
        ));
    }
}
