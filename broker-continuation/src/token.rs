use crate::error::{ContinuationError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Everything needed to resume an operation on any worker.
///
/// `S` is the operation's stage enum; stage-scoped state rides inside its
/// variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextStageInput<S> {
    pub stage: S,
    pub resource_id: String,
    /// Provider-side handle for the in-flight request, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<String>,
    #[serde(default)]
    pub retry_attempt: u32,
}

impl<S> NextStageInput<S> {
    pub fn new(stage: S, resource_id: impl Into<String>) -> Self {
        Self {
            stage,
            resource_id: resource_id.into(),
            tracking_id: None,
            retry_attempt: 0,
        }
    }

    pub fn with_tracking_id(mut self, tracking_id: impl Into<String>) -> Self {
        self.tracking_id = Some(tracking_id.into());
        self
    }

    /// Moves to another stage, resetting the retry counter.
    pub fn advance<T>(self, stage: T) -> NextStageInput<T> {
        NextStageInput {
            stage,
            resource_id: self.resource_id,
            tracking_id: self.tracking_id,
            retry_attempt: 0,
        }
    }

    /// Same stage, one more attempt.
    pub fn retry(mut self) -> Self {
        self.retry_attempt += 1;
        self
    }
}

/// The one place tokens are turned into strings and back.
pub struct TokenCodec;

impl TokenCodec {
    pub fn encode<S: Serialize>(input: &NextStageInput<S>) -> Result<String> {
        serde_json::to_string(input).map_err(ContinuationError::TokenEncode)
    }

    pub fn decode<S: DeserializeOwned>(token: &str) -> Result<NextStageInput<S>> {
        serde_json::from_str(token).map_err(ContinuationError::TokenDecode)
    }
}
