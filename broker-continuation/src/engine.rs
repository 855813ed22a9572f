use crate::error::{ContinuationError, Result};
use crate::result::{ContinuationInput, ContinuationResult};
use crate::state::OperationState;
use crate::token::{NextStageInput, TokenCodec};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Longest failure detail carried in an error; longer details keep their tail.
pub const MAX_ERROR_DETAIL: usize = 1024;

pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(10);

/// What a provider callback reports after one begin or check call.
#[derive(Debug, Clone)]
pub struct ProviderStep<S> {
    pub state: OperationState,
    pub next: NextStageInput<S>,
    /// Raw error text for failures.
    pub detail: Option<String>,
}

impl<S> ProviderStep<S> {
    pub fn in_progress(next: NextStageInput<S>) -> Self {
        Self {
            state: OperationState::InProgress,
            next,
            detail: None,
        }
    }

    pub fn succeeded(next: NextStageInput<S>) -> Self {
        Self {
            state: OperationState::Succeeded,
            next,
            detail: None,
        }
    }

    pub fn failed(next: NextStageInput<S>, detail: impl Into<String>) -> Self {
        Self {
            state: OperationState::Failed,
            next,
            detail: Some(detail.into()),
        }
    }
}

/// A multi-step provider operation driven by [`run_operation`].
///
/// `begin` must be safe to call again after a crash between the provider
/// accepting the request and the token being persisted.
#[async_trait]
pub trait ProviderOperation: Send + Sync {
    type Stage: Serialize + DeserializeOwned + Send + Sync;

    async fn begin(&self, input: &ContinuationInput) -> Result<ProviderStep<Self::Stage>>;

    async fn check(
        &self,
        next: NextStageInput<Self::Stage>,
    ) -> Result<ProviderStep<Self::Stage>>;

    fn retry_after(&self) -> Duration {
        DEFAULT_RETRY_AFTER
    }
}

/// Runs one step: `begin` when the input has no token, `check` otherwise.
///
/// # Errors
///
/// A provider `Failed` state becomes [`ContinuationError::OperationFailed`]
/// with a bounded detail. A token that does not decode is
/// [`ContinuationError::TokenDecode`].
#[instrument(skip_all, fields(resuming = input.token().is_some()))]
pub async fn run_operation<P>(operation: &P, input: &ContinuationInput) -> Result<ContinuationResult>
where
    P: ProviderOperation + ?Sized,
{
    let step = match input.token() {
        None => operation.begin(input).await?,
        Some(token) => {
            let next = TokenCodec::decode::<P::Stage>(token)?;
            operation.check(next).await?
        }
    };

    match step.state {
        OperationState::InProgress => {
            let token = TokenCodec::encode(&step.next)?;
            debug!(resource_id = %step.next.resource_id, "Operation still in progress");
            let next_input = ContinuationInput {
                continuation_token: Some(token),
                body: input.body.clone(),
            };
            Ok(ContinuationResult::in_progress(
                next_input,
                operation.retry_after(),
            ))
        }
        OperationState::Succeeded => Ok(ContinuationResult::succeeded()),
        OperationState::Cancelled => Ok(ContinuationResult::cancelled(
            step.detail.unwrap_or_else(|| "OperationCancelled".to_string()),
        )),
        OperationState::Failed => {
            let detail = bounded_detail(step.detail.as_deref().unwrap_or("Operation failed"));
            warn!(resource_id = %step.next.resource_id, %detail, "Operation failed");
            Err(ContinuationError::OperationFailed { detail })
        }
    }
}

/// Keeps the last [`MAX_ERROR_DETAIL`] characters, marking the cut with `...`.
pub fn bounded_detail(detail: &str) -> String {
    let len = detail.chars().count();
    if len <= MAX_ERROR_DETAIL {
        return detail.to_string();
    }
    let keep = MAX_ERROR_DETAIL - 3;
    let tail: String = detail.chars().skip(len - keep).collect();
    format!("...{tail}")
}
