//! Common preconditions for continuations that watch a stored record.

use crate::error::ContinuationError;
use crate::result::{ContinuationInput, ContinuationResult};
use serde::de::DeserializeOwned;
use std::future::Future;
use tracing::info;

/// Machine-readable reasons reported when a guard stops a continuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardReasons {
    pub disabled: String,
    pub record_not_found: String,
    pub resource_changed: String,
}

impl GuardReasons {
    pub fn new(
        disabled: impl Into<String>,
        record_not_found: impl Into<String>,
        resource_changed: impl Into<String>,
    ) -> Self {
        Self {
            disabled: disabled.into(),
            record_not_found: record_not_found.into(),
            resource_changed: resource_changed.into(),
        }
    }
}

impl Default for GuardReasons {
    fn default() -> Self {
        Self::new("ContinuationDisabled", "RecordNotFound", "ResourceChanged")
    }
}

/// Runs `core` only after the standard checks pass, in this order:
///
/// 1. `enabled` is false: `Cancelled` with the disabled reason.
/// 2. The body does not parse as `I`: `InvalidInput` error.
/// 3. `fetch` finds no record: `Cancelled` with the not-found reason.
/// 4. `same_resource` rejects the record: `Cancelled` with the changed reason.
pub async fn guarded_continue<I, R, E, Fetch, FetchFut, Same, Core, CoreFut>(
    input: &ContinuationInput,
    enabled: bool,
    reasons: &GuardReasons,
    fetch: Fetch,
    same_resource: Same,
    core: Core,
) -> Result<ContinuationResult, E>
where
    I: DeserializeOwned,
    E: From<ContinuationError>,
    Fetch: FnOnce(&I) -> FetchFut,
    FetchFut: Future<Output = Result<Option<R>, E>>,
    Same: FnOnce(&I, &R) -> bool,
    Core: FnOnce(I, R) -> CoreFut,
    CoreFut: Future<Output = Result<ContinuationResult, E>>,
{
    if !enabled {
        info!(reason = %reasons.disabled, "Continuation disabled");
        return Ok(ContinuationResult::cancelled(reasons.disabled.clone()));
    }

    let typed: I = input.typed_body()?;

    let Some(record) = fetch(&typed).await? else {
        info!(reason = %reasons.record_not_found, "Continuation record missing");
        return Ok(ContinuationResult::cancelled(
            reasons.record_not_found.clone(),
        ));
    };

    if !same_resource(&typed, &record) {
        info!(reason = %reasons.resource_changed, "Continuation resource changed");
        return Ok(ContinuationResult::cancelled(
            reasons.resource_changed.clone(),
        ));
    }

    core(typed, record).await
}
