use crate::result::ContinuationInput;
use crate::state::OperationState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A continuation step as it travels through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationPayload {
    /// Stable across every step of one lifeline.
    pub tracking_id: Uuid,
    /// Unique to this delivery.
    pub tracking_instance_id: Uuid,
    pub target: String,
    pub created: DateTime<Utc>,
    pub step_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OperationState>,
    pub input: ContinuationInput,
}

impl ContinuationPayload {
    pub fn new(target: impl Into<String>, input: ContinuationInput) -> Self {
        Self {
            tracking_id: Uuid::new_v4(),
            tracking_instance_id: Uuid::new_v4(),
            target: target.into(),
            created: Utc::now(),
            step_count: 0,
            status: None,
            input,
        }
    }

    /// The payload for the next step of the same lifeline.
    pub fn follow_up(&self, input: ContinuationInput, status: OperationState) -> Self {
        Self {
            tracking_id: self.tracking_id,
            tracking_instance_id: Uuid::new_v4(),
            target: self.target.clone(),
            created: self.created,
            step_count: self.step_count + 1,
            status: Some(status),
            input,
        }
    }

    /// Whether the lifeline started less than `max` before `now`.
    pub fn within_lifetime(&self, now: DateTime<Utc>, max: std::time::Duration) -> bool {
        match chrono::Duration::from_std(max) {
            Ok(max) => self.created > now - max,
            Err(_) => true,
        }
    }
}
