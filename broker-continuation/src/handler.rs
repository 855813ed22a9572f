use crate::error::Result;
use crate::payload::ContinuationPayload;
use crate::result::{ContinuationInput, ContinuationResult};
use async_trait::async_trait;
use std::sync::Arc;

/// A named continuation step that can be redelivered through a queue.
#[async_trait]
pub trait ContinuationHandler: Send + Sync {
    /// Target name payloads are addressed to.
    fn target(&self) -> &str;

    fn can_handle(&self, payload: &ContinuationPayload) -> bool {
        payload.target == self.target()
    }

    async fn resume(&self, input: &ContinuationInput) -> Result<ContinuationResult>;
}

/// Explicitly registered handlers, consulted in registration order.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn ContinuationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, handler: Arc<dyn ContinuationHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// First handler that accepts the payload.
    pub fn resolve(&self, payload: &ContinuationPayload) -> Option<Arc<dyn ContinuationHandler>> {
        self.handlers.iter().find(|h| h.can_handle(payload)).cloned()
    }

    pub fn targets(&self) -> Vec<String> {
        self.handlers.iter().map(|h| h.target().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
