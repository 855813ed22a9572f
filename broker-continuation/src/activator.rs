use crate::error::{ContinuationError, Result};
use crate::handler::HandlerRegistry;
use crate::payload::ContinuationPayload;
use crate::result::{ContinuationInput, ContinuationResult};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, instrument, warn};

/// Longest a single lifeline may keep re-enqueueing itself.
pub const MAX_CONTINUATION_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// Transport that redelivers payloads after a delay.
#[async_trait]
pub trait ContinuationQueue: Send + Sync {
    async fn enqueue(&self, payload: ContinuationPayload, delay: Duration) -> Result<()>;
}

/// Dispatches payloads to handlers and schedules their follow-ups.
pub struct ContinuationActivator {
    registry: HandlerRegistry,
    queue: Arc<dyn ContinuationQueue>,
    max_lifetime: Duration,
}

impl ContinuationActivator {
    pub fn new(registry: HandlerRegistry, queue: Arc<dyn ContinuationQueue>) -> Self {
        Self {
            registry,
            queue,
            max_lifetime: MAX_CONTINUATION_LIFETIME,
        }
    }

    pub fn with_max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.max_lifetime = max_lifetime;
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Starts a lifeline: runs the first step inline and queues the rest.
    ///
    /// Errors from the first step are returned to the caller.
    #[instrument(skip(self, input))]
    pub async fn execute(&self, target: &str, input: ContinuationInput) -> Result<ContinuationResult> {
        let payload = ContinuationPayload::new(target, input);
        let result = self.dispatch(&payload).await?;
        self.schedule_follow_up(&payload, &result).await?;
        Ok(result)
    }

    /// Runs one redelivered step. Handler errors end the lifeline and are
    /// logged here; `None` means nothing ran to completion.
    #[instrument(skip(self, payload), fields(continuation = %payload.target, tracking_id = %payload.tracking_id, step = payload.step_count))]
    pub async fn continue_payload(&self, payload: ContinuationPayload) -> Option<ContinuationResult> {
        match self.dispatch(&payload).await {
            Ok(result) => {
                if let Err(e) = self.schedule_follow_up(&payload, &result).await {
                    error!(error = %e, "Failed to enqueue continuation follow-up");
                }
                Some(result)
            }
            Err(ContinuationError::TemporarilyUnavailable {
                reason,
                retry_after,
            }) => {
                warn!(%reason, retry_after_ms = retry_after.as_millis() as u64, "Continuation temporarily unavailable, retrying step");
                if let Err(e) = self.queue.enqueue(payload, retry_after).await {
                    error!(error = %e, "Failed to re-enqueue continuation");
                }
                None
            }
            Err(e) => {
                error!(error = %e, "Continuation handler failed");
                None
            }
        }
    }

    async fn dispatch(&self, payload: &ContinuationPayload) -> Result<ContinuationResult> {
        let handler = self
            .registry
            .resolve(payload)
            .ok_or_else(|| ContinuationError::NoHandler(payload.target.clone()))?;
        let result = handler.resume(&payload.input).await?;
        debug!(continuation = %payload.target, status = %result.status(), "Continuation step complete");
        Ok(result)
    }

    async fn schedule_follow_up(
        &self,
        payload: &ContinuationPayload,
        result: &ContinuationResult,
    ) -> Result<()> {
        let Some(next_input) = result.next_input() else {
            info!(
                continuation = %payload.target,
                status = %result.status(),
                steps = payload.step_count + 1,
                "Continuation finished"
            );
            return Ok(());
        };

        if !payload.within_lifetime(Utc::now(), self.max_lifetime) {
            warn!(
                continuation = %payload.target,
                tracking_id = %payload.tracking_id,
                "Continuation exceeded its lifetime, dropping follow-up"
            );
            return Ok(());
        }

        let next = payload.follow_up(next_input.clone(), result.status());
        self.queue.enqueue(next, result.retry_after()).await
    }
}

/// In-process queue: delayed payloads are held by a sleeping task.
#[derive(Clone)]
pub struct MemoryQueue {
    sender: mpsc::UnboundedSender<ContinuationPayload>,
}

impl MemoryQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ContinuationPayload>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl ContinuationQueue for MemoryQueue {
    async fn enqueue(&self, payload: ContinuationPayload, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            return self
                .sender
                .send(payload)
                .map_err(|_| ContinuationError::Queue("queue receiver closed".to_string()));
        }

        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(payload).is_err() {
                warn!("Continuation queue closed before delayed payload was delivered");
            }
        });
        Ok(())
    }
}

/// Pulls payloads until the queue closes, running each on its own task so
/// unrelated lifelines do not wait on each other. At most `workers` steps run
/// at once.
pub async fn run_worker(
    activator: Arc<ContinuationActivator>,
    mut receiver: mpsc::UnboundedReceiver<ContinuationPayload>,
    workers: usize,
) {
    let workers = workers.max(1);
    let permits = Arc::new(Semaphore::new(workers));
    info!(workers, "Continuation worker running");

    while let Some(payload) = receiver.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let activator = activator.clone();
        tokio::spawn(async move {
            activator.continue_payload(payload).await;
            drop(permit);
        });
    }
    info!("Continuation queue closed, worker stopping");
}
