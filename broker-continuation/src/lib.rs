//! Resumable, token-addressed execution of multi-step operations.
//!
//! An operation never keeps its progress in memory. Each step returns either
//! a terminal result or a continuation token, and the token is all another
//! worker needs to pick the operation up again after a crash or queue
//! redelivery.

pub mod activator;
pub mod engine;
pub mod error;
pub mod guard;
pub mod handler;
pub mod payload;
pub mod result;
pub mod state;
pub mod token;

pub use activator::{
    run_worker, ContinuationActivator, ContinuationQueue, MemoryQueue, MAX_CONTINUATION_LIFETIME,
};
pub use engine::{
    bounded_detail, run_operation, ProviderOperation, ProviderStep, DEFAULT_RETRY_AFTER,
    MAX_ERROR_DETAIL,
};
pub use error::{ContinuationError, Result};
pub use guard::{guarded_continue, GuardReasons};
pub use handler::{ContinuationHandler, HandlerRegistry};
pub use payload::ContinuationPayload;
pub use result::{ContinuationInput, ContinuationResult};
pub use state::OperationState;
pub use token::{NextStageInput, TokenCodec};
