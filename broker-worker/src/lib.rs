//! Background worker for the pool broker: continuation workers, the orphan
//! pool reconciler loop and the command line that starts them.

pub mod cli;
pub mod commands;
pub mod config;
pub mod provider;
pub mod service;
pub mod tasks;

pub use config::Config;
pub use provider::SimulatedProvider;
pub use service::{load_pool_definitions, BrokerService};
pub use tasks::start_reconciler_task;
