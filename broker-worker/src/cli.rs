use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "broker-worker")]
#[command(about = "Warm-pool resource broker worker")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// SQLite database path (overrides BROKER_DB_PATH)
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// Pool definitions YAML file (overrides BROKER_POOL_DEFINITIONS)
    #[arg(long, global = true)]
    pub pools: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run continuation workers and the reconciler until interrupted
    Run,

    /// Run one orphan pool sweep and wait for its deletes to settle
    Reconcile {
        /// Seconds without queue activity before exiting
        #[arg(long, default_value_t = 30)]
        settle_secs: u64,
    },

    /// Print the active pool definitions with their codes
    Pools,
}

impl Args {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}
