//! Copy pipeline: activity poller, position ledgers, copy engine.

mod config;
mod copy_engine;
mod ledger;
mod poller;
mod tracker;

#[cfg(test)]
pub(crate) mod testing;

pub use config::CopyConfig;
pub use copy_engine::{CopyEngine, EngineStats, Executors};
pub use ledger::PositionLedger;
pub use poller::{spawn_heartbeat, ActivityPoller, HealthSnapshot, PollerHealth};
pub use tracker::{RefreshSchedule, WalletTracker};
