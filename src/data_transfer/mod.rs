// =====================================================
// DATA TRANSFER MODULE
// Lookups, transforms, batch loading and the run controller
// =====================================================

pub mod connection_resolver;
pub mod copy_codec;
pub mod engine;
pub mod loader;
pub mod lookup;
pub mod mapper;
pub mod migration;
pub mod models;
pub mod pipeline;
pub mod planner;
pub mod sink;
pub mod storage;
pub mod transform;

#[cfg(test)]
pub mod testing;

pub use engine::{execute_table, CancelSignal, MigrationRun, RunEnvironment};
pub use migration::{TableMigration, TargetRow};
pub use models::{RunOptions, RunReport, RunState};
