// Refresh loop driving resolution and trigger reconciliation

pub mod engine;

pub use engine::{RefreshConfig, RefreshEngine, Scheduler};
