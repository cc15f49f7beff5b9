// Shared library for the scan scheduler daemon and the scanner trigger

pub mod audit;
pub mod bootstrap;
pub mod catalog;
pub mod clone_url;
pub mod config;
pub mod errors;
pub mod gate;
pub mod groups;
pub mod models;
pub mod persistence;
pub mod policy;
pub mod reconciler;
pub mod repo;
pub mod resolver;
pub mod retry;
pub mod scan;
pub mod schedule;
pub mod scheduler;
pub mod tag;
pub mod telemetry;
