//! Runtime performance counters, their aggregation across agents, and the
//! collector that ingests them.

pub mod agent;
pub mod collector;
pub mod config;
pub mod counter;
pub mod export;
pub mod store;
pub mod tracking;
