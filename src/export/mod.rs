//! Outbound concerns: body compression for pushes and the collector's own
//! Prometheus health metrics.

pub mod compress;
pub mod health;
