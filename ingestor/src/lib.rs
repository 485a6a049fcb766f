//! Power telemetry ingestion, energy aggregation and device pairing.

pub mod aggregate;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod errors;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod notify;
pub mod pairing;
pub mod queue;
pub mod rest;
pub mod store;
pub mod usage;
pub mod validate;
