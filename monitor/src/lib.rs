pub mod batching;
pub mod config;
pub mod engine;
pub mod errors;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod report;
pub mod rest;
pub mod rollup;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod store;
pub mod tracker;
pub mod validate;
