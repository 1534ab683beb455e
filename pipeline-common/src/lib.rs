pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod kafka;
pub mod metrics;
pub mod metrics_consts;
pub mod reading;
pub mod retry;
pub mod rules;
pub mod shutdown;
pub mod sink;
pub mod store;
pub mod test_utils;
pub mod validation;
