use envconfig::Error as EnvError;
use metrics_exporter_prometheus::BuildError;
use pipeline_common::config::ConfigError;
use pipeline_common::consumer::ConsumerError;
use pipeline_common::store::StoreError;
use rdkafka::error::KafkaError;
use thiserror::Error;

/// Errors that stop the anomaly detector. Nothing raised while handling a single
/// message ends up here: detection drops what it cannot deliver.
#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("failed to read configuration: {0}")]
    Env(#[from] EnvError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to create kafka client: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to connect to the database: {0}")]
    Store(#[from] StoreError),
    #[error("failed to run database migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] BuildError),
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
}
