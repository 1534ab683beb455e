use envconfig::Error as EnvError;
use metrics_exporter_prometheus::BuildError;
use pipeline_common::config::ConfigError;
use pipeline_common::consumer::ConsumerError;
use pipeline_common::sink::SinkError;
use pipeline_common::store::StoreError;
use rdkafka::error::KafkaError;
use thiserror::Error;

/// Errors raised while handling one message.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("gave up after {attempts} attempts: {error}")]
    Poison { attempts: u32, error: String },
}

/// Errors that stop the ingestion worker.
#[derive(Error, Debug)]
pub enum WorkerError {
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
