use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use health::HealthRegistry;
use ingestion_worker::config::{Config, DEFAULT_CONSUMER_GROUP};
use ingestion_worker::error::WorkerError;
use ingestion_worker::worker::{IngestionContext, IngestionProcessorFactory};
use pipeline_common::config::ConsumerConfig;
use pipeline_common::consumer::{consume, PartitionWorkers};
use pipeline_common::kafka::{create_kafka_producer, create_stream_consumer, PipelineConsumerContext};
use pipeline_common::metrics::{app, serve, setup_metrics_recorder};
use pipeline_common::shutdown::shutdown_signal;
use pipeline_common::sink::KafkaSink;
use pipeline_common::store::PgStore;
use tokio::sync::mpsc;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    setup_tracing();
    info!("starting ingestion-worker");

    ConsumerConfig::set_defaults(DEFAULT_CONSUMER_GROUP);
    let config = Config::init_from_env()?;
    // Invalid rules or bounds must stop the process before it consumes anything
    let validator = config.validation.validator()?;
    let retry_policy = config.retry_policy.policy()?;

    let liveness = HealthRegistry::new("liveness");

    let store = PgStore::connect_lazy(&config.database_url, config.max_pg_connections)?;
    if config.run_migrations {
        sqlx::migrate!("../migrations").run(store.pool()).await?;
        info!("database migrations applied");
    }

    let producer_liveness =
        liveness.register("rdkafka-producer".to_string(), time::Duration::seconds(30));
    let producer = create_kafka_producer(&config.kafka, producer_liveness).await?;
    let invalid_sink = KafkaSink::new(producer.clone(), config.kafka_topic_invalid.as_str());
    let dlq_sink = KafkaSink::new(producer, config.kafka_topic_dlq.as_str());
    let dlq_sink = Arc::new(dlq_sink);

    let (revoked_tx, revoked_rx) = mpsc::unbounded_channel();
    let consumer_liveness =
        liveness.register("rdkafka-consumer".to_string(), time::Duration::seconds(30));
    let consumer = create_stream_consumer(
        &config.kafka,
        &config.consumer,
        PipelineConsumerContext::new(consumer_liveness.clone(), revoked_tx),
    )?;
    let consumer = Arc::new(consumer);

    let factory = IngestionProcessorFactory::new(IngestionContext {
        store: Arc::new(store),
        invalid_sink: Arc::new(invalid_sink),
        dlq_sink: dlq_sink.clone(),
        validator,
        retry_policy,
        consumer_group: config.consumer.kafka_consumer_group.clone(),
    });
    let workers = PartitionWorkers::new(
        factory,
        consumer.clone(),
        liveness.clone(),
        config.worker_config(),
    );

    let recorder_handle = setup_metrics_recorder()?;
    let router = app("ingestion-worker", liveness, Some(recorder_handle));
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to start ingestion-worker http server, {}", e);
        }
    });

    let result = consume(
        consumer,
        workers,
        revoked_rx,
        consumer_liveness,
        shutdown_signal(),
    )
    .await;

    // Both sinks share the producer, flushing one flushes everything queued
    if let Err(e) = dlq_sink.flush(Duration::from_secs(10)) {
        error!("failed to flush kafka producer on shutdown: {}", e);
    }

    match result {
        Ok(()) => {
            info!("ingestion-worker stopped");
            Ok(())
        }
        Err(e) => {
            error!("ingestion-worker stopped on a partition failure: {}", e);
            Err(e.into())
        }
    }
}
