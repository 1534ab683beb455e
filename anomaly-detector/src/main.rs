use std::sync::Arc;
use std::time::Duration;

use anomaly_detector::config::{Config, DEFAULT_CONSUMER_GROUP};
use anomaly_detector::detector::{DetectionContext, DetectionProcessorFactory};
use anomaly_detector::error::DetectorError;
use envconfig::Envconfig;
use health::HealthRegistry;
use pipeline_common::config::ConsumerConfig;
use pipeline_common::consumer::{consume, PartitionWorkers};
use pipeline_common::kafka::{create_kafka_producer, create_stream_consumer, PipelineConsumerContext};
use pipeline_common::metrics::{app, serve, setup_metrics_recorder};
use pipeline_common::rules::AnomalyRules;
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
async fn main() -> Result<(), DetectorError> {
    setup_tracing();
    info!("starting anomaly-detector");

    ConsumerConfig::set_defaults(DEFAULT_CONSUMER_GROUP);
    let config = Config::init_from_env()?;
    let rules = AnomalyRules::new(config.thresholds.thresholds()?);
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
    let sink = Arc::new(KafkaSink::new(producer, config.kafka_topic_anomaly.as_str()));

    let (revoked_tx, revoked_rx) = mpsc::unbounded_channel();
    let consumer_liveness =
        liveness.register("rdkafka-consumer".to_string(), time::Duration::seconds(30));
    let consumer = create_stream_consumer(
        &config.kafka,
        &config.consumer,
        PipelineConsumerContext::new(consumer_liveness.clone(), revoked_tx),
    )?;
    let consumer = Arc::new(consumer);

    let factory = DetectionProcessorFactory::new(DetectionContext {
        store: Arc::new(store),
        sink: sink.clone(),
        rules,
        retry_policy,
        warm_start: config.warm_start_from_store,
    });
    let workers = PartitionWorkers::new(
        factory,
        consumer.clone(),
        liveness.clone(),
        config.worker_config(),
    );

    let recorder_handle = setup_metrics_recorder()?;
    let router = app("anomaly-detector", liveness, Some(recorder_handle));
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to start anomaly-detector http server, {}", e);
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

    if let Err(e) = sink.flush(Duration::from_secs(10)) {
        error!("failed to flush kafka producer on shutdown: {}", e);
    }

    match result {
        Ok(()) => {
            info!("anomaly-detector stopped");
            Ok(())
        }
        Err(e) => {
            error!("anomaly-detector stopped on a partition failure: {}", e);
            Err(e.into())
        }
    }
}
