pub const MESSAGES_CONSUMED: &str = "heartbeat_messages_consumed_total";
pub const DB_INSERTS: &str = "heartbeat_db_inserts_total";
/// Inserts that found an existing (customer_id, event_id) row
pub const DUPLICATES: &str = "heartbeat_duplicates_total";
/// Labelled by `reason`: schema or domain
pub const INVALID_TOTAL: &str = "heartbeat_invalid_total";
pub const DLQ_TOTAL: &str = "heartbeat_dlq_total";
/// Labelled by `operation`
pub const RETRIES_TOTAL: &str = "heartbeat_retries_total";
/// Messages skipped because the checkpoint showed them already durable
pub const CHECKPOINT_SKIPPED: &str = "heartbeat_checkpoint_skipped_total";
pub const OFFSET_COMMIT_FAILURES: &str = "heartbeat_offset_commit_failures_total";
/// Labelled by `type` and `severity`
pub const ANOMALIES_TOTAL: &str = "heartbeat_anomalies_total";
/// Labelled by `stage`: persist or publish
pub const ANOMALY_DROPPED: &str = "heartbeat_anomaly_dropped_total";
/// Messages the detector could not decode, labelled by `reason`
pub const DETECTOR_SKIPPED: &str = "heartbeat_detector_skipped_total";
pub const DETECTOR_STATE_KEYS: &str = "heartbeat_detector_state_keys";
