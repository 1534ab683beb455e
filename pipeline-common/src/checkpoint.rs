use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::store::StoreError;

/// Identifies one checkpoint row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointKey {
    pub consumer_group: String,
    pub topic: String,
    pub partition: i32,
}

impl CheckpointKey {
    pub fn new(consumer_group: impl Into<String>, topic: impl Into<String>, partition: i32) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            topic: topic.into(),
            partition,
        }
    }
}

/// Last durably processed offset for a (consumer group, topic, partition).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub key: CheckpointKey,
    pub last_offset: i64,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>, StoreError>;

    /// Record `offset` as processed. Implementations never move a checkpoint backwards.
    async fn upsert(&self, key: &CheckpointKey, offset: i64) -> Result<(), StoreError>;
}

/// What a partition worker does with the messages it receives after an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// The committed stream offset is at or ahead of the checkpoint. Anything between
    /// the two is replayed and absorbed by the idempotent insert.
    TrustStream,
    /// The offset commit was lost after the transactional write succeeded. Messages up
    /// to and including this offset are already durable and are skipped.
    SkipThrough(i64),
}

impl Reconciliation {
    /// Whether the message at `offset` was already durably handled.
    pub fn skips(&self, offset: i64) -> bool {
        match self {
            Reconciliation::TrustStream => false,
            Reconciliation::SkipThrough(last) => offset <= *last,
        }
    }
}

/// Compare the first offset the stream delivered after an assignment with the stored checkpoint.
pub fn reconcile(stream_position: i64, checkpoint: Option<&Checkpoint>) -> Reconciliation {
    match checkpoint {
        Some(checkpoint) if checkpoint.last_offset >= stream_position => {
            Reconciliation::SkipThrough(checkpoint.last_offset)
        }
        _ => Reconciliation::TrustStream,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(last_offset: i64) -> Checkpoint {
        Checkpoint {
            key: CheckpointKey::new("cg.db-writer.v1", "events.raw.v1", 3),
            last_offset,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn no_checkpoint_trusts_the_stream() {
        assert_eq!(reconcile(0, None), Reconciliation::TrustStream);
        assert_eq!(reconcile(42, None), Reconciliation::TrustStream);
    }

    #[test]
    fn checkpoint_behind_the_stream_trusts_the_stream() {
        // Committed offset 11 means offset 10 was the last handled one
        assert_eq!(reconcile(11, Some(&checkpoint(10))), Reconciliation::TrustStream);
        assert_eq!(reconcile(20, Some(&checkpoint(10))), Reconciliation::TrustStream);
    }

    #[test]
    fn checkpoint_ahead_of_the_stream_skips_durable_messages() {
        // Offsets 5..=9 were written, but the stream commit stopped at 5
        let reconciliation = reconcile(5, Some(&checkpoint(9)));
        assert_eq!(reconciliation, Reconciliation::SkipThrough(9));

        for offset in 5..=9 {
            assert!(reconciliation.skips(offset));
        }
        assert!(!reconciliation.skips(10));
    }

    #[test]
    fn checkpoint_equal_to_first_offset_skips_it() {
        let reconciliation = reconcile(7, Some(&checkpoint(7)));
        assert!(reconciliation.skips(7));
        assert!(!reconciliation.skips(8));
    }
}
