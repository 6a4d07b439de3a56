//! SQLite work queue.
//!
//! Entries carry an `available_at` deadline in unix milliseconds. Dequeue picks
//! the oldest visible entry and pushes its deadline out by the lease in the same
//! immediate transaction, so two consumers never lease the same entry at once.

use std::time::Duration;

use async_trait::async_trait;
use chimp_orchestrator::{Delivery, QueueDepth, WorkQueue};
use rusqlite::{params, OptionalExtension, TransactionBehavior};

use super::{duration_millis, lock, now_millis, SharedDatabase, StorageResult};

/// Work queue persisted in the `work_queue` table.
#[derive(Debug, Clone)]
pub struct SqliteWorkQueue {
    db: SharedDatabase,
}

impl SqliteWorkQueue {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    fn dequeue_sync(&self, worker_id: &str, lease: Duration) -> StorageResult<Option<Delivery>> {
        let mut db = lock(&self.db)?;
        let tx = db.conn_mut().transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_millis();
        let entry: Option<(i64, String, u32)> = tx
            .query_row(
                "SELECT delivery_id, run_id, deliveries FROM work_queue \
                 WHERE available_at <= ?1 ORDER BY delivery_id LIMIT 1",
                params![now],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((delivery_id, run_id, deliveries)) = entry else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE work_queue SET available_at = ?1, leased_by = ?2, deliveries = deliveries + 1 \
             WHERE delivery_id = ?3",
            params![now.saturating_add(duration_millis(lease)), worker_id, delivery_id],
        )?;
        tx.commit()?;

        Ok(Some(Delivery {
            delivery_id: delivery_id.unsigned_abs(),
            run_id,
            deliveries: deliveries + 1,
        }))
    }

    fn depth_sync(&self) -> StorageResult<QueueDepth> {
        let db = lock(&self.db)?;
        let (total, leased): (i64, i64) = db.conn().query_row(
            "SELECT COUNT(*), \
                    COALESCE(SUM(CASE WHEN leased_by IS NOT NULL AND available_at > ?1 \
                                 THEN 1 ELSE 0 END), 0) \
             FROM work_queue",
            params![now_millis()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let leased = usize::try_from(leased).unwrap_or(0);
        let total = usize::try_from(total).unwrap_or(0);
        Ok(QueueDepth { pending: total.saturating_sub(leased), leased })
    }

    fn delivery_key(delivery: &Delivery) -> i64 {
        i64::try_from(delivery.delivery_id).unwrap_or(i64::MAX)
    }
}

#[async_trait]
impl WorkQueue for SqliteWorkQueue {
    async fn enqueue(&self, run_id: &str, delay: Duration) -> chimp_orchestrator::Result<()> {
        let db = lock(&self.db)?;
        let now = now_millis();
        db.conn()
            .execute(
                "INSERT INTO work_queue (run_id, available_at, enqueued_at) VALUES (?1, ?2, ?3)",
                params![run_id, now.saturating_add(duration_millis(delay)), now],
            )
            .map_err(super::StorageError::from)?;
        Ok(())
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> chimp_orchestrator::Result<Option<Delivery>> {
        Ok(self.dequeue_sync(worker_id, lease)?)
    }

    async fn ack(&self, delivery: &Delivery) -> chimp_orchestrator::Result<()> {
        let db = lock(&self.db)?;
        db.conn()
            .execute(
                "DELETE FROM work_queue WHERE delivery_id = ?1",
                params![Self::delivery_key(delivery)],
            )
            .map_err(super::StorageError::from)?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> chimp_orchestrator::Result<()> {
        let db = lock(&self.db)?;
        let available_at = now_millis().saturating_add(duration_millis(delay));
        db.conn()
            .execute(
                "UPDATE work_queue SET available_at = ?1, leased_by = NULL WHERE delivery_id = ?2",
                params![available_at, Self::delivery_key(delivery)],
            )
            .map_err(super::StorageError::from)?;
        Ok(())
    }

    async fn extend(&self, delivery: &Delivery, lease: Duration) -> chimp_orchestrator::Result<()> {
        let db = lock(&self.db)?;
        let available_at = now_millis().saturating_add(duration_millis(lease));
        db.conn()
            .execute(
                "UPDATE work_queue SET available_at = ?1 WHERE delivery_id = ?2",
                params![available_at, Self::delivery_key(delivery)],
            )
            .map_err(super::StorageError::from)?;
        Ok(())
    }

    async fn depth(&self) -> chimp_orchestrator::Result<QueueDepth> {
        Ok(self.depth_sync()?)
    }
}
