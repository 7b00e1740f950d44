use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, types::Json, PgPool, Row};

use crate::domain::{
    queue::Snapshot,
    repository::{HelpedRepository, SnapshotRepository},
};

#[derive(Clone, Debug)]
pub struct PgSnapshotRepository {
    pool: PgPool,
}

impl PgSnapshotRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SnapshotRepository for PgSnapshotRepository {
    async fn load(&self, queue_id: &str) -> Result<Option<Snapshot>> {
        let row: Option<PgRow> =
            sqlx::query("SELECT state FROM queue.queue_state WHERE queue_id = $1")
                .bind(queue_id)
                .fetch_optional(&self.pool)
                .await
                .context("SnapshotRepository::load")?;

        let snapshot = match row {
            Some(row) => {
                let Json(snapshot): Json<Snapshot> = row
                    .try_get("state")
                    .context("SnapshotRepository::load decode")?;
                Some(snapshot)
            }
            None => None,
        };

        Ok(snapshot)
    }

    async fn save(&self, queue_id: &str, snapshot: &Snapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue.queue_state (queue_id, state)
            VALUES ($1, $2)
            ON CONFLICT (queue_id) DO UPDATE SET
                state = $2
            "#,
        )
        .bind(queue_id)
        .bind(Json(snapshot))
        .execute(&self.pool)
        .await
        .context("SnapshotRepository::save")?;

        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct PgHelpedRepository {
    pool: PgPool,
}

impl PgHelpedRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl HelpedRepository for PgHelpedRepository {
    async fn record(&self, owner_id: &str, queue_id: &str, helped_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue.helped_records (owner_id, queue_id, helped_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(owner_id)
        .bind(queue_id)
        .bind(helped_at)
        .execute(&self.pool)
        .await
        .context("HelpedRepository::record")?;

        Ok(())
    }

    async fn helped_since(&self, owner_id: &str, since: DateTime<Utc>) -> Result<bool> {
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) FROM queue.helped_records WHERE owner_id = $1 AND helped_at >= $2",
        )
        .bind(owner_id)
        .bind(since)
        .map(|row: PgRow| row.get(0))
        .fetch_one(&self.pool)
        .await
        .context("HelpedRepository::helped_since")?;

        Ok(count > 0)
    }
}
