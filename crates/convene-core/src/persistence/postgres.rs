// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.
//!
//! Cross-replica atomicity relies on row locks: every mutation of a
//! wait instance first takes the parent row (`FOR UPDATE` or the
//! implicit lock of a guarded `UPDATE`/`DELETE`), then touches the
//! correlation child rows, so lock order is uniform across operations.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use crate::error::EngineError;

use super::{
    CorrelationRow, NewWaitInstance, NotifyResponseRecord, Persistence, ProgressUpdateRecord,
    WaitInstanceRecord, WaitInstanceRow, WaitReference, assemble_instance,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgres");

/// PostgreSQL-backed persistence provider.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new PostgreSQL persistence provider from an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a new provider from an existing pool and run migrations.
    pub async fn new_with_migrations(pool: PgPool) -> Result<Self, EngineError> {
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| EngineError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;
        Ok(Self { pool })
    }
}

const INSTANCE_COLUMNS: &str = "wait_instance_id, publisher, callback, progress_callback, \
     callback_processing_at, timeout_at, valid_until, created_at";

async fn fetch_instance_row(
    conn: &mut PgConnection,
    wait_instance_id: &str,
    for_update: bool,
) -> Result<Option<WaitInstanceRow>, EngineError> {
    let suffix = if for_update { " FOR UPDATE" } else { "" };
    let sql = format!(
        "SELECT {INSTANCE_COLUMNS} FROM wait_instances WHERE wait_instance_id = $1{suffix}"
    );
    let row = sqlx::query_as::<_, WaitInstanceRow>(&sql)
        .bind(wait_instance_id)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

async fn fetch_correlations(
    conn: &mut PgConnection,
    wait_instance_id: &str,
) -> Result<Vec<CorrelationRow>, EngineError> {
    let rows = sqlx::query_as::<_, CorrelationRow>(
        r#"
        SELECT correlation_id, fulfilled
        FROM wait_correlations
        WHERE wait_instance_id = $1
        ORDER BY correlation_id
        "#,
    )
    .bind(wait_instance_id)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

async fn load_instance(
    conn: &mut PgConnection,
    wait_instance_id: &str,
) -> Result<Option<WaitInstanceRecord>, EngineError> {
    let Some(row) = fetch_instance_row(conn, wait_instance_id, false).await? else {
        return Ok(None);
    };
    let correlations = fetch_correlations(conn, wait_instance_id).await?;
    Ok(Some(assemble_instance(row, correlations)))
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn insert_wait_instance(&self, new: &NewWaitInstance) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO wait_instances
                (wait_instance_id, publisher, callback, progress_callback,
                 callback_processing_at, timeout_at, valid_until, created_at)
            VALUES ($1, $2, $3, $4, NULL, $5, $6, $7)
            "#,
        )
        .bind(&new.wait_instance_id)
        .bind(&new.publisher)
        .bind(&new.callback)
        .bind(&new.progress_callback)
        .bind(new.timeout_at)
        .bind(new.valid_until)
        .bind(new.created_at)
        .execute(&mut *tx)
        .await?;

        for correlation_id in &new.correlation_ids {
            sqlx::query(
                r#"
                INSERT INTO wait_correlations (wait_instance_id, correlation_id, fulfilled)
                VALUES ($1, $2, FALSE)
                "#,
            )
            .bind(&new.wait_instance_id)
            .bind(correlation_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_wait_instance(
        &self,
        wait_instance_id: &str,
    ) -> Result<Option<WaitInstanceRecord>, EngineError> {
        let mut conn = self.pool.acquire().await?;
        load_instance(&mut conn, wait_instance_id).await
    }

    async fn absorb_existing_responses(
        &self,
        wait_instance_id: &str,
    ) -> Result<Option<WaitInstanceRecord>, EngineError> {
        let mut tx = self.pool.begin().await?;

        let Some(row) = fetch_instance_row(&mut tx, wait_instance_id, true).await? else {
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE wait_correlations
            SET fulfilled = TRUE
            WHERE wait_instance_id = $1
              AND fulfilled = FALSE
              AND correlation_id IN (SELECT correlation_id FROM notify_responses)
            "#,
        )
        .bind(wait_instance_id)
        .execute(&mut *tx)
        .await?;

        let correlations = fetch_correlations(&mut tx, wait_instance_id).await?;
        tx.commit().await?;

        Ok(Some(assemble_instance(row, correlations)))
    }

    async fn decrement_one(
        &self,
        correlation_id: &str,
    ) -> Result<Option<WaitInstanceRecord>, EngineError> {
        loop {
            let mut tx = self.pool.begin().await?;

            let candidate: Option<(String,)> = sqlx::query_as(
                r#"
                SELECT wait_instance_id
                FROM wait_correlations
                WHERE correlation_id = $1 AND fulfilled = FALSE
                LIMIT 1
                "#,
            )
            .bind(correlation_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some((wait_instance_id,)) = candidate else {
                return Ok(None);
            };

            // Lock the parent row so the transition to an empty pending
            // set is observed by exactly one decrementer.
            let Some(row) = fetch_instance_row(&mut tx, &wait_instance_id, true).await? else {
                // Instance deleted since the candidate select; try the next one.
                tx.commit().await?;
                continue;
            };

            let flipped = sqlx::query(
                r#"
                UPDATE wait_correlations
                SET fulfilled = TRUE
                WHERE wait_instance_id = $1 AND correlation_id = $2 AND fulfilled = FALSE
                "#,
            )
            .bind(&wait_instance_id)
            .bind(correlation_id)
            .execute(&mut *tx)
            .await?;

            if flipped.rows_affected() == 0 {
                // Another replica flipped this row first; try the next candidate.
                tx.commit().await?;
                continue;
            }

            let correlations = fetch_correlations(&mut tx, &wait_instance_id).await?;
            tx.commit().await?;

            return Ok(Some(assemble_instance(row, correlations)));
        }
    }

    async fn lease_wait_instance(
        &self,
        wait_instance_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<WaitInstanceRecord>, EngineError> {
        let sql = format!(
            "UPDATE wait_instances \
             SET callback_processing_at = $2 \
             WHERE wait_instance_id = $1 \
               AND (callback_processing_at IS NULL OR callback_processing_at < $3) \
             RETURNING {INSTANCE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, WaitInstanceRow>(&sql)
            .bind(wait_instance_id)
            .bind(lease_until)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut conn = self.pool.acquire().await?;
        let correlations = fetch_correlations(&mut conn, wait_instance_id).await?;
        Ok(Some(assemble_instance(row, correlations)))
    }

    async fn clear_lease(&self, wait_instance_id: &str) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            UPDATE wait_instances
            SET callback_processing_at = NULL
            WHERE wait_instance_id = $1
            "#,
        )
        .bind(wait_instance_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_wait_instance(&self, wait_instance_id: &str) -> Result<(), EngineError> {
        // Correlation rows go with the parent via ON DELETE CASCADE;
        // deleting the parent first keeps the parent-then-child lock
        // order shared with decrement_one and absorb_existing_responses.
        sqlx::query("DELETE FROM wait_instances WHERE wait_instance_id = $1")
            .bind(wait_instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_timed_out_instances(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WaitInstanceRecord>, EngineError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM wait_instances \
             WHERE timeout_at IS NOT NULL AND timeout_at <= $1 \
               AND (callback_processing_at IS NULL OR callback_processing_at < $1) \
             ORDER BY timeout_at ASC \
             LIMIT $2"
        );
        let rows = sqlx::query_as::<_, WaitInstanceRow>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut conn = self.pool.acquire().await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let correlations = fetch_correlations(&mut conn, &row.wait_instance_id).await?;
            records.push(assemble_instance(row, correlations));
        }
        Ok(records)
    }

    async fn purge_expired_wait_instances(&self, now: DateTime<Utc>) -> Result<u64, EngineError> {
        let result = sqlx::query("DELETE FROM wait_instances WHERE valid_until <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn instances_referencing(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<WaitReference>, EngineError> {
        let refs: Vec<(String, bool)> = sqlx::query_as(
            r#"
            SELECT wait_instance_id, fulfilled
            FROM wait_correlations
            WHERE correlation_id = $1
            "#,
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await?;

        let mut conn = self.pool.acquire().await?;
        let mut out = Vec::with_capacity(refs.len());
        for (wait_instance_id, fulfilled) in refs {
            if let Some(instance) = load_instance(&mut conn, &wait_instance_id).await? {
                out.push(WaitReference {
                    instance,
                    pending: !fulfilled,
                });
            }
        }
        Ok(out)
    }

    async fn progress_targets(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<WaitInstanceRecord>, EngineError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM wait_instances wi \
             WHERE wi.progress_callback IS NOT NULL \
               AND EXISTS (SELECT 1 FROM wait_correlations wc \
                           WHERE wc.wait_instance_id = wi.wait_instance_id \
                             AND wc.correlation_id = $1)"
        );
        let rows = sqlx::query_as::<_, WaitInstanceRow>(&sql)
            .bind(correlation_id)
            .fetch_all(&self.pool)
            .await?;

        let mut conn = self.pool.acquire().await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let correlations = fetch_correlations(&mut conn, &row.wait_instance_id).await?;
            records.push(assemble_instance(row, correlations));
        }
        Ok(records)
    }

    async fn insert_response(
        &self,
        correlation_id: &str,
        payload: &[u8],
        is_error: bool,
        created_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            INSERT INTO notify_responses (correlation_id, payload, is_error, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(correlation_id)
        .bind(payload)
        .bind(is_error)
        .bind(created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(EngineError::DuplicateResponse {
                    correlation_id: correlation_id.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_responses(
        &self,
        correlation_ids: &[String],
    ) -> Result<Vec<NotifyResponseRecord>, EngineError> {
        if correlation_ids.is_empty() {
            return Ok(Vec::new());
        }
        let records = sqlx::query_as::<_, NotifyResponseRecord>(
            r#"
            SELECT correlation_id, payload, is_error, created_at
            FROM notify_responses
            WHERE correlation_id = ANY($1)
            "#,
        )
        .bind(correlation_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn list_responses_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<NotifyResponseRecord>, EngineError> {
        let records = sqlx::query_as::<_, NotifyResponseRecord>(
            r#"
            SELECT correlation_id, payload, is_error, created_at
            FROM notify_responses
            WHERE created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn delete_responses(&self, correlation_ids: &[String]) -> Result<u64, EngineError> {
        if correlation_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM notify_responses WHERE correlation_id = ANY($1)")
            .bind(correlation_ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_progress(
        &self,
        correlation_id: &str,
        payload: &[u8],
        created_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO progress_updates (correlation_id, payload, created_at, expire_processing)
            VALUES ($1, $2, $3, NULL)
            "#,
        )
        .bind(correlation_id)
        .bind(payload)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lease_next_progress(
        &self,
        busy: &[String],
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<ProgressUpdateRecord>, EngineError> {
        let record = sqlx::query_as::<_, ProgressUpdateRecord>(
            r#"
            UPDATE progress_updates
            SET expire_processing = $1
            WHERE id = (
                SELECT id FROM progress_updates
                WHERE (expire_processing IS NULL OR expire_processing < $2)
                  AND NOT (correlation_id = ANY($3))
                ORDER BY id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, correlation_id, payload, created_at, expire_processing
            "#,
        )
        .bind(lease_until)
        .bind(now)
        .bind(busy)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn delete_progress(&self, id: i64) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM progress_updates WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let acquired: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO engine_locks (name, holder, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
            SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
            WHERE engine_locks.expires_at < $4 OR engine_locks.holder = EXCLUDED.holder
            RETURNING name
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(acquired.is_some())
    }

    async fn release_lock(&self, name: &str, holder: &str) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM engine_locks WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn health_check_db(&self) -> Result<bool, EngineError> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
