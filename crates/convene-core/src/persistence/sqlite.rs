//! SQLite-backed persistence implementation.
//!
//! SQLite serializes writers, so the conditional updates here are
//! single statements instead of the PostgreSQL backend's row-locking
//! transactions; the flip that empties a pending set always observes
//! the empty set on its follow-up read because flips are monotone and
//! totally ordered by the write lock.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use crate::error::EngineError;

use super::{
    CorrelationRow, NewWaitInstance, NotifyResponseRecord, Persistence, ProgressUpdateRecord,
    WaitInstanceRecord, WaitInstanceRow, WaitReference, assemble_instance,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new provider from an existing pool and run migrations.
    pub async fn new_with_migrations(pool: SqlitePool) -> Result<Self, EngineError> {
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| EngineError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;
        Ok(Self { pool })
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Connects with WAL journaling and a busy timeout
    /// - Runs all migrations
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/convene.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| EngineError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        Self::new_with_migrations(pool).await
    }
}

const INSTANCE_COLUMNS: &str = "wait_instance_id, publisher, callback, progress_callback, \
     callback_processing_at, timeout_at, valid_until, created_at";

async fn fetch_instance_row(
    conn: &mut SqliteConnection,
    wait_instance_id: &str,
) -> Result<Option<WaitInstanceRow>, EngineError> {
    let sql = format!("SELECT {INSTANCE_COLUMNS} FROM wait_instances WHERE wait_instance_id = ?");
    let row = sqlx::query_as::<_, WaitInstanceRow>(&sql)
        .bind(wait_instance_id)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

async fn fetch_correlations(
    conn: &mut SqliteConnection,
    wait_instance_id: &str,
) -> Result<Vec<CorrelationRow>, EngineError> {
    let rows = sqlx::query_as::<_, CorrelationRow>(
        r#"
        SELECT correlation_id, fulfilled
        FROM wait_correlations
        WHERE wait_instance_id = ?
        ORDER BY correlation_id
        "#,
    )
    .bind(wait_instance_id)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

async fn load_instance(
    conn: &mut SqliteConnection,
    wait_instance_id: &str,
) -> Result<Option<WaitInstanceRecord>, EngineError> {
    let Some(row) = fetch_instance_row(conn, wait_instance_id).await? else {
        return Ok(None);
    };
    let correlations = fetch_correlations(conn, wait_instance_id).await?;
    Ok(Some(assemble_instance(row, correlations)))
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_wait_instance(&self, new: &NewWaitInstance) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO wait_instances
                (wait_instance_id, publisher, callback, progress_callback,
                 callback_processing_at, timeout_at, valid_until, created_at)
            VALUES (?, ?, ?, ?, NULL, ?, ?, ?)
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
                VALUES (?, ?, FALSE)
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
        sqlx::query(
            r#"
            UPDATE wait_correlations
            SET fulfilled = TRUE
            WHERE wait_instance_id = ?
              AND fulfilled = FALSE
              AND correlation_id IN (SELECT correlation_id FROM notify_responses)
            "#,
        )
        .bind(wait_instance_id)
        .execute(&self.pool)
        .await?;

        let mut conn = self.pool.acquire().await?;
        load_instance(&mut conn, wait_instance_id).await
    }

    async fn decrement_one(
        &self,
        correlation_id: &str,
    ) -> Result<Option<WaitInstanceRecord>, EngineError> {
        loop {
            let flipped: Option<(String,)> = sqlx::query_as(
                r#"
                UPDATE wait_correlations
                SET fulfilled = TRUE
                WHERE rowid = (
                    SELECT rowid FROM wait_correlations
                    WHERE correlation_id = ? AND fulfilled = FALSE
                    LIMIT 1
                )
                RETURNING wait_instance_id
                "#,
            )
            .bind(correlation_id)
            .fetch_optional(&self.pool)
            .await?;

            let Some((wait_instance_id,)) = flipped else {
                return Ok(None);
            };

            let mut conn = self.pool.acquire().await?;
            match load_instance(&mut conn, &wait_instance_id).await? {
                // Instance deleted between the flip and the read; the
                // flip landed on rows that are gone. Try the next one.
                None => continue,
                Some(record) => return Ok(Some(record)),
            }
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
             SET callback_processing_at = ? \
             WHERE wait_instance_id = ? \
               AND (callback_processing_at IS NULL OR callback_processing_at < ?) \
             RETURNING {INSTANCE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, WaitInstanceRow>(&sql)
            .bind(lease_until)
            .bind(wait_instance_id)
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
            WHERE wait_instance_id = ?
            "#,
        )
        .bind(wait_instance_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_wait_instance(&self, wait_instance_id: &str) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM wait_correlations WHERE wait_instance_id = ?")
            .bind(wait_instance_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM wait_instances WHERE wait_instance_id = ?")
            .bind(wait_instance_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_timed_out_instances(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WaitInstanceRecord>, EngineError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM wait_instances \
             WHERE timeout_at IS NOT NULL AND timeout_at <= ? \
               AND (callback_processing_at IS NULL OR callback_processing_at < ?) \
             ORDER BY timeout_at ASC \
             LIMIT ?"
        );
        let rows = sqlx::query_as::<_, WaitInstanceRow>(&sql)
            .bind(now)
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
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM wait_correlations
            WHERE wait_instance_id IN
                (SELECT wait_instance_id FROM wait_instances WHERE valid_until <= ?)
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM wait_instances WHERE valid_until <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
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
            WHERE correlation_id = ?
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
            "SELECT {INSTANCE_COLUMNS} FROM wait_instances \
             WHERE progress_callback IS NOT NULL \
               AND wait_instance_id IN \
                   (SELECT wait_instance_id FROM wait_correlations WHERE correlation_id = ?)"
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
            VALUES (?, ?, ?, ?)
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
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT correlation_id, payload, is_error, created_at \
             FROM notify_responses WHERE correlation_id IN (",
        );
        let mut separated = qb.separated(", ");
        for id in correlation_ids {
            separated.push_bind(id);
        }
        qb.push(")");

        let records = qb
            .build_query_as::<NotifyResponseRecord>()
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
            WHERE created_at < ?
            ORDER BY created_at ASC
            LIMIT ?
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
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM notify_responses WHERE correlation_id IN (");
        let mut separated = qb.separated(", ");
        for id in correlation_ids {
            separated.push_bind(id);
        }
        qb.push(")");

        let result = qb.build().execute(&self.pool).await?;
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
            VALUES (?, ?, ?, NULL)
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
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE progress_updates SET expire_processing = ");
        qb.push_bind(lease_until);
        qb.push(
            " WHERE id = (SELECT id FROM progress_updates \
              WHERE (expire_processing IS NULL OR expire_processing < ",
        );
        qb.push_bind(now);
        qb.push(")");
        if !busy.is_empty() {
            qb.push(" AND correlation_id NOT IN (");
            let mut separated = qb.separated(", ");
            for id in busy {
                separated.push_bind(id);
            }
            qb.push(")");
        }
        qb.push(
            " ORDER BY id ASC LIMIT 1) \
             RETURNING id, correlation_id, payload, created_at, expire_processing",
        );

        let record = qb
            .build_query_as::<ProgressUpdateRecord>()
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn delete_progress(&self, id: i64) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM progress_updates WHERE id = ?")
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
            VALUES (?, ?, ?)
            ON CONFLICT (name) DO UPDATE
            SET holder = excluded.holder, expires_at = excluded.expires_at
            WHERE engine_locks.expires_at < ? OR engine_locks.holder = excluded.holder
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
        sqlx::query("DELETE FROM engine_locks WHERE name = ? AND holder = ?")
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
