//! Persistence interfaces and backends for convene-core.
//!
//! This module defines the persistence abstraction and backend
//! implementations. All coordination logic is written against the
//! [`Persistence`] trait; the store is the single source of truth and
//! no component caches instance or response state across calls.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::EngineError;

/// A waiter registration assembled from the store.
///
/// The correlation sets are materialized from the `wait_correlations`
/// child rows: `correlation_ids` is the immutable registered set and
/// `waiting_on_correlation_ids` the still-unfulfilled subset.
#[derive(Debug, Clone)]
pub struct WaitInstanceRecord {
    /// Unique identifier; also the queue wakeup key.
    pub wait_instance_id: String,
    /// Queue topic used for wakeup events.
    pub publisher: String,
    /// Serialized terminal callback envelope.
    pub callback: Vec<u8>,
    /// Serialized progress callback envelope, if registered.
    pub progress_callback: Option<Vec<u8>>,
    /// Lease expiry; `None` or a past instant means not leased.
    pub callback_processing_at: Option<DateTime<Utc>>,
    /// Absolute deadline when a timeout was supplied at registration.
    pub timeout_at: Option<DateTime<Utc>>,
    /// TTL backstop bounding worst-case orphan lifetime.
    pub valid_until: DateTime<Utc>,
    /// When the registration was persisted.
    pub created_at: DateTime<Utc>,
    /// All correlation ids originally awaited.
    pub correlation_ids: Vec<String>,
    /// Correlation ids still unfulfilled; empty means fan-in complete.
    pub waiting_on_correlation_ids: Vec<String>,
}

impl WaitInstanceRecord {
    /// Whether the instance currently holds an unexpired processing lease.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        matches!(self.callback_processing_at, Some(until) if until > now)
    }

    /// Whether every awaited correlation id has been fulfilled.
    pub fn fan_in_complete(&self) -> bool {
        self.waiting_on_correlation_ids.is_empty()
    }
}

/// A new waiter registration to persist.
#[derive(Debug, Clone)]
pub struct NewWaitInstance {
    /// Unique identifier for the registration.
    pub wait_instance_id: String,
    /// Queue topic used for wakeup events.
    pub publisher: String,
    /// Serialized terminal callback envelope.
    pub callback: Vec<u8>,
    /// Serialized progress callback envelope, if any.
    pub progress_callback: Option<Vec<u8>>,
    /// Deduplicated correlation ids to await.
    pub correlation_ids: Vec<String>,
    /// Absolute timeout deadline, if requested.
    pub timeout_at: Option<DateTime<Utc>>,
    /// TTL backstop.
    pub valid_until: DateTime<Utc>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

/// A single fulfillment event from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NotifyResponseRecord {
    /// The fulfilled correlation id (store uniqueness key).
    pub correlation_id: String,
    /// Opaque serialized response payload.
    pub payload: Vec<u8>,
    /// Whether the producer reported an error outcome.
    pub is_error: bool,
    /// When the response was recorded.
    pub created_at: DateTime<Utc>,
}

/// A non-terminal progress event from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProgressUpdateRecord {
    /// Database primary key; preserves arrival order.
    pub id: i64,
    /// The correlation id the update refers to.
    pub correlation_id: String,
    /// Opaque serialized progress payload.
    pub payload: Vec<u8>,
    /// When the update was published.
    pub created_at: DateTime<Utc>,
    /// Processing lease expiry; `None` or past means unleased.
    pub expire_processing: Option<DateTime<Utc>>,
}

/// How a wait instance references a correlation id (sweeper view).
#[derive(Debug, Clone)]
pub struct WaitReference {
    /// The referencing instance.
    pub instance: WaitInstanceRecord,
    /// Whether the token is still pending for this instance.
    pub pending: bool,
}

/// Flat `wait_instances` row; assembled into [`WaitInstanceRecord`]
/// together with its correlation rows.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct WaitInstanceRow {
    pub wait_instance_id: String,
    pub publisher: String,
    pub callback: Vec<u8>,
    pub progress_callback: Option<Vec<u8>>,
    pub callback_processing_at: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub valid_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct CorrelationRow {
    pub correlation_id: String,
    pub fulfilled: bool,
}

pub(crate) fn assemble_instance(
    row: WaitInstanceRow,
    correlations: Vec<CorrelationRow>,
) -> WaitInstanceRecord {
    let correlation_ids = correlations
        .iter()
        .map(|c| c.correlation_id.clone())
        .collect();
    let waiting_on_correlation_ids = correlations
        .into_iter()
        .filter(|c| !c.fulfilled)
        .map(|c| c.correlation_id)
        .collect();
    WaitInstanceRecord {
        wait_instance_id: row.wait_instance_id,
        publisher: row.publisher,
        callback: row.callback,
        progress_callback: row.progress_callback,
        callback_processing_at: row.callback_processing_at,
        timeout_at: row.timeout_at,
        valid_until: row.valid_until,
        created_at: row.created_at,
        correlation_ids,
        waiting_on_correlation_ids,
    }
}

/// Saturating `now + after` in store time.
pub(crate) fn deadline_after(now: DateTime<Utc>, after: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Saturating `now - before` in store time.
pub(crate) fn cutoff_before(now: DateTime<Utc>, before: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(before)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Persistence interface used by the coordination components.
///
/// Mutations of wait-instance state happen only through the atomic
/// operations below (decrement, absorb, lease, delete); application
/// code never read-modifies-writes a record.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ========================================================================
    // Wait Instances
    // ========================================================================

    /// Persist a new wait instance together with its correlation rows.
    async fn insert_wait_instance(&self, new: &NewWaitInstance) -> Result<(), EngineError>;

    async fn get_wait_instance(
        &self,
        wait_instance_id: &str,
    ) -> Result<Option<WaitInstanceRecord>, EngineError>;

    /// Registration double-check: atomically mark fulfilled every
    /// pending correlation id that already has a recorded response,
    /// returning the updated instance. `None` if the instance is gone.
    async fn absorb_existing_responses(
        &self,
        wait_instance_id: &str,
    ) -> Result<Option<WaitInstanceRecord>, EngineError>;

    /// Atomically mark `correlation_id` fulfilled on one instance that
    /// still lists it as pending, returning the updated instance.
    /// Returns `None` once no instance is waiting on the token.
    ///
    /// The parent row is locked for the update, so when two producers
    /// race on the same instance exactly one of them observes the
    /// transition to an empty pending set.
    async fn decrement_one(
        &self,
        correlation_id: &str,
    ) -> Result<Option<WaitInstanceRecord>, EngineError>;

    /// Acquire the processing lease: set `callback_processing_at` to
    /// `lease_until` iff the current lease is absent or expired at
    /// `now`, returning the leased instance in the same operation.
    /// Returns `None` when the instance is gone or currently leased.
    async fn lease_wait_instance(
        &self,
        wait_instance_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<WaitInstanceRecord>, EngineError>;

    /// Drop the processing lease without deleting the instance.
    async fn clear_lease(&self, wait_instance_id: &str) -> Result<(), EngineError>;

    /// Remove the instance and its correlation rows. Idempotent; the
    /// instance is gone forever afterwards (no resurrection).
    async fn delete_wait_instance(&self, wait_instance_id: &str) -> Result<(), EngineError>;

    /// Instances whose timeout deadline has passed and which are not
    /// currently leased, oldest deadline first.
    async fn list_timed_out_instances(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WaitInstanceRecord>, EngineError>;

    /// Delete instances past their `valid_until` backstop. Returns the
    /// count of purged instances.
    async fn purge_expired_wait_instances(&self, now: DateTime<Utc>) -> Result<u64, EngineError>;

    /// All instances whose registered correlation set contains the
    /// token, with a per-instance flag for whether it is still pending.
    async fn instances_referencing(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<WaitReference>, EngineError>;

    /// Instances referencing the token that carry a progress callback.
    async fn progress_targets(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<WaitInstanceRecord>, EngineError>;

    // ========================================================================
    // Notify Responses
    // ========================================================================

    /// Insert a response. A uniqueness conflict on `correlation_id`
    /// surfaces as [`EngineError::DuplicateResponse`].
    async fn insert_response(
        &self,
        correlation_id: &str,
        payload: &[u8],
        is_error: bool,
        created_at: DateTime<Utc>,
    ) -> Result<(), EngineError>;

    /// Fetch the responses recorded for the given tokens; tokens with
    /// no response are simply absent from the result.
    async fn fetch_responses(
        &self,
        correlation_ids: &[String],
    ) -> Result<Vec<NotifyResponseRecord>, EngineError>;

    /// Responses recorded before `cutoff`, oldest first, bounded.
    async fn list_responses_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<NotifyResponseRecord>, EngineError>;

    /// Delete responses by correlation id. Returns the deleted count.
    async fn delete_responses(&self, correlation_ids: &[String]) -> Result<u64, EngineError>;

    // ========================================================================
    // Progress Updates
    // ========================================================================

    async fn insert_progress(
        &self,
        correlation_id: &str,
        payload: &[u8],
        created_at: DateTime<Utc>,
    ) -> Result<(), EngineError>;

    /// Lease the oldest unleased progress update whose correlation id
    /// is not in `busy`, setting `expire_processing` to `lease_until`.
    async fn lease_next_progress(
        &self,
        busy: &[String],
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<ProgressUpdateRecord>, EngineError>;

    async fn delete_progress(&self, id: i64) -> Result<(), EngineError>;

    // ========================================================================
    // Cluster Locks
    // ========================================================================

    /// Conditionally take the named lock: succeeds when the lock row is
    /// absent, expired at `now`, or already held by `holder`.
    async fn try_acquire_lock(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, EngineError>;

    /// Release the named lock if still held by `holder`.
    async fn release_lock(&self, name: &str, holder: &str) -> Result<(), EngineError>;

    // ========================================================================
    // Health
    // ========================================================================

    async fn health_check_db(&self) -> Result<bool, EngineError>;
}
