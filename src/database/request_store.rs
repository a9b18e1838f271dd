//! Request Store (C2): persistent storage of anchor requests with
//! concurrency-safe status transitions, plus the readiness-promotion
//! algorithm (C8) and the transaction mutex used by the Blockchain Client
//! (C9).

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder, Transaction};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{is_serialization_failure, Database, Error, Result, TRANSACTION_MUTEX_NAME};
use crate::types::{Request, RequestStatus, CONFLICT_RESOLUTION_REJECTED};

impl Database {
    /// Upsert by `cid`. Safe under concurrent callers for the same cid: a
    /// conflicting insert returns the already-persisted row unchanged.
    #[instrument(skip(self, request), level = "debug")]
    pub async fn create_or_update(&self, request: NewRequest) -> Result<Request> {
        let row = sqlx::query_as::<_, Request>(
            r#"
            INSERT INTO request (id, cid, stream_id, status, message, pinned, origin, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (cid) DO UPDATE SET cid = request.cid
            RETURNING id, cid, stream_id, status, message, pinned, origin, timestamp, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&request.cid)
        .bind(&request.stream_id)
        .bind(RequestStatus::Pending)
        .bind(&request.message)
        .bind(request.pinned)
        .bind(&request.origin)
        .bind(request.timestamp)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    #[instrument(skip(self, requests), level = "debug")]
    pub async fn create_requests(&self, requests: &[NewRequest]) -> Result<u64> {
        if requests.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::new(
            "INSERT INTO request (id, cid, stream_id, status, message, pinned, origin, timestamp) ",
        );
        builder.push_values(requests, |mut b, r| {
            b.push_bind(Uuid::new_v4())
                .push_bind(&r.cid)
                .push_bind(&r.stream_id)
                .push_bind(RequestStatus::Pending)
                .push_bind(&r.message)
                .push_bind(r.pinned)
                .push_bind(&r.origin)
                .push_bind(r.timestamp);
        });
        builder.push(" ON CONFLICT (cid) DO NOTHING");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn find_by_cid(&self, cid: &str) -> Result<Option<Request>> {
        let row = sqlx::query_as::<_, Request>("SELECT * FROM request WHERE cid = $1")
            .bind(cid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Request>> {
        let rows = sqlx::query_as::<_, Request>("SELECT * FROM request WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn find_by_status(&self, status: RequestStatus) -> Result<Vec<Request>> {
        let rows = sqlx::query_as::<_, Request>("SELECT * FROM request WHERE status = $1")
            .bind(status)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn count_by_status(&self, status: RequestStatus) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM request WHERE status = $1")
            .bind(status)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Bulk status/pinned update by id, optionally inside a caller-owned
    /// transaction (used by the Anchor Service's persist step, §4.6 step 11).
    #[instrument(skip(self, ids), level = "debug")]
    pub async fn update_requests_status(
        &self,
        tx: Option<&mut Transaction<'_, Postgres>>,
        ids: &[Uuid],
        status: RequestStatus,
        pinned: Option<bool>,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let query = sqlx::query(
            "UPDATE request SET status = $1, pinned = COALESCE($2, pinned), updated_at = (NOW() AT TIME ZONE 'UTC') WHERE id = ANY($3)",
        )
        .bind(status)
        .bind(pinned)
        .bind(ids);

        let result = match tx {
            Some(tx) => query.execute(&mut **tx).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(result.rows_affected())
    }

    /// Set every other non-terminal request on `request.stream_id` whose
    /// `created_at` precedes `request.created_at` to REPLACED.
    #[instrument(skip(self), level = "debug")]
    pub async fn mark_previous_replaced(&self, request: &Request) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE request
            SET status = $1, updated_at = (NOW() AT TIME ZONE 'UTC')
            WHERE stream_id = $2
              AND id <> $3
              AND created_at < $4
              AND status NOT IN ($5, $6, $1)
            "#,
        )
        .bind(RequestStatus::Replaced)
        .bind(&request.stream_id)
        .bind(request.id)
        .bind(request.created_at)
        .bind(RequestStatus::Completed)
        .bind(RequestStatus::Replaced)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// The readiness-promotion algorithm, run inside one serialisable
    /// transaction (§4.1). Returns every request promoted to READY.
    #[instrument(skip(self), level = "debug")]
    pub async fn find_and_mark_ready(
        &self,
        max_streams: i64,
        min_streams: i64,
        max_anchoring_delay: Duration,
        processing_timeout: Duration,
        failure_retry_window: Duration,
    ) -> Result<Vec<Request>> {
        let mut tx = self.pool.begin().await?;

        let overdue_pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM request WHERE status = $1 AND created_at < (NOW() AT TIME ZONE 'UTC') - $2::interval",
        )
        .bind(RequestStatus::Pending)
        .bind(duration_to_pg_interval(max_anchoring_delay))
        .fetch_one(&mut *tx)
        .await?;

        // Distinct streams whose newest non-terminal request is eligible:
        // PENDING, FAILED-but-retryable, or PROCESSING-timed-out.
        let eligible_streams: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT stream_id FROM request r
            WHERE status = $1
               OR (status = $2 AND created_at > (NOW() AT TIME ZONE 'UTC') - $3::interval AND (message IS NULL OR message <> $4))
               OR (status = $5 AND updated_at < (NOW() AT TIME ZONE 'UTC') - $6::interval)
            "#,
        )
        .bind(RequestStatus::Pending)
        .bind(RequestStatus::Failed)
        .bind(duration_to_pg_interval(failure_retry_window))
        .bind(CONFLICT_RESOLUTION_REJECTED)
        .bind(RequestStatus::Processing)
        .bind(duration_to_pg_interval(processing_timeout))
        .fetch_all(&mut *tx)
        .await?;

        if (eligible_streams.len() as i64) < min_streams && overdue_pending == 0 {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let taken: Vec<String> = eligible_streams
            .into_iter()
            .take(max_streams.max(0) as usize)
            .collect();

        if taken.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let promoted = sqlx::query_as::<_, Request>(
            r#"
            UPDATE request
            SET status = $1, updated_at = (NOW() AT TIME ZONE 'UTC')
            WHERE stream_id = ANY($2) AND status NOT IN ($3, $4)
            RETURNING id, cid, stream_id, status, message, pinned, origin, timestamp, created_at, updated_at
            "#,
        )
        .bind(RequestStatus::Ready)
        .bind(&taken)
        .bind(RequestStatus::Completed)
        .bind(RequestStatus::Replaced)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(promoted = promoted.len(), streams = taken.len(), "promoted requests to READY");
        Ok(promoted)
    }

    /// Atomically take up to `max` READY rows and move them to PROCESSING.
    #[instrument(skip(self), level = "debug")]
    pub async fn batch_processing(&self, max: i64) -> Result<Vec<Request>> {
        let rows = sqlx::query_as::<_, Request>(
            r#"
            UPDATE request
            SET status = $1, updated_at = (NOW() AT TIME ZONE 'UTC')
            WHERE id IN (
                SELECT id FROM request WHERE status = $2 ORDER BY created_at LIMIT $3 FOR UPDATE SKIP LOCKED
            )
            RETURNING id, cid, stream_id, status, message, pinned, origin, timestamp, created_at, updated_at
            "#,
        )
        .bind(RequestStatus::Processing)
        .bind(RequestStatus::Ready)
        .bind(max)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Reset READY rows stuck past `READY_TIMEOUT` back to PENDING so they
    /// are re-promoted on the next tick.
    #[instrument(skip(self), level = "debug")]
    pub async fn update_expiring_ready_requests(&self, ready_timeout: Duration) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE request SET status = $1, updated_at = (NOW() AT TIME ZONE 'UTC') WHERE status = $2 AND updated_at < (NOW() AT TIME ZONE 'UTC') - $3::interval",
        )
        .bind(RequestStatus::Pending)
        .bind(RequestStatus::Ready)
        .bind(duration_to_pg_interval(ready_timeout))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// COMPLETED/FAILED rows whose `updated_at` predates `expiry` and whose
    /// stream has no newer request.
    pub async fn find_requests_to_garbage_collect(
        &self,
        expiry: Duration,
    ) -> Result<Vec<Request>> {
        let rows = sqlx::query_as::<_, Request>(
            r#"
            SELECT r.* FROM request r
            WHERE r.status IN ($1, $2)
              AND r.updated_at < (NOW() AT TIME ZONE 'UTC') - $3::interval
              AND NOT EXISTS (
                  SELECT 1 FROM request newer
                  WHERE newer.stream_id = r.stream_id AND newer.created_at > r.created_at
              )
            "#,
        )
        .bind(RequestStatus::Completed)
        .bind(RequestStatus::Failed)
        .bind(duration_to_pg_interval(expiry))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Acquire the database-backed transaction mutex, run `op`, then
    /// release it. Retries `attempts` times with `wait` between tries on
    /// contention before failing with [`Error::MutexUnavailable`].
    ///
    /// Implemented as a row-level `SELECT ... FOR UPDATE NOWAIT` on the
    /// single `transaction` row rather than `pg_advisory_lock`, so the lock
    /// is automatically released on connection loss without a matching
    /// unlock call.
    #[instrument(skip(self, op), level = "debug")]
    pub async fn with_transaction_mutex<F, Fut, T>(
        &self,
        attempts: u32,
        wait: Duration,
        op: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        for attempt in 0..attempts.max(1) {
            let mut tx = self.pool.begin().await?;

            let locked = sqlx::query("SELECT nonce FROM transaction WHERE name = $1 FOR UPDATE NOWAIT")
                .bind(TRANSACTION_MUTEX_NAME)
                .fetch_optional(&mut *tx)
                .await;

            match locked {
                Ok(Some(_)) => {
                    let result = op().await;
                    sqlx::query("UPDATE transaction SET nonce = nonce + 1 WHERE name = $1")
                        .bind(TRANSACTION_MUTEX_NAME)
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await?;
                    return result;
                }
                Ok(None) => {
                    return Err(Error::MutexUnavailable { attempts });
                }
                Err(err) if is_lock_not_available(&err) || is_serialization_failure(&err) => {
                    warn!(attempt, "transaction mutex contended, retrying");
                    tokio::time::sleep(wait).await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(Error::MutexUnavailable { attempts })
    }
}

fn is_lock_not_available(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("55P03"))
}

fn duration_to_pg_interval(d: Duration) -> String {
    format!("{} milliseconds", d.as_millis())
}

/// Fields needed to insert a new [`Request`]; `id`/`created_at`/`updated_at`
/// are server-assigned.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub cid: String,
    pub stream_id: String,
    pub message: Option<String>,
    pub pinned: bool,
    pub origin: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Object-safe facade over the inherent methods above, so the Anchor
/// Service and Scheduler can hold `Arc<dyn RequestStore>` without naming
/// `Database` directly (A4's composition-root preference).
#[async_trait::async_trait]
pub trait RequestStore: Send + Sync {
    async fn create_or_update(&self, request: NewRequest) -> Result<Request>;
    async fn find_by_status(&self, status: RequestStatus) -> Result<Vec<Request>>;
    async fn mark_previous_replaced(&self, request: &Request) -> Result<u64>;
    async fn find_and_mark_ready(
        &self,
        max_streams: i64,
        min_streams: i64,
        max_anchoring_delay: Duration,
        processing_timeout: Duration,
        failure_retry_window: Duration,
    ) -> Result<Vec<Request>>;
    async fn batch_processing(&self, max: i64) -> Result<Vec<Request>>;
    async fn update_requests_status(&self, ids: &[Uuid], status: RequestStatus, pinned: Option<bool>) -> Result<u64>;
}

#[async_trait::async_trait]
impl RequestStore for Database {
    async fn create_or_update(&self, request: NewRequest) -> Result<Request> {
        Database::create_or_update(self, request).await
    }

    async fn find_by_status(&self, status: RequestStatus) -> Result<Vec<Request>> {
        Database::find_by_status(self, status).await
    }

    async fn mark_previous_replaced(&self, request: &Request) -> Result<u64> {
        Database::mark_previous_replaced(self, request).await
    }

    async fn find_and_mark_ready(
        &self,
        max_streams: i64,
        min_streams: i64,
        max_anchoring_delay: Duration,
        processing_timeout: Duration,
        failure_retry_window: Duration,
    ) -> Result<Vec<Request>> {
        Database::find_and_mark_ready(
            self,
            max_streams,
            min_streams,
            max_anchoring_delay,
            processing_timeout,
            failure_retry_window,
        )
        .await
    }

    async fn batch_processing(&self, max: i64) -> Result<Vec<Request>> {
        Database::batch_processing(self, max).await
    }

    async fn update_requests_status(&self, ids: &[Uuid], status: RequestStatus, pinned: Option<bool>) -> Result<u64> {
        Database::update_requests_status(self, None, ids, status, pinned).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_formats_milliseconds() {
        assert_eq!(duration_to_pg_interval(Duration::from_secs(1)), "1000 milliseconds");
    }

    #[test]
    fn distinct_stream_set_excludes_terminal_statuses() {
        // A smoke test that the HashSet-based filtering utility used
        // elsewhere in garbage collection treats REPLACED/COMPLETED as
        // terminal; full coverage lives in the docker-backed integration
        // suite below.
        let statuses: HashSet<RequestStatus> =
            [RequestStatus::Replaced, RequestStatus::Completed].into_iter().collect();
        assert!(statuses.iter().all(|s| s.is_terminal()));
    }
}

#[cfg(test)]
mod integration_tests {
    use std::time::Duration;

    use chrono::Utc;
    use testcontainers::clients::Cli;

    use super::*;
    use crate::config::DatabaseConfig;

    async fn test_db(docker: &Cli) -> (Database, postgres_docker_utils::DockerContainerGuard) {
        let container = postgres_docker_utils::setup().await.unwrap();
        let _ = docker;
        let config = DatabaseConfig {
            database_url: format!(
                "postgres://postgres@localhost:{}/postgres",
                container.port()
            ),
            migrate: true,
            max_connections: 5,
        };
        let db = Database::new(&config).await.unwrap();
        (db, container)
    }

    fn new_request(stream_id: &str, cid: &str) -> NewRequest {
        NewRequest {
            cid: cid.to_string(),
            stream_id: stream_id.to_string(),
            message: None,
            pinned: false,
            origin: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_or_update_is_idempotent_on_cid() {
        let docker = Cli::default();
        let (db, _container) = test_db(&docker).await;

        let first = db.create_or_update(new_request("stream-a", "cid-a")).await.unwrap();
        let second = db.create_or_update(new_request("stream-a", "cid-a")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(db.count_by_status(RequestStatus::Pending).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn mark_previous_replaced_only_affects_older_non_terminal_rows() {
        let docker = Cli::default();
        let (db, _container) = test_db(&docker).await;

        let r1 = db.create_or_update(new_request("stream-a", "cid-a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let r2 = db.create_or_update(new_request("stream-a", "cid-b")).await.unwrap();

        db.mark_previous_replaced(&r2).await.unwrap();

        let r1 = db.find_by_cid(&r1.cid).await.unwrap().unwrap();
        let r2 = db.find_by_cid(&r2.cid).await.unwrap().unwrap();
        assert_eq!(r1.status, RequestStatus::Replaced);
        assert_eq!(r2.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn find_and_mark_ready_requires_min_streams_unless_overdue() {
        let docker = Cli::default();
        let (db, _container) = test_db(&docker).await;

        db.create_or_update(new_request("stream-a", "cid-a")).await.unwrap();

        let promoted = db
            .find_and_mark_ready(
                10,
                2,
                Duration::from_secs(600),
                Duration::from_secs(300),
                Duration::from_secs(3600),
            )
            .await
            .unwrap();
        assert!(promoted.is_empty());

        let promoted = db
            .find_and_mark_ready(
                10,
                1,
                Duration::from_secs(600),
                Duration::from_secs(300),
                Duration::from_secs(3600),
            )
            .await
            .unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].status, RequestStatus::Ready);
    }

    #[tokio::test]
    async fn processing_timeout_requests_are_repromoted() {
        let docker = Cli::default();
        let (db, _container) = test_db(&docker).await;

        let request = db.create_or_update(new_request("stream-a", "cid-a")).await.unwrap();
        db.update_requests_status(None, &[request.id], RequestStatus::Processing, None)
            .await
            .unwrap();
        sqlx::query("UPDATE request SET updated_at = (NOW() AT TIME ZONE 'UTC') - INTERVAL '10 minutes' WHERE id = $1")
            .bind(request.id)
            .execute(db.pool())
            .await
            .unwrap();

        let promoted = db
            .find_and_mark_ready(
                10,
                1,
                Duration::from_secs(600),
                Duration::from_secs(300),
                Duration::from_secs(3600),
            )
            .await
            .unwrap();
        assert_eq!(promoted.len(), 1);

        let processing = db.batch_processing(10).await.unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].status, RequestStatus::Processing);
    }

    #[tokio::test]
    async fn transaction_mutex_serialises_concurrent_holders() {
        let docker = Cli::default();
        let (db, _container) = test_db(&docker).await;

        let result = db
            .with_transaction_mutex(3, Duration::from_millis(10), || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(result, 42);
    }
}
