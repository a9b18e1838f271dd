//! Anchor Store (C3): persistent store of completed anchors, keyed by
//! request id.

use sqlx::{Postgres, QueryBuilder, Transaction};
use tracing::instrument;
use uuid::Uuid;

use super::{Database, Result};
use crate::types::{Anchor, Request};

/// Fields needed to insert a new [`Anchor`]; `id`/`created_at`/`updated_at`
/// are server-assigned.
#[derive(Debug, Clone)]
pub struct NewAnchor {
    pub request_id: Uuid,
    pub path: String,
    pub cid: String,
    pub proof_cid: String,
}

impl Database {
    /// Bulk insert, ignoring duplicates by `request_id`. Returns the number
    /// of rows actually inserted, so a retried persist step can tell
    /// whether it raced a previous attempt (idempotent under retry).
    #[instrument(skip(self, anchors), level = "debug")]
    pub async fn create_anchors(
        &self,
        tx: Option<&mut Transaction<'_, Postgres>>,
        anchors: &[NewAnchor],
    ) -> Result<u64> {
        if anchors.is_empty() {
            return Ok(0);
        }

        let mut builder =
            QueryBuilder::new("INSERT INTO anchor (id, request_id, path, cid, proof_cid) ");
        builder.push_values(anchors, |mut b, a| {
            b.push_bind(Uuid::new_v4())
                .push_bind(a.request_id)
                .push_bind(&a.path)
                .push_bind(&a.cid)
                .push_bind(&a.proof_cid);
        });
        builder.push(" ON CONFLICT (request_id) DO NOTHING");

        let query = builder.build();
        let result = match tx {
            Some(tx) => query.execute(&mut **tx).await?,
            None => query.execute(&self.pool).await?,
        };

        Ok(result.rows_affected())
    }

    pub async fn find_anchor_by_request(&self, request: &Request) -> Result<Option<Anchor>> {
        let row = sqlx::query_as::<_, Anchor>("SELECT * FROM anchor WHERE request_id = $1")
            .bind(request.id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Batch variant used by the Candidate Selector (C7) to determine which
    /// requests already have an anchor.
    pub async fn find_anchors_by_requests(&self, requests: &[Request]) -> Result<Vec<Anchor>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = requests.iter().map(|r| r.id).collect();
        let rows = sqlx::query_as::<_, Anchor>("SELECT * FROM anchor WHERE request_id = ANY($1)")
            .bind(&ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

#[async_trait::async_trait]
pub trait AnchorStore: Send + Sync {
    async fn find_anchor_by_request(&self, request: &Request) -> Result<Option<Anchor>>;
    async fn find_anchors_by_requests(&self, requests: &[Request]) -> Result<Vec<Anchor>>;
}

#[async_trait::async_trait]
impl AnchorStore for Database {
    async fn find_anchor_by_request(&self, request: &Request) -> Result<Option<Anchor>> {
        Database::find_anchor_by_request(self, request).await
    }

    async fn find_anchors_by_requests(&self, requests: &[Request]) -> Result<Vec<Anchor>> {
        Database::find_anchors_by_requests(self, requests).await
    }
}
