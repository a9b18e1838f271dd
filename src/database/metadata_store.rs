//! Metadata Store (C4): per-stream genesis-header fields consumed by the
//! leaf comparator in the Merkle Tree Builder (C6) and the Bloom filter in
//! Tree Metadata. Populated by the (out of scope) ingestion layer; the
//! anchoring pipeline is a read-mostly consumer, bumping `used_at` on
//! access.

use tracing::instrument;

use super::{Database, Result};
use crate::types::{MetadataRow, StreamMetadata};

impl Database {
    #[instrument(skip(self, metadata), level = "debug")]
    pub async fn save_metadata(&self, stream_id: &str, metadata: &StreamMetadata) -> Result<()> {
        let json = serde_json::to_value(metadata).expect("StreamMetadata always serializes");

        sqlx::query(
            r#"
            INSERT INTO metadata (stream_id, metadata, used_at)
            VALUES ($1, $2, (NOW() AT TIME ZONE 'UTC'))
            ON CONFLICT (stream_id) DO UPDATE
            SET metadata = EXCLUDED.metadata,
                used_at = (NOW() AT TIME ZONE 'UTC'),
                updated_at = (NOW() AT TIME ZONE 'UTC')
            "#,
        )
        .bind(stream_id)
        .bind(json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_metadata(&self, stream_id: &str) -> Result<Option<StreamMetadata>> {
        let row = sqlx::query_as::<_, MetadataRow>("SELECT * FROM metadata WHERE stream_id = $1")
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| {
            serde_json::from_value(r.metadata).unwrap_or_default()
        }))
    }

    /// Batch variant used when building candidates for an entire batch, to
    /// avoid one query per leaf.
    pub async fn load_metadata_many(
        &self,
        stream_ids: &[String],
    ) -> Result<std::collections::HashMap<String, StreamMetadata>> {
        if stream_ids.is_empty() {
            return Ok(std::collections::HashMap::new());
        }

        let rows = sqlx::query_as::<_, MetadataRow>(
            "SELECT * FROM metadata WHERE stream_id = ANY($1)",
        )
        .bind(stream_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let metadata = serde_json::from_value(r.metadata).unwrap_or_default();
                (r.stream_id, metadata)
            })
            .collect())
    }
}

#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    async fn load_metadata_many(
        &self,
        stream_ids: &[String],
    ) -> Result<std::collections::HashMap<String, StreamMetadata>>;
}

#[async_trait::async_trait]
impl MetadataStore for Database {
    async fn load_metadata_many(
        &self,
        stream_ids: &[String],
    ) -> Result<std::collections::HashMap<String, StreamMetadata>> {
        Database::load_metadata_many(self, stream_ids).await
    }
}
