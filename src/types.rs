//! Domain types shared across the anchoring pipeline.

use chrono::{DateTime, Utc};
use cid::Cid;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a [`Request`]. Stored as a `SMALLINT` in Postgres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[repr(i16)]
pub enum RequestStatus {
    Pending = 0,
    Processing = 1,
    Completed = 2,
    Failed = 3,
    Ready = 4,
    Replaced = 5,
}

impl RequestStatus {
    /// Non-terminal statuses still eligible to take part in a future batch.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Replaced)
    }
}

/// The message stored on a FAILED request whose commit was superseded by
/// upstream conflict resolution. Retried requests skip rows carrying this
/// exact sentinel; everything else about error classification is by type,
/// not by string, per the error handling design.
pub const CONFLICT_RESOLUTION_REJECTED: &str = "REJECTED: Request has failed conflict resolution";

/// A client's demand that one commit CID on one stream be anchored.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Request {
    pub id: Uuid,
    pub cid: String,
    pub stream_id: String,
    pub status: RequestStatus,
    pub message: Option<String>,
    pub pinned: bool,
    pub origin: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Request {
    pub fn cid(&self) -> anyhow::Result<Cid> {
        Ok(self.cid.parse()?)
    }
}

/// The result of successfully anchoring one request.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Anchor {
    pub id: Uuid,
    pub request_id: Uuid,
    pub path: String,
    pub cid: String,
    pub proof_cid: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-stream genesis-header fields, populated by the (out of scope)
/// ingestion layer and consumed read-only by the Candidate Selector and
/// Merkle Tree Builder.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub controllers: Vec<String>,
    pub model: Option<String>,
    pub family: Option<String>,
    pub schema: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct MetadataRow {
    pub stream_id: String,
    pub metadata: serde_json::Value,
    pub used_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A per-stream candidate for inclusion in the Merkle tree: `request` is the
/// winning request for `stream_id` among any competing requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub stream_id: String,
    pub request: Request,
    pub metadata: Option<StreamMetadata>,
    pub cid: Cid,
    pub already_anchored: bool,
}

/// Grouped output of the Candidate Selector (C7).
#[derive(Debug, Default)]
pub struct CandidateGroups {
    pub accepted: Vec<Candidate>,
    pub already_anchored: Vec<Candidate>,
    pub unprocessed: Vec<Request>,
    pub failed: Vec<Request>,
}

/// Result of an on-chain root submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    /// CAIP-2 chain identifier, e.g. `eip155:1337`.
    pub chain: String,
    pub tx_hash: ethers::types::H256,
    pub block_number: u64,
    pub block_timestamp: DateTime<Utc>,
}

// The queue-delivered batch descriptor (C11) lives in `queue-client`, the
// thin crate that also owns the SQS transport; re-exported here so callers
// can reach it as `crate::types::BatchDescriptor`.
pub use queue_client::data::BatchDescriptor;
