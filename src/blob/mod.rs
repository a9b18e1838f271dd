//! Content-addressed blob storage (C5): Merkle CAR files and per-anchor
//! witness CAR files, each keyed by CID string. Two backends share one
//! trait: an in-memory store for tests, and an S3-backed store for
//! production.

pub mod memory;
pub mod s3;

pub use memory::MemoryBlobStore;
pub use s3::S3BlobStore;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("blob store I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A content-addressed byte store. Keys are CID string form; values are CAR
/// bytes. There is no deletion — blobs are retained for the lifetime of the
/// backing store.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}
