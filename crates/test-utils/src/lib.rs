//! Shared test fixtures for ceramic-anchor-service: small, dependency-light
//! helpers for building CIDs and timestamps so individual test modules don't
//! each reimplement the same plumbing.

use chrono::{DateTime, Utc};
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use uuid::Uuid;

/// Derives a deterministic CID over raw bytes, using the same sha2-256 raw
/// codec convention the rest of the crate uses for content addressing.
pub fn cid_for(bytes: &[u8]) -> Cid {
    const RAW_CODEC: u64 = 0x55;
    let digest = Code::Sha2_256.digest(bytes);
    Cid::new_v1(RAW_CODEC, digest)
}

/// A stable CID derived from a short label, for tests that just need
/// "some distinct CID" without caring about its bytes.
pub fn test_cid(label: &str) -> Cid {
    cid_for(label.as_bytes())
}

/// A stable UUID derived from a short label, for tests that want
/// reproducible ids instead of `Uuid::new_v4()` noise in assertions.
pub fn test_uuid(label: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, label.as_bytes())
}

/// A fixed timestamp, far enough in the past that duration/expiry
/// arithmetic in tests never has to account for wall-clock drift.
pub fn test_timestamp() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}
