//! Tree Metadata (§3): the root-committing summary of a batch — entry
//! count, the stream id list, and a Bloom filter over `streamid-*`,
//! `model-*`, and `controller-*` strings (false-positive target 10⁻⁴).

use bloomfilter::Bloom;
use serde::{Deserialize, Serialize};

use crate::types::Candidate;

const FALSE_POSITIVE_RATE: f64 = 1e-4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeMetadata {
    pub num_entries: usize,
    pub stream_ids: Vec<String>,
    /// Serialised Bloom filter bit vector, so the metadata block is a
    /// self-contained, content-addressed DAG-CBOR block.
    pub bloom_bits: Vec<u8>,
    pub bloom_bitmap_bits: u64,
    pub bloom_k_hashes: u32,
}

impl TreeMetadata {
    pub fn build(candidates: &[Candidate]) -> Self {
        let stream_ids: Vec<String> = candidates.iter().map(|c| c.stream_id.clone()).collect();

        let items_count = (stream_ids.len() * 3).max(1);
        let mut bloom = Bloom::new_for_fp_rate(items_count, FALSE_POSITIVE_RATE);

        for candidate in candidates {
            bloom.set(&format!("streamid-{}", candidate.stream_id));
            if let Some(metadata) = &candidate.metadata {
                if let Some(model) = &metadata.model {
                    bloom.set(&format!("model-{model}"));
                }
                for controller in &metadata.controllers {
                    bloom.set(&format!("controller-{controller}"));
                }
            }
        }

        Self {
            num_entries: candidates.len(),
            stream_ids,
            bloom_bits: bloom.bitmap(),
            bloom_bitmap_bits: bloom.number_of_bits(),
            bloom_k_hashes: bloom.number_of_hash_functions(),
        }
    }

    /// Rehydrates the Bloom filter for membership testing (used by clients
    /// reading a Merkle CAR, not by the writer path itself).
    pub fn bloom(&self) -> Bloom<str> {
        Bloom::from_existing(
            &self.bloom_bits,
            self.bloom_bitmap_bits,
            self.bloom_k_hashes,
            [0u128, 0u128],
        )
    }

    pub fn might_contain_stream(&self, stream_id: &str) -> bool {
        self.bloom().check(&format!("streamid-{stream_id}"))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::super::node::cid_for;
    use super::*;
    use crate::types::{Request, RequestStatus, StreamMetadata};

    fn candidate(stream_id: &str, model: Option<&str>) -> Candidate {
        let now = Utc::now();
        Candidate {
            stream_id: stream_id.to_string(),
            request: Request {
                id: Uuid::new_v4(),
                cid: "bafyreiaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
                stream_id: stream_id.to_string(),
                status: RequestStatus::Processing,
                message: None,
                pinned: false,
                origin: None,
                timestamp: now,
                created_at: now,
                updated_at: now,
            },
            metadata: Some(StreamMetadata {
                controllers: vec!["did:key:abc".to_string()],
                model: model.map(|m| m.to_string()),
                family: None,
                schema: None,
                tags: None,
            }),
            cid: cid_for(stream_id.as_bytes()),
            already_anchored: false,
        }
    }

    #[test]
    fn bloom_filter_contains_every_stream_id() {
        let candidates = vec![candidate("s1", Some("m1")), candidate("s2", None)];
        let metadata = TreeMetadata::build(&candidates);
        assert!(metadata.might_contain_stream("s1"));
        assert!(metadata.might_contain_stream("s2"));
    }

    #[test]
    fn metadata_round_trips_through_dag_cbor() {
        let candidates = vec![candidate("s1", Some("m1"))];
        let metadata = TreeMetadata::build(&candidates);
        let bytes = serde_ipld_dagcbor::to_vec(&metadata).unwrap();
        let decoded: TreeMetadata = serde_ipld_dagcbor::from_slice(&bytes).unwrap();
        assert_eq!(decoded.num_entries, 1);
        assert!(decoded.might_contain_stream("s1"));
    }
}
