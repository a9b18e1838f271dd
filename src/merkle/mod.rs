//! Merkle Tree Builder (C6): a deterministic, depth-bounded binary tree
//! over ordered candidates, materialised as DAG-CBOR blocks addressed by
//! CID and packed into a CAR file.
//!
//! Construction rule (§4.4): repeatedly pair adjacent nodes; for odd
//! layers, carry the lone node up one level unpaired. This is a dynamic-N
//! tree, not the teacher's fixed-depth zero-padded `merkle_tree.rs` — the
//! `Hasher`/`Proof` split of that module is kept, generalised from hashes
//! to CIDs and from a perfect binary tree to this pairing rule.

pub mod car;
pub mod metadata;
pub mod node;
pub mod proof;

use cid::Cid;
use tracing::instrument;

pub use metadata::TreeMetadata;
pub use node::{InternalNode, NodeData};

use crate::types::Candidate;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tree has {n} leaves, exceeding the depth {depth} bound of 2^{depth} = {limit}")]
    TreeTooLarge { n: usize, depth: u32, limit: usize },
    #[error("cannot build a tree with zero candidates")]
    Empty,
    #[error(transparent)]
    Cbor(#[from] serde_ipld_dagcbor::EncodeError<std::collections::TryReserveError>),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One direction from a parent to a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    pub fn as_char(self) -> char {
        match self {
            Direction::Left => '0',
            Direction::Right => '1',
        }
    }
}

/// A built Merkle tree: the root CID, every block keyed by CID (for CAR
/// assembly), and per-leaf direct paths for anchor-commit construction.
pub struct MerkleTree {
    pub root: Cid,
    pub depth: u32,
    pub num_leaves: usize,
    /// Every block (leaves excluded — leaves are the candidates' own CIDs,
    /// already held elsewhere) keyed by its CID, in insertion order.
    pub blocks: Vec<(Cid, Vec<u8>)>,
    /// Leaf index -> direct path from root to that leaf.
    pub paths: Vec<Vec<Direction>>,
    /// Leaf index -> sibling nodes along the path to the root, root-to-leaf
    /// order, used to rebuild/verify the proof.
    pub proofs: Vec<Vec<Cid>>,
    /// Leaf index -> internal-node CIDs from the root down to that leaf,
    /// root-to-leaf order. Empty for a single-leaf tree (no internal node
    /// exists; the root CID is the leaf's own CID).
    pub ancestors: Vec<Vec<Cid>>,
}

/// Build a tree over `candidates` (already in final leaf order — the
/// caller is responsible for the two-stage sort from §4.3/§4.4) bounded by
/// `depth_limit` (0 = unbounded).
#[instrument(skip(candidates), fields(n = candidates.len()))]
pub fn build_tree(candidates: &[Candidate], depth_limit: u32) -> Result<MerkleTree> {
    if candidates.is_empty() {
        return Err(Error::Empty);
    }

    if depth_limit > 0 {
        let limit = 1usize << depth_limit;
        if candidates.len() > limit {
            return Err(Error::TreeTooLarge {
                n: candidates.len(),
                depth: depth_limit,
                limit,
            });
        }
    }

    let metadata = TreeMetadata::build(candidates);
    let metadata_bytes = serde_ipld_dagcbor::to_vec(&metadata)?;
    let metadata_cid = node::cid_for(&metadata_bytes);

    let mut blocks = Vec::new();
    blocks.push((metadata_cid, metadata_bytes));

    // `layer[i]` holds, for every node currently at this layer, its CID and
    // the list of leaf indices it subsumes (used afterwards to build
    // per-leaf paths/proofs without re-walking the tree).
    let mut layer: Vec<(Cid, Vec<usize>)> = candidates
        .iter()
        .map(|c| (c.cid, vec![]))
        .collect();
    // Direct-path accumulator per leaf, appended to as we climb.
    let mut paths: Vec<Vec<Direction>> = vec![Vec::new(); candidates.len()];
    let mut proofs: Vec<Vec<Cid>> = vec![Vec::new(); candidates.len()];
    // Every internal node CID on the route from the root down to this leaf
    // (used to assemble the witness CAR, which must let a verifier walk
    // the root block down to the leaf using only `path`'s directions).
    let mut ancestors: Vec<Vec<Cid>> = vec![Vec::new(); candidates.len()];
    // Which leaves each current-layer node subsumes, by index into
    // `candidates`.
    let mut subsumed: Vec<Vec<usize>> = (0..candidates.len()).map(|i| vec![i]).collect();

    let mut depth = 0u32;
    while layer.len() > 1 {
        let mut next_layer = Vec::with_capacity(layer.len().div_ceil(2));
        let mut next_subsumed = Vec::with_capacity(layer.len().div_ceil(2));
        let mut i = 0;
        while i < layer.len() {
            if i + 1 < layer.len() {
                let (left_cid, _) = &layer[i];
                let (right_cid, _) = &layer[i + 1];
                let is_root_merge = layer.len() == 2;
                let node = InternalNode {
                    left: *left_cid,
                    right: Some(*right_cid),
                    metadata: if is_root_merge { Some(metadata_cid) } else { None },
                };
                let bytes = serde_ipld_dagcbor::to_vec(&node)?;
                let cid = node::cid_for(&bytes);
                blocks.push((cid, bytes));

                for &leaf in &subsumed[i] {
                    paths[leaf].push(Direction::Left);
                    proofs[leaf].push(*right_cid);
                    ancestors[leaf].push(cid);
                }
                for &leaf in &subsumed[i + 1] {
                    paths[leaf].push(Direction::Right);
                    proofs[leaf].push(*left_cid);
                    ancestors[leaf].push(cid);
                }

                let mut combined = subsumed[i].clone();
                combined.extend_from_slice(&subsumed[i + 1]);
                next_layer.push((cid, vec![]));
                next_subsumed.push(combined);
                i += 2;
            } else {
                // Odd node carried up unpaired: no new block, no path
                // direction appended — it simply continues into the next
                // layer under the same CID.
                next_layer.push(layer[i].clone());
                next_subsumed.push(subsumed[i].clone());
                i += 1;
            }
        }
        layer = next_layer;
        subsumed = next_subsumed;
        depth += 1;
    }

    let root = if candidates.len() == 1 {
        // A single-leaf tree has no internal node at all; the root CID is
        // the leaf's own CID (§8 boundary: N=1, path="0", proof=[]).
        layer[0].0
    } else {
        layer[0].0
    };

    // Reverse proofs/paths/ancestors so they read root-to-leaf (they were
    // built leaf-to-root while climbing).
    for p in &mut paths {
        p.reverse();
    }
    for p in &mut proofs {
        p.reverse();
    }
    for a in &mut ancestors {
        a.reverse();
    }

    Ok(MerkleTree {
        root,
        depth,
        num_leaves: candidates.len(),
        blocks,
        paths,
        proofs,
        ancestors,
    })
}

impl MerkleTree {
    /// Every internal-node CID from the root down to (but excluding) the
    /// given leaf, in root-to-leaf order — the blocks a witness CAR needs
    /// so a verifier can walk `path_string`'s directions from the root and
    /// land on the leaf's own commit CID.
    pub fn path_nodes(&self, leaf_index: usize) -> &[Cid] {
        &self.ancestors[leaf_index]
    }

    pub fn block_bytes(&self, cid: &Cid) -> Option<&[u8]> {
        self.blocks.iter().find(|(c, _)| c == cid).map(|(_, b)| b.as_slice())
    }

    pub fn path_string(&self, leaf_index: usize) -> String {
        if self.paths[leaf_index].is_empty() {
            return "0".to_string();
        }
        self.paths[leaf_index]
            .iter()
            .map(|d| d.as_char())
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::types::{Request, RequestStatus};

    fn candidate(stream_id: &str, cid_str: &str) -> Candidate {
        let bytes = cid_str.as_bytes();
        let cid = node::cid_for(bytes);
        let now = Utc::now();
        Candidate {
            stream_id: stream_id.to_string(),
            request: Request {
                id: Uuid::new_v4(),
                cid: cid.to_string(),
                stream_id: stream_id.to_string(),
                status: RequestStatus::Processing,
                message: None,
                pinned: false,
                origin: None,
                timestamp: now,
                created_at: now,
                updated_at: now,
            },
            metadata: None,
            cid,
            already_anchored: false,
        }
    }

    #[test]
    fn single_leaf_has_trivial_path_and_no_proof() {
        let candidates = vec![candidate("s1", "a")];
        let tree = build_tree(&candidates, 0).unwrap();
        assert_eq!(tree.num_leaves, 1);
        assert_eq!(tree.path_string(0), "0");
        assert!(tree.proofs[0].is_empty());
        assert_eq!(tree.root, candidates[0].cid);
    }

    #[test]
    fn four_leaves_produce_the_expected_path_set() {
        let candidates = vec![
            candidate("s1", "a"),
            candidate("s2", "b"),
            candidate("s3", "c"),
            candidate("s4", "d"),
        ];
        let tree = build_tree(&candidates, 2).unwrap();
        let mut paths: Vec<String> = (0..4).map(|i| tree.path_string(i)).collect();
        paths.sort();
        assert_eq!(
            paths,
            vec!["0/0".to_string(), "0/1".to_string(), "1/0".to_string(), "1/1".to_string()]
        );
    }

    #[test]
    fn odd_leaf_count_carries_last_node_up_unpaired() {
        let candidates = vec![candidate("s1", "a"), candidate("s2", "b"), candidate("s3", "c")];
        let tree = build_tree(&candidates, 0).unwrap();
        // Leaf 2 (the odd one out at the first layer) should only ever
        // take left turns until it's finally paired.
        assert!(tree.paths[2].iter().all(|d| *d == Direction::Left) || tree.paths[2].is_empty());
    }

    #[test]
    fn depth_overflow_is_rejected() {
        let candidates: Vec<_> = (0..5)
            .map(|i| candidate(&format!("s{i}"), &format!("c{i}")))
            .collect();
        let err = build_tree(&candidates, 2).unwrap_err();
        assert!(matches!(err, Error::TreeTooLarge { n: 5, depth: 2, limit: 4 }));
    }

    #[test]
    fn building_twice_is_deterministic() {
        let candidates = vec![candidate("s1", "a"), candidate("s2", "b"), candidate("s3", "c")];
        let tree1 = build_tree(&candidates, 0).unwrap();
        let tree2 = build_tree(&candidates, 0).unwrap();
        assert_eq!(tree1.root, tree2.root);
        assert_eq!(
            (0..3).map(|i| tree1.path_string(i)).collect::<Vec<_>>(),
            (0..3).map(|i| tree2.path_string(i)).collect::<Vec<_>>()
        );
    }
}
