//! Wire shapes for Merkle nodes and CID derivation.

use cid::multihash::Multihash;
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// DAG-CBOR multicodec code, per the IPLD spec.
const DAG_CBOR: u64 = 0x71;

/// Computes the CID a block's bytes will be addressed by: sha2-256 digest,
/// wrapped as a DAG-CBOR (`0x71`) CIDv1.
pub fn cid_for(bytes: &[u8]) -> Cid {
    let digest: Multihash<64> = Code::Sha2_256.digest(bytes);
    Cid::new_v1(DAG_CBOR, digest)
}

/// An internal Merkle node: `[left, right | null, metadata?]`, per §4.4.
/// `metadata` is present only on the root's merge step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalNode {
    pub left: Cid,
    pub right: Option<Cid>,
    pub metadata: Option<Cid>,
}

impl Serialize for InternalNode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let len = if self.metadata.is_some() { 3 } else { 2 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.left)?;
        seq.serialize_element(&self.right)?;
        if let Some(metadata) = &self.metadata {
            seq.serialize_element(metadata)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for InternalNode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct NodeVisitor;

        impl<'de> Visitor<'de> for NodeVisitor {
            type Value = InternalNode;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a [left, right, metadata?] array")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let left: Cid = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(0, &self))?;
                let right: Option<Cid> = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(1, &self))?;
                let metadata: Option<Cid> = seq.next_element()?.flatten();
                Ok(InternalNode { left, right, metadata })
            }
        }

        deserializer.deserialize_seq(NodeVisitor)
    }
}

/// Leaf payload: a candidate's own commit CID. Leaves are not re-encoded as
/// separate blocks — the candidate's CID already addresses the underlying
/// commit; the tree only adds internal nodes and tree metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeData(pub Cid);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_is_deterministic() {
        let a = cid_for(b"hello");
        let b = cid_for(b"hello");
        assert_eq!(a, b);
        assert_ne!(a, cid_for(b"world"));
    }

    #[test]
    fn internal_node_round_trips_through_dag_cbor() {
        let left = cid_for(b"left");
        let right = cid_for(b"right");
        let node = InternalNode { left, right: Some(right), metadata: None };
        let bytes = serde_ipld_dagcbor::to_vec(&node).unwrap();
        let decoded: InternalNode = serde_ipld_dagcbor::from_slice(&bytes).unwrap();
        assert_eq!(node, decoded);
    }
}
