//! Contract (v2) transaction shape (§4.5/§6): ABI-encoded call to the
//! fixed `anchorDagCbor(bytes32)` function on a pre-deployed contract. CAS
//! never compiles or deploys the contract itself — unlike the teacher,
//! which drives `ethers-solc`/`build.rs` for its identity-manager ABI,
//! this crate only needs the one fixed selector.

use cid::Cid;
use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes};
use ethers::utils::keccak256;

/// `keccak256("anchorDagCbor(bytes32)")[..4]`, computed once at call time
/// rather than hand-copied, so it can never drift from the signature
/// string below it.
const SIGNATURE: &str = "anchorDagCbor(bytes32)";

/// ABI-encodes a call to `anchorDagCbor(bytes32)` with the root CID's
/// 32-byte multihash digest as the argument.
pub fn encode_call(root: &Cid) -> anyhow::Result<Bytes> {
    let digest = root.hash().digest();
    let digest: [u8; 32] = digest
        .try_into()
        .map_err(|_| anyhow::anyhow!("root CID multihash digest is not 32 bytes: {}", digest.len()))?;

    let selector = &keccak256(SIGNATURE.as_bytes())[..4];
    let args = encode(&[Token::FixedBytes(digest.to_vec())]);

    let mut data = Vec::with_capacity(selector.len() + args.len());
    data.extend_from_slice(selector);
    data.extend_from_slice(&args);

    Ok(Bytes::from(data))
}

pub fn to_address(contract_address: Address) -> Address {
    contract_address
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::node::cid_for;

    #[test]
    fn encodes_selector_and_digest() {
        let root = cid_for(b"root");
        let data = encode_call(&root).unwrap();
        // 4-byte selector + 32-byte argument.
        assert_eq!(data.len(), 36);
    }

    #[test]
    fn is_deterministic() {
        let root = cid_for(b"root");
        assert_eq!(encode_call(&root).unwrap(), encode_call(&root).unwrap());
    }
}
