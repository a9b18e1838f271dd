//! Legacy transaction shape (§4.5): a self-transaction carrying the root
//! CID's bytes as `data`.

use cid::Cid;
use ethers::types::{Address, Bytes};

/// `0x` + lowercase hex of the root CID's bytes, per §6.
pub fn encode_data(root: &Cid) -> Bytes {
    Bytes::from(root.to_bytes())
}

pub fn to_address(wallet: Address) -> Address {
    wallet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::node::cid_for;

    #[test]
    fn encodes_root_bytes_as_data() {
        let root = cid_for(b"root");
        let data = encode_data(&root);
        assert_eq!(data.to_vec(), root.to_bytes());
    }
}
