//! CAR file materialisation (§6): the Merkle CAR (root node, internal
//! nodes, anchor proof, anchor commits) and the per-anchor witness CAR.

use cid::Cid;
use iroh_car::{CarHeader, CarReader, CarWriter};
use tracing::instrument;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("CAR I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Writes a CAR v1 file with the given `roots` (empty for the Merkle CAR,
/// per §6: "`roots` list unused") and `blocks` in insertion order.
#[instrument(skip(blocks), fields(n = blocks.len()))]
pub async fn write_car(roots: Vec<Cid>, blocks: &[(Cid, Vec<u8>)]) -> Result<Vec<u8>> {
    let header = CarHeader::new_v1(roots);
    let mut buffer = Vec::new();
    let mut writer = CarWriter::new(header, &mut buffer);

    for (cid, bytes) in blocks {
        writer.write(*cid, bytes).await?;
    }
    writer.finish().await?;

    Ok(buffer)
}

/// Reads every block out of a CAR file, preserving order, for verification
/// and for tests that round-trip a witness CAR.
pub async fn read_car(bytes: &[u8]) -> Result<(Vec<Cid>, Vec<(Cid, Vec<u8>)>)> {
    let mut reader = CarReader::new(bytes).await?;
    let roots = reader.header().roots().to_vec();

    let mut blocks = Vec::new();
    while let Some((cid, data)) = reader.next_block().await? {
        blocks.push((cid, data));
    }

    Ok((roots, blocks))
}

#[cfg(test)]
mod tests {
    use super::super::node::cid_for;
    use super::*;

    #[tokio::test]
    async fn round_trips_blocks_in_order() {
        let blocks = vec![
            (cid_for(b"one"), b"one".to_vec()),
            (cid_for(b"two"), b"two".to_vec()),
        ];
        let root = blocks[1].0;

        let bytes = write_car(vec![root], &blocks).await.unwrap();
        let (roots, read_blocks) = read_car(&bytes).await.unwrap();

        assert_eq!(roots, vec![root]);
        assert_eq!(read_blocks.len(), 2);
        assert_eq!(read_blocks[0].0, blocks[0].0);
        assert_eq!(read_blocks[1].0, blocks[1].0);
    }
}
