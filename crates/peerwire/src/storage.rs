//! The storage collaborator. The engine never touches a filesystem, it reads
//! blocks to serve and writes the blocks it downloads through [`Storage`].
use futures::future::BoxFuture;
use hashbrown::HashMap;
use sha1_smol::Sha1;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    error::Error,
    torrent::TorrentMeta,
    wire::{Block, BlockInfo},
};

/// Where the pieces of a torrent live.
///
/// `write_block` is expected to verify a piece once all of its blocks were
/// written, and to fail with [`Error::CorruptPiece`] when the verification
/// fails, discarding what was written of that piece.
pub trait Storage: Send + Sync + 'static {
    /// Pieces that are already stored and verified.
    fn bitfield(&self) -> BoxFuture<'_, Result<Bitfield, Error>>;

    fn read_block(&self, info: BlockInfo) -> BoxFuture<'_, Result<Vec<u8>, Error>>;

    fn write_block(&self, block: Block) -> BoxFuture<'_, Result<(), Error>>;
}

/// SHA-1 of every piece of `data`.
pub fn piece_hashes(data: &[u8], piece_length: u32) -> Vec<[u8; 20]> {
    data.chunks(piece_length as usize)
        .map(|piece| Sha1::from(piece).digest().bytes())
        .collect()
}

#[derive(Debug)]
struct Inner {
    data: Vec<u8>,
    verified: Bitfield,
    /// Blocks written of pieces not verified yet, `piece → begin → len`
    written: HashMap<u32, HashMap<u32, u32>>,
}

/// In memory [`Storage`] that verifies pieces against their SHA-1.
#[derive(Debug)]
pub struct MemoryStorage {
    meta: TorrentMeta,
    hashes: Vec<[u8; 20]>,
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    /// Empty storage that will accept the pieces matching `hashes`.
    pub fn new(meta: TorrentMeta, hashes: Vec<[u8; 20]>) -> Self {
        let inner = Inner {
            data: vec![0; meta.total_length() as usize],
            verified: Bitfield::from_piece(meta.piece_count as usize),
            written: HashMap::new(),
        };
        Self { meta, hashes, inner: RwLock::new(inner) }
    }

    /// Storage that already has every piece of `data`.
    pub fn seeded(meta: TorrentMeta, data: Vec<u8>) -> Self {
        let hashes = piece_hashes(&data, meta.piece_length);
        let mut verified = Bitfield::from_piece(meta.piece_count as usize);
        verified.fill(true);

        let inner = Inner { data, verified, written: HashMap::new() };
        Self { meta, hashes, inner: RwLock::new(inner) }
    }

    pub fn meta(&self) -> &TorrentMeta {
        &self.meta
    }

    /// Copy of everything stored, unverified pieces included.
    pub async fn contents(&self) -> Vec<u8> {
        self.inner.read().await.data.clone()
    }

    fn offset(&self, info: &BlockInfo) -> Result<usize, Error> {
        if !self.meta.is_valid_block(info) {
            return Err(Error::InvalidBlock(*info));
        }
        Ok(info.index as usize * self.meta.piece_length as usize
            + info.begin as usize)
    }

    async fn read(&self, info: BlockInfo) -> Result<Vec<u8>, Error> {
        let offset = self.offset(&info)?;
        let inner = self.inner.read().await;

        if !inner.verified.has(info.index as usize) {
            return Err(Error::BlockUnavailable(info));
        }

        Ok(inner.data[offset..offset + info.len as usize].to_vec())
    }

    async fn write(&self, block: Block) -> Result<(), Error> {
        let info = block.info();
        let offset = self.offset(&info)?;
        let mut inner = self.inner.write().await;

        if inner.verified.has(info.index as usize) {
            return Ok(());
        }

        inner.data[offset..offset + block.block.len()].copy_from_slice(&block.block);

        let piece = inner.written.entry(info.index).or_default();
        piece.insert(info.begin, info.len);

        let written: u64 = piece.values().map(|v| *v as u64).sum();
        if written < self.meta.piece_len(info.index) as u64 {
            return Ok(());
        }

        inner.written.remove(&info.index);

        let start = info.index as usize * self.meta.piece_length as usize;
        let end = start + self.meta.piece_len(info.index) as usize;
        let hash = Sha1::from(&inner.data[start..end]).digest().bytes();

        if self.hashes.get(info.index as usize) != Some(&hash) {
            debug!("piece {} failed verification", info.index);
            return Err(Error::CorruptPiece(info.index));
        }

        inner.verified.set(info.index as usize, true);
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn bitfield(&self) -> BoxFuture<'_, Result<Bitfield, Error>> {
        Box::pin(async move { Ok(self.inner.read().await.verified.clone()) })
    }

    fn read_block(&self, info: BlockInfo) -> BoxFuture<'_, Result<Vec<u8>, Error>> {
        Box::pin(self.read(info))
    }

    fn write_block(&self, block: Block) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(self.write(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{torrent::InfoHash, wire::BLOCK_LEN};

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn meta(len: u64) -> TorrentMeta {
        TorrentMeta::new(InfoHash([1; 20]), 2 * BLOCK_LEN, len).unwrap()
    }

    #[tokio::test]
    async fn write_verify_and_read() {
        let content = data(2 * BLOCK_LEN as usize + 100);
        let meta = meta(content.len() as u64);
        let storage =
            MemoryStorage::new(meta.clone(), piece_hashes(&content, meta.piece_length));

        let info = BlockInfo::new(0, 0, BLOCK_LEN);
        assert!(matches!(
            storage.read_block(info).await,
            Err(Error::BlockUnavailable(_))
        ));

        for info in meta.block_infos(0).into_iter().chain(meta.block_infos(1)) {
            let offset = info.index as usize * meta.piece_length as usize
                + info.begin as usize;
            let block = Block::new(
                info.index,
                info.begin,
                content[offset..offset + info.len as usize].to_vec(),
            );
            storage.write_block(block).await.unwrap();
        }

        assert!(storage.bitfield().await.unwrap().all());
        assert_eq!(storage.contents().await, content);
        assert_eq!(
            storage.read_block(BlockInfo::new(1, 0, 100)).await.unwrap(),
            content[2 * BLOCK_LEN as usize..]
        );
    }

    #[tokio::test]
    async fn corrupt_piece_is_discarded() {
        let content = data(2 * BLOCK_LEN as usize);
        let meta = meta(content.len() as u64);
        let storage =
            MemoryStorage::new(meta.clone(), piece_hashes(&content, meta.piece_length));

        storage
            .write_block(Block::new(0, 0, vec![0; BLOCK_LEN as usize]))
            .await
            .unwrap();
        let err = storage
            .write_block(Block::new(0, BLOCK_LEN, vec![0; BLOCK_LEN as usize]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CorruptPiece(0)));
        assert!(!storage.bitfield().await.unwrap()[0]);

        // the second attempt starts from scratch
        storage
            .write_block(Block::new(0, 0, content[..BLOCK_LEN as usize].to_vec()))
            .await
            .unwrap();
        assert!(!storage.bitfield().await.unwrap()[0]);
        storage
            .write_block(Block::new(0, BLOCK_LEN, content[BLOCK_LEN as usize..].to_vec()))
            .await
            .unwrap();
        assert!(storage.bitfield().await.unwrap()[0]);
    }

    #[tokio::test]
    async fn out_of_bounds() {
        let content = data(100);
        let storage = MemoryStorage::seeded(meta(100), content);
        assert!(matches!(
            storage.read_block(BlockInfo::new(0, 0, 101)).await,
            Err(Error::InvalidBlock(_))
        ));
        assert!(matches!(
            storage.write_block(Block::new(1, 0, vec![1])).await,
            Err(Error::InvalidBlock(_))
        ));
        assert_eq!(storage.read_block(BlockInfo::new(0, 10, 5)).await.unwrap().len(), 5);
    }
}
