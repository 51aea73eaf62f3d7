//! Block/piece state machine (spec §3, §4.4). A `Piece` owns its blocks'
//! in-memory buffers; the piece store (`store.rs`) is the only thing that
//! ever touches the underlying files, so assembly only ever *calls into*
//! the store rather than writing directly.

use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use sha1::{Digest, Sha1};

use crate::block::{Block, BlockState, BLOCK_SIZE};
use crate::metainfo::{FileSpan, Metainfo};
use crate::store::PieceStore;

#[derive(Debug)]
pub struct Piece {
    pub index: usize,
    hash: [u8; 20],
    size: u64,
    blocks: Vec<Block>,
    full: bool,
    file_mapping: Vec<FileSpan>,
}

impl Piece {
    fn new(index: usize, size: u64, hash: [u8; 20], file_mapping: Vec<FileSpan>) -> Piece {
        let num_blocks = ((size + BLOCK_SIZE - 1) / BLOCK_SIZE).max(1) as usize;
        let mut blocks = Vec::with_capacity(num_blocks);
        for i in 0..num_blocks {
            let is_last = i + 1 == num_blocks;
            let block_size = if is_last {
                size - (i as u64) * BLOCK_SIZE
            } else {
                BLOCK_SIZE
            };
            blocks.push(Block::new(block_size));
        }
        Piece {
            index,
            hash,
            size,
            blocks,
            full: false,
            file_mapping,
        }
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn are_all_blocks_full(&self) -> bool {
        self.blocks.iter().all(|b| b.state == BlockState::Full)
    }

    fn reserve_block(&mut self, now: Instant) -> Option<(u32, u32, u32)> {
        if self.full {
            return None;
        }
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if block.state == BlockState::Free {
                block.mark_pending(now);
                return Some((self.index as u32, (i as u64 * BLOCK_SIZE) as u32, block.size as u32));
            }
        }
        None
    }

    fn deliver_block(&mut self, offset: u32, data: Vec<u8>) -> bool {
        if self.full {
            return false;
        }
        let index = (offset as u64 / BLOCK_SIZE) as usize;
        let Some(block) = self.blocks.get_mut(index) else {
            return false;
        };
        if block.state == BlockState::Full {
            return false;
        }
        block.mark_full(data);
        self.are_all_blocks_full()
    }

    fn sweep(&mut self, now: Instant, timeout: Duration) {
        for block in &mut self.blocks {
            if block.is_pending_since_longer_than(now, timeout) {
                block.reset();
            }
        }
    }

    fn assembled_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size as usize);
        for block in &self.blocks {
            out.extend_from_slice(&block.data);
        }
        out
    }

    fn reset_all_blocks(&mut self) {
        for block in &mut self.blocks {
            block.reset();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyOutcome {
    Committed,
    /// Hash mismatch; all blocks were reset to FREE and may be re-requested.
    HashMismatch,
}

/// Owns every `Piece` for one torrent, indexed by piece index (arena +
/// index, per Design Notes "Cyclic references" — pieces refer to files by
/// index into the store's file list, never by a direct reference).
pub struct PieceTable {
    pieces: Vec<Piece>,
    completed: Sender<u32>,
}

impl PieceTable {
    pub fn new(metainfo: &Metainfo, completed: Sender<u32>) -> PieceTable {
        let pieces = (0..metainfo.number_of_pieces())
            .map(|i| {
                Piece::new(
                    i,
                    metainfo.piece_size(i),
                    metainfo.piece_hashes[i],
                    metainfo.piece_file_mapping[i].clone(),
                )
            })
            .collect();
        PieceTable { pieces, completed }
    }

    pub fn number_of_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_full(&self, piece_index: usize) -> bool {
        self.pieces[piece_index].is_full()
    }

    /// Marks a piece full without going through block assembly, for the
    /// seeding path where the content is assumed already verified on disk.
    pub fn force_mark_full(&mut self, piece_index: usize) {
        let piece = &mut self.pieces[piece_index];
        piece.full = true;
        piece.blocks.iter_mut().for_each(|b| b.data.clear());
    }

    pub fn all_completed(&self) -> bool {
        self.pieces.iter().all(|p| p.is_full())
    }

    /// Scans blocks in order; the first FREE block is marked PENDING and
    /// returned. `None` if every block is already PENDING or FULL.
    pub fn reserve_block(&mut self, piece_index: usize) -> Option<(u32, u32, u32)> {
        self.pieces[piece_index].reserve_block(Instant::now())
    }

    /// Stores a delivered block. Returns `true` if this was the last block
    /// needed, meaning the piece is ready to be assembled and verified via
    /// [`PieceTable::try_assemble`] — the caller is expected to hand the
    /// index to an assembly worker rather than hash inline.
    pub fn deliver_block(&mut self, piece_index: usize, offset: u32, data: Vec<u8>) -> bool {
        if piece_index >= self.pieces.len() {
            return false;
        }
        self.pieces[piece_index].deliver_block(offset, data)
    }

    pub fn sweep(&mut self, timeout: Duration) {
        let now = Instant::now();
        for piece in &mut self.pieces {
            piece.sweep(now, timeout);
        }
    }

    /// Concatenates a piece's blocks, verifies the SHA-1 hash, and on
    /// success writes it through the piece store and marks it full,
    /// releasing the in-memory buffer. On a hash mismatch every block is
    /// reset to FREE so it can be re-requested.
    pub fn try_assemble(
        &mut self,
        piece_index: usize,
        store: &PieceStore,
    ) -> Result<AssemblyOutcome, crate::error::EngineError> {
        let piece = &mut self.pieces[piece_index];
        let raw = piece.assembled_bytes();

        let mut hasher = Sha1::new();
        hasher.update(&raw);
        let digest: [u8; 20] = hasher.finalize().into();

        if digest != piece.hash {
            piece.reset_all_blocks();
            return Ok(AssemblyOutcome::HashMismatch);
        }

        store.write_piece(&piece.file_mapping, &raw)?;
        piece.full = true;
        piece.blocks.iter_mut().for_each(|b| b.data.clear());
        let _ = self.completed.send(piece_index as u32);
        Ok(AssemblyOutcome::Committed)
    }

    /// Reads an arbitrary sub-range of an already-full piece, for serving
    /// inbound REQUESTs. Returns `None` if the piece isn't full yet.
    pub fn read_block(
        &self,
        piece_index: usize,
        offset: u32,
        length: u32,
        store: &PieceStore,
    ) -> Result<Option<Vec<u8>>, crate::error::EngineError> {
        let piece = &self.pieces[piece_index];
        if !piece.full {
            return Ok(None);
        }
        let data = store.read(&piece.file_mapping, offset as u64, length as u64)?;
        Ok(Some(data))
    }
}
