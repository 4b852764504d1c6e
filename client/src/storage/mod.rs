//! Piece storage as seen by the file selector.

mod disk;

pub use disk::FileStorage;

use crate::error::StorageError;
use bytes::Bytes;
use seed_core::bencoding::Bencode;
use std::collections::{BTreeMap, BTreeSet};

/// A byte range of one piece whose on-disk location moves when a file flips
/// between enabled and disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceUpdate {
    pub piece: u32,
    pub start: u32,
    pub length: u32,
}

/// The storage operations the file selector drives.
///
/// Implementations that use background threads serialise access
/// internally; callers see a sequentially consistent store.
pub trait StorageWrapper {
    /// True iff `piece` is fully present and hash-verified.
    fn has_data(&self, piece: u32) -> bool;

    fn read_raw(&mut self, piece: u32, offset: u32, length: u32) -> Result<Bytes, StorageError>;

    fn write_raw(&mut self, piece: u32, offset: u32, data: &[u8]) -> Result<(), StorageError>;

    /// Records which pieces are currently unwanted. Completed pieces keep
    /// answering `has_data` truthfully.
    fn reblock(&mut self, blocked: &[bool]);

    fn disable_file(&mut self, index: usize) -> Result<(), StorageError>;

    fn enable_file(&mut self, index: usize) -> Result<(), StorageError>;

    /// Removes a disabled file's data from disk once the torrent is finished.
    fn delete_file(&mut self, index: usize) -> Result<(), StorageError>;

    fn get_piece_update_list(&self, index: usize) -> Vec<PieceUpdate>;

    /// Drops cached per-file state after a batch of enable/disable calls.
    fn reset_file_status(&mut self);

    /// Re-verifies `pieces` after relocation. Returns false on any mismatch.
    fn doublecheck_data(&mut self, pieces: &BTreeSet<u32>) -> bool;

    fn am_i_complete(&self) -> bool;

    /// Entries merged into the torrent's resume dictionary.
    fn pickle(&self) -> BTreeMap<Vec<u8>, Bencode>;

    /// Restores state from resume data and returns the pieces that were
    /// partially downloaded.
    fn unpickle(&mut self, data: &Bencode) -> Vec<u32>;
}
