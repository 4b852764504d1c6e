//! Immutable description of how a multi-file torrent maps onto pieces.

use crate::hash::DIGEST_LEN;
use std::ops::Range;
use std::path::PathBuf;
use thiserror::Error;

/// Information about a single file in a multi-file torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// The path components of the file, relative to the download directory.
    pub path: Vec<String>,
    /// The length of the file in bytes.
    pub length: u64,
}

impl FileInfo {
    pub fn new(path: &str, length: u64) -> Self {
        Self {
            path: path.split('/').map(str::to_string).collect(),
            length,
        }
    }

    pub fn relative_path(&self) -> PathBuf {
        self.path.iter().collect()
    }

    pub fn display_path(&self) -> String {
        self.path.join("/")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("piece length must be positive")]
    ZeroPieceLength,

    #[error("torrent has no files")]
    NoFiles,

    #[error("expected {expected} piece hashes, got {actual}")]
    HashCount { expected: u32, actual: usize },

    #[error("torrent too large: {0} pieces")]
    TooManyPieces(u64),
}

/// A contiguous run of bytes inside one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    pub file: usize,
    pub file_offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone)]
pub struct TorrentLayout {
    piece_length: u32,
    piece_count: u32,
    total_length: u64,
    files: Vec<FileInfo>,
    offsets: Vec<u64>,
    file_pieces: Vec<Range<u32>>,
    piece_hashes: Vec<[u8; DIGEST_LEN]>,
}

impl TorrentLayout {
    /// Builds the layout. `piece_hashes` may be empty when verification is not needed.
    pub fn new(
        piece_length: u32,
        files: Vec<FileInfo>,
        piece_hashes: Vec<[u8; DIGEST_LEN]>,
    ) -> Result<Self, LayoutError> {
        if piece_length == 0 {
            return Err(LayoutError::ZeroPieceLength);
        }
        if files.is_empty() {
            return Err(LayoutError::NoFiles);
        }

        let pl = piece_length as u64;
        let mut offsets = Vec::with_capacity(files.len());
        let mut file_pieces = Vec::with_capacity(files.len());
        let mut total = 0u64;
        for file in &files {
            offsets.push(total);
            if file.length == 0 {
                file_pieces.push(0..0);
                continue;
            }
            let first = total / pl;
            let last = (total + file.length - 1) / pl;
            file_pieces.push(first as u32..last as u32 + 1);
            total += file.length;
        }

        let count = total.div_ceil(pl);
        let piece_count =
            u32::try_from(count).map_err(|_| LayoutError::TooManyPieces(count))?;
        if !piece_hashes.is_empty() && piece_hashes.len() != piece_count as usize {
            return Err(LayoutError::HashCount {
                expected: piece_count,
                actual: piece_hashes.len(),
            });
        }

        Ok(Self {
            piece_length,
            piece_count,
            total_length: total,
            files,
            offsets,
            file_pieces,
            piece_hashes,
        })
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    pub fn file(&self, index: usize) -> Option<&FileInfo> {
        self.files.get(index)
    }

    /// Pieces overlapping file `index`; empty for zero-length files.
    pub fn file_pieces(&self, index: usize) -> Range<u32> {
        self.file_pieces[index].clone()
    }

    pub fn piece_hash(&self, piece: u32) -> Option<&[u8; DIGEST_LEN]> {
        self.piece_hashes.get(piece as usize)
    }

    pub fn piece_offset(&self, piece: u32) -> u64 {
        piece as u64 * self.piece_length as u64
    }

    /// Length of `piece`; the final piece may be short.
    pub fn piece_size(&self, piece: u32) -> u32 {
        if piece + 1 == self.piece_count {
            let rem = self.total_length % self.piece_length as u64;
            if rem == 0 {
                self.piece_length
            } else {
                rem as u32
            }
        } else {
            self.piece_length
        }
    }

    /// Splits the byte range `[offset, offset + length)` of the stream into per-file spans.
    pub fn spans(&self, offset: u64, length: u64) -> Vec<FileSpan> {
        let mut spans = Vec::new();
        let end = offset + length;
        for (index, file) in self.files.iter().enumerate() {
            if file.length == 0 {
                continue;
            }
            let start = self.offsets[index];
            let stop = start + file.length;
            if stop <= offset || start >= end {
                continue;
            }
            let lo = offset.max(start);
            let hi = end.min(stop);
            spans.push(FileSpan {
                file: index,
                file_offset: lo - start,
                length: hi - lo,
            });
        }
        spans
    }

    /// The part of `piece` occupied by file `index`, as `(start_in_piece, length)`.
    pub fn file_range_in_piece(&self, index: usize, piece: u32) -> Option<(u32, u32)> {
        let file = &self.files[index];
        if file.length == 0 {
            return None;
        }
        let piece_start = self.piece_offset(piece);
        let piece_end = piece_start + self.piece_size(piece) as u64;
        let start = self.offsets[index];
        let stop = start + file.length;
        let lo = piece_start.max(start);
        let hi = piece_end.min(stop);
        if lo >= hi {
            return None;
        }
        Some(((lo - piece_start) as u32, (hi - lo) as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abc_layout() -> TorrentLayout {
        let files = vec![
            FileInfo::new("a", 6),
            FileInfo::new("b", 2),
            FileInfo::new("c", 4),
        ];
        TorrentLayout::new(4, files, Vec::new()).unwrap()
    }

    #[test]
    fn test_file_pieces_multi_file() {
        let layout = abc_layout();
        assert_eq!(layout.piece_count(), 3);
        assert_eq!(layout.file_pieces(0), 0..2);
        assert_eq!(layout.file_pieces(1), 1..2);
        assert_eq!(layout.file_pieces(2), 2..3);
    }

    #[test]
    fn test_zero_length_file_has_no_pieces() {
        let files = vec![FileInfo::new("a", 4), FileInfo::new("empty", 0), FileInfo::new("b", 4)];
        let layout = TorrentLayout::new(4, files, Vec::new()).unwrap();
        assert!(layout.file_pieces(1).is_empty());
        assert_eq!(layout.file_pieces(2), 1..2);
        assert!(layout.spans(0, 8).iter().all(|s| s.file != 1));
    }

    #[test]
    fn test_exact_multiple_single_file() {
        let layout = TorrentLayout::new(16, vec![FileInfo::new("x", 64)], Vec::new()).unwrap();
        assert_eq!(layout.piece_count(), 4);
        assert_eq!(layout.file_pieces(0), 0..4);
        assert_eq!(layout.file_pieces(0).last(), Some(3));
        assert_eq!(layout.piece_size(3), 16);
    }

    #[test]
    fn test_short_last_piece() {
        let layout = TorrentLayout::new(4, vec![FileInfo::new("x", 10)], Vec::new()).unwrap();
        assert_eq!(layout.piece_count(), 3);
        assert_eq!(layout.piece_size(2), 2);
    }

    #[test]
    fn test_spans_cross_file_boundary() {
        let layout = abc_layout();
        let spans = layout.spans(4, 4);
        assert_eq!(
            spans,
            vec![
                FileSpan { file: 0, file_offset: 4, length: 2 },
                FileSpan { file: 1, file_offset: 0, length: 2 },
            ]
        );
    }

    #[test]
    fn test_file_range_in_piece() {
        let layout = abc_layout();
        assert_eq!(layout.file_range_in_piece(0, 0), Some((0, 4)));
        assert_eq!(layout.file_range_in_piece(0, 1), Some((0, 2)));
        assert_eq!(layout.file_range_in_piece(1, 1), Some((2, 2)));
        assert_eq!(layout.file_range_in_piece(2, 1), None);
    }

    #[test]
    fn test_hash_count_mismatch() {
        let err = TorrentLayout::new(4, vec![FileInfo::new("x", 8)], vec![[0u8; 20]]).unwrap_err();
        assert_eq!(err, LayoutError::HashCount { expected: 2, actual: 1 });
    }

    #[test]
    fn test_zero_piece_length() {
        let err = TorrentLayout::new(0, vec![FileInfo::new("x", 8)], Vec::new()).unwrap_err();
        assert_eq!(err, LayoutError::ZeroPieceLength);
    }
}
