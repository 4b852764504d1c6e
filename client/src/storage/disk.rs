use super::{PieceUpdate, StorageWrapper};
use crate::error::StorageError;
use bytes::Bytes;
use seed_core::bencoding::Bencode;
use seed_core::hash::verify_piece;
use seed_core::{FileSpan, TorrentLayout};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

const PARTIAL_DIR: &str = ".partial";

/// File-backed piece storage for a multi-file torrent.
///
/// Enabled files live at their relative path under the download directory.
/// For a disabled file only the bytes in its first and last piece are kept,
/// packed into `.partial/<index>`, so pieces it shares with neighbouring
/// enabled files can still be verified.
pub struct FileStorage {
    layout: Arc<TorrentLayout>,
    /// The root directory where files will be stored.
    pub download_dir: PathBuf,
    disabled: Vec<bool>,
    have: Vec<bool>,
    blocked: Vec<bool>,
    partials: BTreeSet<u32>,
    handles: HashMap<PathBuf, File>,
}

impl FileStorage {
    /// Opens storage for `layout`.
    ///
    /// Missing directories are created and every file is pre-allocated to
    /// its full length. Files the selector later disables are removed again
    /// by [`StorageWrapper::disable_file`] while they hold no verified pieces.
    ///
    /// # Arguments
    ///
    /// * `layout` - The file list and piece geometry of the torrent.
    /// * `path` - An optional path to the download directory. If `None`, a
    ///   `downloads` directory in the current working directory is used.
    ///
    /// # Returns
    ///
    /// * `io::Result<Self>` - The storage, or an IO error if the directory
    ///   cannot be created or a file cannot be pre-allocated.
    ///
    /// # Examples
    ///
    /// ```
    /// use onionseed::storage::FileStorage;
    /// use seed_core::{FileInfo, TorrentLayout};
    /// use std::sync::Arc;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let dir = tempfile::tempdir().unwrap();
    ///     let files = vec![FileInfo::new("movie.mkv", 10), FileInfo::new("notes.txt", 6)];
    ///     let layout = Arc::new(TorrentLayout::new(4, files, Vec::new()).unwrap());
    ///     let storage = FileStorage::open(layout, Some(dir.path().to_string_lossy().into_owned()))
    ///         .await
    ///         .unwrap();
    ///     assert!(storage.file_path(1).ends_with("notes.txt"));
    /// }
    /// ```
    pub async fn open(layout: Arc<TorrentLayout>, path: Option<String>) -> io::Result<Self> {
        let download_dir = if let Some(p) = path {
            PathBuf::from(p)
        } else {
            let mut p = std::env::current_dir()?;
            p.push("downloads");
            p
        };

        match fs::metadata(&download_dir).await {
            Ok(metadata) => {
                if !metadata.is_dir() {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "Path exists but is not a directory",
                    ));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&download_dir).await?;
            }
            Err(e) => return Err(e),
        }

        for file in layout.files() {
            let file_path = download_dir.join(file.relative_path());
            if let Some(parent) = file_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let handle = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&file_path)
                .await?;
            if handle.metadata().await?.len() < file.length {
                handle.set_len(file.length).await?;
            }
        }

        let pieces = layout.piece_count() as usize;
        Ok(Self {
            disabled: vec![false; layout.num_files()],
            have: vec![false; pieces],
            blocked: vec![false; pieces],
            partials: BTreeSet::new(),
            handles: HashMap::new(),
            layout,
            download_dir,
        })
    }

    pub fn layout(&self) -> &TorrentLayout {
        &self.layout
    }

    pub fn file_path(&self, index: usize) -> PathBuf {
        self.download_dir.join(self.layout.files()[index].relative_path())
    }

    fn partial_path(&self, index: usize) -> PathBuf {
        self.download_dir.join(PARTIAL_DIR).join(index.to_string())
    }

    pub fn is_disabled(&self, index: usize) -> bool {
        self.disabled[index]
    }

    /// Pieces written to but not yet verified.
    pub fn partials(&self) -> &BTreeSet<u32> {
        &self.partials
    }

    /// Hashes a downloaded piece and marks it present when it verifies.
    pub fn check_piece(&mut self, piece: u32) -> Result<bool, StorageError> {
        let size = self.layout.piece_size(piece);
        let data = self.read_raw(piece, 0, size)?;
        let ok = match self.layout.piece_hash(piece) {
            Some(expected) => verify_piece(&data, expected),
            None => true,
        };
        self.have[piece as usize] = ok;
        if ok {
            self.partials.remove(&piece);
        }
        Ok(ok)
    }

    // Bytes of file `index` kept in the partial file: (first piece, last piece).
    fn kept_lengths(&self, index: usize) -> (u64, u64) {
        let pieces = self.layout.file_pieces(index);
        if pieces.is_empty() {
            return (0, 0);
        }
        let first = pieces.start;
        let last = pieces.end - 1;
        let head = self
            .layout
            .file_range_in_piece(index, first)
            .map_or(0, |(_, len)| len as u64);
        let tail = if last != first {
            self.layout
                .file_range_in_piece(index, last)
                .map_or(0, |(_, len)| len as u64)
        } else {
            0
        };
        (head, tail)
    }

    // Where the bytes of `span` currently live.
    fn locate(&self, span: &FileSpan, for_write: bool) -> Result<(PathBuf, u64), StorageError> {
        if !self.disabled[span.file] {
            return Ok((self.file_path(span.file), span.file_offset));
        }
        let length = self.layout.files()[span.file].length;
        let (head, tail) = self.kept_lengths(span.file);
        let end = span.file_offset + span.length;
        if end <= head {
            Ok((self.partial_path(span.file), span.file_offset))
        } else if span.file_offset >= length - tail {
            let pos = head + span.file_offset - (length - tail);
            Ok((self.partial_path(span.file), pos))
        } else if !for_write && self.file_path(span.file).exists() {
            Ok((self.file_path(span.file), span.file_offset))
        } else {
            Err(StorageError::FileDisabled {
                path: self.file_path(span.file),
            })
        }
    }

    fn handle(&mut self, path: &Path) -> Result<&mut File, StorageError> {
        if !self.handles.contains_key(path) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|source| StorageError::FileIo {
                    path: path.to_path_buf(),
                    source,
                })?;
            self.handles.insert(path.to_path_buf(), file);
        }
        self.handles
            .get_mut(path)
            .ok_or_else(|| StorageError::FileDisabled {
                path: path.to_path_buf(),
            })
    }

    fn check_range(&self, piece: u32, offset: u32, length: u32) -> Result<u64, StorageError> {
        if piece >= self.layout.piece_count() {
            return Err(StorageError::InvalidPiece(piece));
        }
        let size = self.layout.piece_size(piece) as u64;
        if offset as u64 + length as u64 > size {
            return Err(StorageError::OutOfRange {
                piece,
                offset,
                length,
            });
        }
        Ok(self.layout.piece_offset(piece) + offset as u64)
    }
}

fn file_io(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::FileIo {
        path: path.to_path_buf(),
        source,
    }
}

impl StorageWrapper for FileStorage {
    fn has_data(&self, piece: u32) -> bool {
        self.have.get(piece as usize).copied().unwrap_or(false)
    }

    fn read_raw(&mut self, piece: u32, offset: u32, length: u32) -> Result<Bytes, StorageError> {
        let start = self.check_range(piece, offset, length)?;
        let mut out = vec![0u8; length as usize];
        let mut filled = 0usize;
        for span in self.layout.spans(start, length as u64) {
            let (path, pos) = self.locate(&span, false)?;
            let file = self.handle(&path)?;
            let dst = &mut out[filled..filled + span.length as usize];
            file.seek(SeekFrom::Start(pos)).map_err(file_io(&path))?;
            file.read_exact(dst).map_err(file_io(&path))?;
            filled += span.length as usize;
        }
        Ok(Bytes::from(out))
    }

    fn write_raw(&mut self, piece: u32, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let start = self.check_range(piece, offset, data.len() as u32)?;
        let mut written = 0usize;
        for span in self.layout.spans(start, data.len() as u64) {
            let (path, pos) = self.locate(&span, true)?;
            let file = self.handle(&path)?;
            let src = &data[written..written + span.length as usize];
            file.seek(SeekFrom::Start(pos)).map_err(file_io(&path))?;
            file.write_all(src).map_err(file_io(&path))?;
            written += span.length as usize;
        }
        if !self.has_data(piece) {
            self.partials.insert(piece);
        }
        Ok(())
    }

    fn reblock(&mut self, blocked: &[bool]) {
        for (slot, &b) in self.blocked.iter_mut().zip(blocked) {
            *slot = b;
        }
    }

    fn disable_file(&mut self, index: usize) -> Result<(), StorageError> {
        if self.disabled[index] {
            return Ok(());
        }
        let (head, tail) = self.kept_lengths(index);
        let path = self.partial_path(index);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(file_io(parent))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(file_io(&path))?;
        file.set_len(head + tail).map_err(file_io(&path))?;

        // Edge bytes are written back into the partial file by the caller;
        // the real file is only kept while it backs a verified interior piece.
        let pieces = self.layout.file_pieces(index);
        let backs_data = pieces.clone().any(|piece| {
            piece != pieces.start && piece != pieces.end - 1 && self.has_data(piece)
        });
        if !backs_data {
            let real = self.file_path(index);
            self.handles.remove(&real);
            match std::fs::remove_file(&real) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(file_io(&real)(e)),
            }
        }
        self.disabled[index] = true;
        debug!("Disabled file {} ({} bytes kept)", index, head + tail);
        Ok(())
    }

    fn enable_file(&mut self, index: usize) -> Result<(), StorageError> {
        if !self.disabled[index] {
            return Ok(());
        }
        let path = self.file_path(index);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(file_io(parent))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(file_io(&path))?;
        let length = self.layout.files()[index].length;
        if file.metadata().map_err(file_io(&path))?.len() < length {
            file.set_len(length).map_err(file_io(&path))?;
        }
        let partial = self.partial_path(index);
        self.handles.remove(&partial);
        match std::fs::remove_file(&partial) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", partial.display(), e),
        }
        self.disabled[index] = false;
        debug!("Enabled file {}", index);
        Ok(())
    }

    fn delete_file(&mut self, index: usize) -> Result<(), StorageError> {
        let path = self.file_path(index);
        self.handles.remove(&path);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(file_io(&path)(e)),
        }
        // Pieces lying entirely inside the file are gone with it.
        for piece in self.layout.file_pieces(index) {
            let inside = self
                .layout
                .file_range_in_piece(index, piece)
                .is_some_and(|(_, len)| len == self.layout.piece_size(piece));
            if inside {
                self.have[piece as usize] = false;
            }
        }
        Ok(())
    }

    fn get_piece_update_list(&self, index: usize) -> Vec<PieceUpdate> {
        let pieces = self.layout.file_pieces(index);
        if pieces.is_empty() {
            return Vec::new();
        }
        let mut edges = vec![pieces.start];
        if pieces.end - 1 != pieces.start {
            edges.push(pieces.end - 1);
        }
        edges
            .into_iter()
            .filter_map(|piece| {
                self.layout
                    .file_range_in_piece(index, piece)
                    .map(|(start, length)| PieceUpdate {
                        piece,
                        start,
                        length,
                    })
            })
            .collect()
    }

    fn reset_file_status(&mut self) {
        self.handles.clear();
    }

    fn doublecheck_data(&mut self, pieces: &BTreeSet<u32>) -> bool {
        for &piece in pieces {
            let size = self.layout.piece_size(piece);
            let data = match self.read_raw(piece, 0, size) {
                Ok(data) => data,
                Err(e) => {
                    warn!("Re-reading piece {} failed: {}", piece, e);
                    self.have[piece as usize] = false;
                    return false;
                }
            };
            if let Some(expected) = self.layout.piece_hash(piece) {
                if !verify_piece(&data, expected) {
                    warn!(
                        "Piece {} no longer matches {}",
                        piece,
                        hex::encode(expected)
                    );
                    self.have[piece as usize] = false;
                    return false;
                }
            }
        }
        true
    }

    // Blocked pieces are not wanted, so they do not count against completion.
    fn am_i_complete(&self) -> bool {
        self.have.iter().zip(&self.blocked).all(|(&h, &b)| h || b)
    }

    fn pickle(&self) -> BTreeMap<Vec<u8>, Bencode> {
        let mut bitfield = vec![0u8; self.have.len().div_ceil(8)];
        for (i, _) in self.have.iter().enumerate().filter(|(_, h)| **h) {
            bitfield[i / 8] |= 1 << (7 - (i % 8));
        }
        let partials = self
            .partials
            .iter()
            .map(|&p| Bencode::Int(p as i64))
            .collect();
        let mut d = BTreeMap::new();
        d.insert(b"pieces".to_vec(), Bencode::Bytes(bitfield));
        d.insert(b"partials".to_vec(), Bencode::List(partials));
        d
    }

    fn unpickle(&mut self, data: &Bencode) -> Vec<u32> {
        if let Some(bitfield) = data.get(b"pieces").and_then(|b| b.as_bytes()) {
            for (i, slot) in self.have.iter_mut().enumerate() {
                let byte = bitfield.get(i / 8).copied().unwrap_or(0);
                *slot = (byte >> (7 - (i % 8))) & 1 == 1;
            }
        }
        let count = self.layout.piece_count() as i64;
        let restored: Vec<u32> = data
            .get(b"partials")
            .and_then(|p| p.as_list())
            .unwrap_or(&[])
            .iter()
            .filter_map(|v| v.as_int())
            .filter(|&p| (0..count).contains(&p))
            .map(|p| p as u32)
            .filter(|&p| !self.have[p as usize])
            .collect();
        self.partials = restored.iter().copied().collect();
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seed_core::FileInfo;
    use seed_core::hash::piece_digest;
    use tempfile::tempdir;

    const CONTENT: &[u8; 12] = b"AAAAAABBCCCC";

    fn abc_layout() -> Arc<TorrentLayout> {
        let hashes = CONTENT.chunks(4).map(piece_digest).collect();
        let files = vec![
            FileInfo::new("a", 6),
            FileInfo::new("b", 2),
            FileInfo::new("dir/c", 4),
        ];
        Arc::new(TorrentLayout::new(4, files, hashes).unwrap())
    }

    async fn filled_storage(dir: &Path) -> FileStorage {
        let mut storage = FileStorage::open(abc_layout(), Some(dir.to_str().unwrap().to_string()))
            .await
            .expect("Failed to open storage");
        for piece in 0..3u32 {
            let start = piece as usize * 4;
            storage.write_raw(piece, 0, &CONTENT[start..start + 4]).unwrap();
            assert!(storage.check_piece(piece).unwrap());
        }
        storage
    }

    #[tokio::test]
    async fn test_open_preallocates_files() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let storage = FileStorage::open(abc_layout(), Some(temp_dir.path().to_str().unwrap().to_string()))
            .await
            .unwrap();
        let meta = std::fs::metadata(temp_dir.path().join("dir").join("c")).unwrap();
        assert_eq!(meta.len(), 4);
        assert!(!storage.am_i_complete());
    }

    #[tokio::test]
    async fn test_open_fails_when_path_is_a_file() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let file_path = temp_dir.path().join("i_am_a_file");
        fs::write(&file_path, "content").await.unwrap();
        let result = FileStorage::open(abc_layout(), Some(file_path.to_str().unwrap().to_string())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_write_spanning_files() {
        let temp_dir = tempdir().unwrap();
        let storage = filled_storage(temp_dir.path()).await;
        assert!(storage.am_i_complete());
        assert!(storage.partials().is_empty());
        let b = std::fs::read(temp_dir.path().join("b")).unwrap();
        assert_eq!(b, b"BB");
    }

    #[tokio::test]
    async fn test_update_list_covers_edge_pieces() {
        let temp_dir = tempdir().unwrap();
        let storage = filled_storage(temp_dir.path()).await;
        assert_eq!(
            storage.get_piece_update_list(0),
            vec![
                PieceUpdate { piece: 0, start: 0, length: 4 },
                PieceUpdate { piece: 1, start: 0, length: 2 },
            ]
        );
        assert_eq!(
            storage.get_piece_update_list(1),
            vec![PieceUpdate { piece: 1, start: 2, length: 2 }]
        );
    }

    #[tokio::test]
    async fn test_disable_relocates_into_partial_file() {
        let temp_dir = tempdir().unwrap();
        let mut storage = filled_storage(temp_dir.path()).await;

        let buffered: Vec<_> = storage
            .get_piece_update_list(0)
            .into_iter()
            .map(|u| (u.piece, u.start, storage.read_raw(u.piece, u.start, u.length).unwrap()))
            .collect();
        storage.disable_file(0).unwrap();
        storage.reset_file_status();
        for (piece, start, data) in &buffered {
            storage.write_raw(*piece, *start, data).unwrap();
        }
        assert!(storage.doublecheck_data(&BTreeSet::from([0, 1])));

        let partial = std::fs::read(temp_dir.path().join(".partial").join("0")).unwrap();
        assert_eq!(partial, b"AAAAAA");
        assert_eq!(storage.read_raw(1, 0, 4).unwrap().as_ref(), b"AABB");
    }

    #[tokio::test]
    async fn test_disabled_middle_rejects_writes() {
        let files = vec![FileInfo::new("big", 12), FileInfo::new("tail", 4)];
        let layout = Arc::new(TorrentLayout::new(4, files, Vec::new()).unwrap());
        let temp_dir = tempdir().unwrap();
        let mut storage = FileStorage::open(layout, Some(temp_dir.path().to_str().unwrap().to_string()))
            .await
            .unwrap();
        storage.disable_file(0).unwrap();
        let err = storage.write_raw(1, 0, b"xxxx").unwrap_err();
        assert!(matches!(err, StorageError::FileDisabled { .. }));
        storage.write_raw(0, 0, b"head").unwrap();
        storage.write_raw(2, 0, b"tail").unwrap();
    }

    #[tokio::test]
    async fn test_disable_removes_untouched_file() {
        let files = vec![FileInfo::new("wanted", 4), FileInfo::new("unwanted", 4096)];
        let layout = Arc::new(TorrentLayout::new(4, files, Vec::new()).unwrap());
        let temp_dir = tempdir().unwrap();
        let mut storage = FileStorage::open(layout, Some(temp_dir.path().to_str().unwrap().to_string()))
            .await
            .unwrap();
        storage.disable_file(1).unwrap();
        assert!(!temp_dir.path().join("unwanted").exists());
        assert!(temp_dir.path().join("wanted").exists());

        storage.enable_file(1).unwrap();
        let meta = std::fs::metadata(temp_dir.path().join("unwanted")).unwrap();
        assert_eq!(meta.len(), 4096);
    }

    #[tokio::test]
    async fn test_disable_keeps_file_backing_verified_pieces() {
        let files = vec![FileInfo::new("big", 12), FileInfo::new("tail", 4)];
        let layout = Arc::new(TorrentLayout::new(4, files, Vec::new()).unwrap());
        let temp_dir = tempdir().unwrap();
        let mut storage = FileStorage::open(layout, Some(temp_dir.path().to_str().unwrap().to_string()))
            .await
            .unwrap();
        storage.write_raw(1, 0, b"midl").unwrap();
        assert!(storage.check_piece(1).unwrap());

        storage.disable_file(0).unwrap();
        assert!(temp_dir.path().join("big").exists());
        assert_eq!(storage.read_raw(1, 0, 4).unwrap().as_ref(), b"midl");
    }

    #[tokio::test]
    async fn test_enable_removes_partial_file() {
        let temp_dir = tempdir().unwrap();
        let mut storage = filled_storage(temp_dir.path()).await;
        storage.disable_file(0).unwrap();
        storage.enable_file(0).unwrap();
        assert!(!temp_dir.path().join(".partial").join("0").exists());
        assert!(!storage.is_disabled(0));
    }

    #[tokio::test]
    async fn test_doublecheck_detects_corruption() {
        let temp_dir = tempdir().unwrap();
        let mut storage = filled_storage(temp_dir.path()).await;
        storage.write_raw(2, 0, b"XXXX").unwrap();
        assert!(!storage.doublecheck_data(&BTreeSet::from([2])));
        assert!(!storage.has_data(2));
    }

    #[tokio::test]
    async fn test_delete_file_forgets_inner_pieces() {
        let temp_dir = tempdir().unwrap();
        let mut storage = filled_storage(temp_dir.path()).await;
        storage.disable_file(2).unwrap();
        storage.delete_file(2).unwrap();
        assert!(!temp_dir.path().join("dir").join("c").exists());
        assert!(!storage.has_data(2));
        assert!(storage.has_data(1));
    }

    #[tokio::test]
    async fn test_pickle_round_trip() {
        let temp_dir = tempdir().unwrap();
        let dir = temp_dir.path().to_str().unwrap().to_string();
        let mut storage = FileStorage::open(abc_layout(), Some(dir.clone())).await.unwrap();
        storage.write_raw(0, 0, b"AAAA").unwrap();
        storage.check_piece(0).unwrap();
        storage.write_raw(2, 0, b"CC").unwrap();

        let blob = Bencode::Dict(storage.pickle());
        let mut restored = FileStorage::open(abc_layout(), Some(dir)).await.unwrap();
        let partials = restored.unpickle(&blob);
        assert_eq!(partials, vec![2]);
        assert!(restored.has_data(0));
        assert!(!restored.has_data(1));
    }
}
