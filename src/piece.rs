//! Piece Store: slices locally-held files into fixed-size pieces and serves
//! their bytes back out.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::PIECE_SIZE;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    MissingPiece(String),
    InvalidFilename(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{}", err),
            Self::MissingPiece(name) => write!(f, "no such piece: {}", name),
            Self::InvalidFilename(name) => write!(f, "filename has no extension: {}", name),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// One contiguous slice of an original file, `[start_offset, end_offset)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub piece_id: u32,
    pub original_filename: String,
    pub start_offset: u64,
    pub end_offset: u64,
}

impl Piece {
    pub fn len(&self) -> u64 {
        self.end_offset - self.start_offset
    }
}

/// `(file_size, piece_size, piece_count)`, as published to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_size: u64,
    pub piece_size: u32,
    pub piece_count: u32,
}

impl FileInfo {
    pub fn for_file_size(file_size: u64, piece_size: u32) -> Self {
        let piece_count = file_size.div_ceil(piece_size as u64) as u32;
        let piece_count = piece_count.max(1);
        Self {
            file_size,
            piece_size,
            piece_count,
        }
    }
}

/// Splits `"1MB.txt"` into `("1MB", "txt")`. A filename with no `.` is an
/// error: piece naming always needs an extension to re-append.
pub(crate) fn split_ext(filename: &str) -> Result<(&str, &str), Error> {
    match filename.rsplit_once('.') {
        Some((base, ext)) => Ok((base, ext)),
        None => Err(Error::InvalidFilename(filename.to_string())),
    }
}

/// Piece storage name: `"{basename_without_ext}_{piece_id}.{ext}"`.
pub fn piece_filename(original_filename: &str, piece_id: u32) -> Result<String, Error> {
    let (base, ext) = split_ext(original_filename)?;
    Ok(format!("{}_{}.{}", base, piece_id, ext))
}

struct Index {
    pieces: Vec<Piece>,
}

/// Owns the `pieces/` directory and the in-memory index of what has been
/// sliced into it.
pub struct PieceStore {
    pieces_dir: PathBuf,
    piece_size: u64,
    index: RwLock<Index>,
}

impl PieceStore {
    /// Opens a store using the default [`PIECE_SIZE`].
    pub fn open(pieces_dir: impl Into<PathBuf>) -> Result<Self, Error> {
        Self::with_piece_size(pieces_dir, PIECE_SIZE)
    }

    /// Opens a store that slices ingested files into `piece_size`-byte
    /// windows, overriding the default (`torrentd node --piece-size`).
    pub fn with_piece_size(pieces_dir: impl Into<PathBuf>, piece_size: u64) -> Result<Self, Error> {
        let pieces_dir = pieces_dir.into();
        fs::create_dir_all(&pieces_dir)?;
        Ok(Self {
            pieces_dir,
            piece_size,
            index: RwLock::new(Index { pieces: Vec::new() }),
        })
    }

    /// Reads `file` in `piece_size` windows, writing each to
    /// `pieces/{base}_{i}.{ext}` and recording a `Piece`. Idempotent: a
    /// second ingest of the same file drops and rebuilds its piece set
    /// rather than duplicating records.
    pub fn ingest(&self, file: &Path) -> Result<FileInfo, Error> {
        let filename = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidFilename(file.display().to_string()))?
            .to_string();

        self.drop_file(&filename)?;

        let source = fs::File::open(file)?;
        let file_size = source.metadata()?.len();

        let mut new_pieces = Vec::new();

        if file_size == 0 {
            let name = piece_filename(&filename, 0)?;
            fs::write(self.pieces_dir.join(&name), [])?;
            new_pieces.push(Piece {
                piece_id: 0,
                original_filename: filename.clone(),
                start_offset: 0,
                end_offset: 0,
            });
        } else {
            // SAFETY: `source` is not mutated or truncated concurrently by
            // this process; it is a just-opened, exclusively-read handle.
            let mmap = unsafe { Mmap::map(&source)? };

            let mut piece_id = 0u32;
            let mut start = 0u64;
            while start < file_size {
                let end = (start + self.piece_size).min(file_size);
                let name = piece_filename(&filename, piece_id)?;
                fs::write(self.pieces_dir.join(&name), &mmap[start as usize..end as usize])?;

                new_pieces.push(Piece {
                    piece_id,
                    original_filename: filename.clone(),
                    start_offset: start,
                    end_offset: end,
                });

                piece_id += 1;
                start = end;
            }
        }

        let piece_count = new_pieces.len() as u32;
        {
            let mut index = self.index.write().unwrap();
            index.pieces.extend(new_pieces);
        }

        Ok(FileInfo {
            file_size,
            piece_size: self.piece_size as u32,
            piece_count,
        })
    }

    /// Filters the in-memory index down to the requested filenames.
    pub fn list_pieces_for<'a>(
        &self,
        filenames: impl IntoIterator<Item = &'a str>,
    ) -> std::collections::HashMap<String, Vec<u32>> {
        let filenames: std::collections::HashSet<&str> = filenames.into_iter().collect();
        let index = self.index.read().unwrap();

        let mut out: std::collections::HashMap<String, Vec<u32>> = std::collections::HashMap::new();
        for piece in &index.pieces {
            if filenames.contains(piece.original_filename.as_str()) {
                out.entry(piece.original_filename.clone())
                    .or_default()
                    .push(piece.piece_id);
            }
        }
        for ids in out.values_mut() {
            ids.sort_unstable();
        }
        out
    }

    /// Memory-maps and returns the full bytes of one piece file.
    pub fn read_piece(&self, piece_filename: &str) -> Result<Vec<u8>, Error> {
        let path = self.pieces_dir.join(piece_filename);
        let file = fs::File::open(&path)
            .map_err(|_| Error::MissingPiece(piece_filename.to_string()))?;

        if file.metadata()?.len() == 0 {
            return Ok(Vec::new());
        }

        // SAFETY: read-only mapping of a file this process just opened.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(mmap.to_vec())
    }

    /// Deletes all in-memory records and on-disk piece files for `file`.
    pub fn drop_file(&self, file: &str) -> Result<(), Error> {
        let removed: Vec<Piece> = {
            let mut index = self.index.write().unwrap();
            let (removed, kept): (Vec<_>, Vec<_>) = index
                .pieces
                .drain(..)
                .partition(|p| p.original_filename == file);
            index.pieces = kept;
            removed
        };

        for piece in removed {
            if let Ok(name) = piece_filename(&piece.original_filename, piece.piece_id) {
                let _ = fs::remove_file(self.pieces_dir.join(name));
            }
        }

        Ok(())
    }

    pub fn pieces_dir(&self) -> &Path {
        &self.pieces_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn ingest_splits_into_expected_piece_count() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        let data = vec![7u8; (PIECE_SIZE as usize) + 10];
        let file = write_file(&repo, "1MB.txt", &data);

        let store = PieceStore::open(tmp.path().join("pieces")).unwrap();
        let info = store.ingest(&file).unwrap();

        assert_eq!(info.file_size, data.len() as u64);
        assert_eq!(info.piece_count, 2);

        let pieces = store.list_pieces_for(["1MB.txt"]);
        assert_eq!(pieces["1MB.txt"], vec![0, 1]);
    }

    #[test]
    fn ingest_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        let file = write_file(&repo, "a.bin", &[1, 2, 3]);

        let store = PieceStore::open(tmp.path().join("pieces")).unwrap();
        store.ingest(&file).unwrap();
        store.ingest(&file).unwrap();

        let pieces = store.list_pieces_for(["a.bin"]);
        assert_eq!(pieces["a.bin"], vec![0]);
    }

    #[test]
    fn piece_round_trip_reconstructs_file_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        let data: Vec<u8> = (0..(PIECE_SIZE * 2 + 123))
            .map(|i| (i % 251) as u8)
            .collect();
        let file = write_file(&repo, "x.dat", &data);

        let store = PieceStore::open(tmp.path().join("pieces")).unwrap();
        let info = store.ingest(&file).unwrap();

        let mut combined = Vec::new();
        for piece_id in 0..info.piece_count {
            let name = piece_filename("x.dat", piece_id).unwrap();
            combined.extend(store.read_piece(&name).unwrap());
        }

        assert_eq!(combined, data);
    }

    #[test]
    fn drop_removes_records_and_files() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        let file = write_file(&repo, "b.bin", &[9; 10]);

        let store = PieceStore::open(tmp.path().join("pieces")).unwrap();
        store.ingest(&file).unwrap();
        store.drop_file("b.bin").unwrap();

        let pieces = store.list_pieces_for(["b.bin"]);
        assert!(pieces.is_empty());
        assert!(!store.pieces_dir().join("b_0.bin").exists());
    }
}
