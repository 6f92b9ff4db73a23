//! Download Manager: fetches a scheduled queue of pieces from their peers,
//! combines them back into a whole file, and republishes it.

use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::mpsc;
use std::thread;

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::piece::{self, FileInfo, PieceStore};
use crate::scheduler::PeerKey;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Piece(piece::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{}", err),
            Self::Piece(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<piece::Error> for Error {
    fn from(value: piece::Error) -> Self {
        Self::Piece(value)
    }
}

/// One worker's progress tick, `pieces_done` counting up from 1. An external
/// UI collaborator may subscribe to the channel; callers that don't care
/// pass a sender whose receiver they simply drop.
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent {
    pub worker_id: usize,
    pub pieces_done: u32,
}

/// A no-op sink for callers that have no progress UI to drive.
pub fn no_op_progress() -> mpsc::Sender<ProgressEvent> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || while rx.recv().is_ok() {});
    tx
}

fn fetch_piece(peer: &PeerKey, piece_name: &str) -> Result<Vec<u8>, Error> {
    let mut stream = TcpStream::connect((peer.0.as_str(), peer.1))?;
    stream.write_all(format!("request {}", piece_name).as_bytes())?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Runs one worker's queue to completion: each piece is fetched over a fresh
/// connection and written to `temp_dir`. A piece that fails is logged and
/// skipped rather than retried, at the cost of a short or corrupt combine
/// result for that file.
fn run_worker(
    worker_id: usize,
    peer: PeerKey,
    piece_names: Vec<String>,
    temp_dir: &Path,
    progress: &mpsc::Sender<ProgressEvent>,
) {
    let mut pieces_done = 0u32;
    for piece_name in piece_names {
        let bytes = match fetch_piece(&peer, &piece_name) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(worker_id, piece = %piece_name, error = %err, "piece fetch failed, skipping");
                continue;
            }
        };

        if bytes.is_empty() {
            warn!(worker_id, piece = %piece_name, "peer returned zero bytes, skipping");
            continue;
        }

        if let Err(err) = fs::write(temp_dir.join(&piece_name), &bytes) {
            warn!(worker_id, piece = %piece_name, error = %err, "failed to stage piece");
            continue;
        }

        pieces_done += 1;
        let _ = progress.send(ProgressEvent { worker_id, pieces_done });
        debug!(worker_id, piece = %piece_name, "piece staged");
    }
}

/// Spawns one worker per peer in `queues`, waits for all of them, then
/// combines, re-ingests, and republishes every requested filename.
pub fn run(
    queues: &[(PeerKey, Vec<String>)],
    filenames: &[String],
    temp_dir: &Path,
    repo_dir: &Path,
    store: &PieceStore,
    progress: mpsc::Sender<ProgressEvent>,
) -> Result<Vec<(String, FileInfo)>, Error> {
    fs::create_dir_all(temp_dir)?;
    fs::create_dir_all(repo_dir)?;

    let handles: Vec<_> = queues
        .iter()
        .cloned()
        .enumerate()
        .map(|(worker_id, (peer, piece_names))| {
            let temp_dir = temp_dir.to_path_buf();
            let progress = progress.clone();
            thread::spawn(move || run_worker(worker_id, peer, piece_names, &temp_dir, &progress))
        })
        .collect();

    for handle in handles {
        let _ = handle.join();
    }

    let mut ingested = Vec::new();
    for filename in filenames {
        let combined_path = combine(filename, temp_dir, repo_dir)?;
        let info = store.ingest(&combined_path)?;
        ingested.push((filename.clone(), info));
    }

    clear_temp(temp_dir)?;

    Ok(ingested)
}

/// Enumerates `temp/{base}_*.{ext}`, sorts by integer piece index, and
/// memory-map-copies each piece's bytes into `repo/<filename>` in order.
fn combine(filename: &str, temp_dir: &Path, repo_dir: &Path) -> Result<std::path::PathBuf, Error> {
    let (base, ext) = piece::split_ext(filename)?;
    let prefix = format!("{}_", base);
    let suffix = format!(".{}", ext);

    let mut indexed: Vec<(u32, std::path::PathBuf)> = fs::read_dir(temp_dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            let stripped = name.strip_prefix(&prefix)?.strip_suffix(&suffix)?;
            let piece_id: u32 = stripped.parse().ok()?;
            Some((piece_id, entry.path()))
        })
        .collect();
    indexed.sort_by_key(|(piece_id, _)| *piece_id);

    let out_path = repo_dir.join(filename);
    let mut out = fs::File::create(&out_path)?;

    for (_, piece_path) in indexed {
        let source = fs::File::open(&piece_path)?;
        if source.metadata()?.len() == 0 {
            continue;
        }
        // SAFETY: read-only mapping of a just-opened temp piece file.
        let mmap = unsafe { Mmap::map(&source)? };
        out.write_all(&mmap)?;
    }

    Ok(out_path)
}

fn clear_temp(temp_dir: &Path) -> Result<(), Error> {
    for entry in fs::read_dir(temp_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PIECE_SIZE;
    use std::net::TcpListener;

    fn spawn_piece_server(piece_bodies: Vec<(&'static str, Vec<u8>)>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            for _ in 0..piece_bodies.len() {
                let (mut stream, _) = listener.accept().unwrap();
                let mut buf = [0u8; 1024];
                let n = stream.read(&mut buf).unwrap();
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let name = request.trim_start_matches("request ").trim();
                let body = piece_bodies
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, b)| b.clone())
                    .unwrap_or_default();
                stream.write_all(&body).unwrap();
            }
        });
        port
    }

    #[test]
    fn run_combines_pieces_fetched_from_a_single_peer() {
        let tmp = tempfile::tempdir().unwrap();
        let temp_dir = tmp.path().join("temp");
        let repo_dir = tmp.path().join("repo");
        let pieces_dir = tmp.path().join("pieces");

        let piece0 = vec![1u8; PIECE_SIZE as usize];
        let piece1 = vec![2u8; 10];
        let port = spawn_piece_server(vec![("f_0.bin", piece0.clone()), ("f_1.bin", piece1.clone())]);

        let store = PieceStore::open(&pieces_dir).unwrap();
        let peer: PeerKey = ("127.0.0.1".to_string(), port);
        let queues = vec![(peer, vec!["f_0.bin".to_string(), "f_1.bin".to_string()])];

        let result = run(
            &queues,
            &["f.bin".to_string()],
            &temp_dir,
            &repo_dir,
            &store,
            no_op_progress(),
        )
        .unwrap();

        let mut expected = piece0;
        expected.extend(piece1);
        let combined = fs::read(repo_dir.join("f.bin")).unwrap();
        assert_eq!(combined, expected);
        assert_eq!(result[0].1.piece_count, 2);

        let remaining: Vec<_> = fs::read_dir(&temp_dir).unwrap().collect();
        assert!(remaining.is_empty());
    }
}
