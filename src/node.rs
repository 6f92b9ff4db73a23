//! A peer node's side of the control connection to the tracker, plus the
//! orchestration that turns a `fetch` request into peer `find` queries, a
//! scheduled download, and a republish.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};

use tracing::warn;

use crate::download::{self, ProgressEvent};
use crate::piece::{self, FileInfo, PieceStore};
use crate::protocol::{self, FetchResponse, FileInfoMap};
use crate::scheduler::{self, PeerKey};

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Protocol(protocol::Error),
    Piece(piece::Error),
    Download(download::Error),
    Tracker(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{}", err),
            Self::Protocol(err) => write!(f, "{}", err),
            Self::Piece(err) => write!(f, "{}", err),
            Self::Download(err) => write!(f, "{}", err),
            Self::Tracker(msg) => write!(f, "tracker error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<protocol::Error> for Error {
    fn from(value: protocol::Error) -> Self {
        Self::Protocol(value)
    }
}

impl From<piece::Error> for Error {
    fn from(value: piece::Error) -> Self {
        Self::Piece(value)
    }
}

impl From<download::Error> for Error {
    fn from(value: download::Error) -> Self {
        Self::Download(value)
    }
}

/// A running peer node: its piece store, local directories, and the single
/// control connection held open to the tracker for the process's lifetime.
pub struct Node {
    pub store: Arc<PieceStore>,
    repo_dir: PathBuf,
    temp_dir: PathBuf,
    advertise_ip: String,
    upload_port: u16,
    control: Mutex<TcpStream>,
    file_info: Mutex<FileInfoMap>,
}

impl Node {
    /// Ingests any files already present in `repo_dir`, then performs the
    /// tracker handshake (`First Connection` + the four-field message)
    /// advertising that inventory. `control_port` is carried only as the
    /// opaque key the tracker uses in fetch responses — this crate has no
    /// peer-side control listener, so it is set equal to `upload_port`.
    pub fn bootstrap(
        tracker_host: &str,
        tracker_port: u16,
        advertise_ip: String,
        upload_port: u16,
        store: Arc<PieceStore>,
        repo_dir: PathBuf,
        temp_dir: PathBuf,
    ) -> Result<Self, Error> {
        fs::create_dir_all(&repo_dir)?;
        fs::create_dir_all(&temp_dir)?;

        let mut file_info = FileInfoMap::new();
        for entry in fs::read_dir(&repo_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let info = store.ingest(&entry.path())?;
                if let Some(name) = entry.file_name().to_str() {
                    file_info.insert(name.to_string(), info);
                }
            }
        }

        let mut control = TcpStream::connect((tracker_host, tracker_port))?;
        control.write_all(b"First Connection")?;
        let handshake_line =
            protocol::encode_handshake(&advertise_ip, upload_port, upload_port, &file_info);
        control.write_all(handshake_line.as_bytes())?;

        let ack = protocol::read_frame(&mut control)?;
        if ack.trim() != "Connected" {
            return Err(Error::Tracker(format!("unexpected handshake reply: {}", ack)));
        }

        Ok(Self {
            store,
            repo_dir,
            temp_dir,
            advertise_ip,
            upload_port,
            control: Mutex::new(control),
            file_info: Mutex::new(file_info),
        })
    }

    pub fn advertise_addr(&self) -> (&str, u16) {
        (&self.advertise_ip, self.upload_port)
    }

    fn send_and_read(&self, frame: &str) -> Result<String, Error> {
        let mut stream = self.control.lock().unwrap();
        stream.write_all(frame.as_bytes())?;
        Ok(protocol::read_frame(&mut stream)?)
    }

    pub fn discover(&self) -> Result<Vec<String>, Error> {
        let body = self.send_and_read("discover")?;
        Ok(protocol::parse_discover_response(&body)?)
    }

    /// `close`: the tracker expects no reply and removes this node's
    /// PeerRecord on read, so the control socket is simply dropped after.
    pub fn close(&self) -> Result<(), Error> {
        let mut stream = self.control.lock().unwrap();
        stream.write_all(b"close")?;
        Ok(())
    }

    fn publish(&self, file_info: &FileInfoMap) -> Result<(), Error> {
        let frame = format!("publish {}", serde_json::to_string(file_info).unwrap_or_default());
        let reply = self.send_and_read(&frame)?;
        if reply.trim() != "OK" {
            return Err(Error::Tracker(reply));
        }
        Ok(())
    }

    /// `publish`: rescans `repo_dir` for files dropped in by hand since
    /// startup, ingests any that are new, and republishes the full inventory.
    pub fn publish_current(&self) -> Result<(), Error> {
        let snapshot = {
            let mut file_info = self.file_info.lock().unwrap();
            for entry in fs::read_dir(&self.repo_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if file_info.contains_key(&name) {
                    continue;
                }
                let info = self.store.ingest(&entry.path())?;
                file_info.insert(name, info);
            }
            file_info.clone()
        };
        self.publish(&snapshot)
    }

    /// `piece <filename>`: the piece ids this node locally holds for `filename`.
    pub fn local_pieces(&self, filename: &str) -> Vec<u32> {
        self.store
            .list_pieces_for([filename])
            .remove(filename)
            .unwrap_or_default()
    }

    /// `fetch <f1> ...` with no progress subscriber.
    pub fn fetch(&self, filenames: &[String]) -> Result<FetchOutcome, Error> {
        self.fetch_with_progress(filenames, download::no_op_progress())
    }

    /// `fetch <f1> ...`: P6 (fetch idempotence) is enforced here — filenames
    /// already present locally are dropped before the tracker round trip and
    /// reported back to the caller as already-held.
    pub fn fetch_with_progress(
        &self,
        filenames: &[String],
        progress: mpsc::Sender<ProgressEvent>,
    ) -> Result<FetchOutcome, Error> {
        let already_held: Vec<String> = {
            let info = self.file_info.lock().unwrap();
            filenames.iter().filter(|f| info.contains_key(*f)).cloned().collect()
        };
        let wanted: Vec<String> = filenames
            .iter()
            .filter(|f| !already_held.contains(f))
            .cloned()
            .collect();

        if wanted.is_empty() {
            return Ok(FetchOutcome {
                already_held,
                not_found: Vec::new(),
                downloaded: Vec::new(),
            });
        }

        let frame = format!("fetch {}", wanted.join(" "));
        let body = self.send_and_read(&frame)?;
        let response = FetchResponse::from_str(&body)?;

        if response.not_found.len() == wanted.len() {
            return Ok(FetchOutcome {
                already_held,
                not_found: response.not_found,
                downloaded: Vec::new(),
            });
        }

        let found_filenames: Vec<String> = wanted
            .iter()
            .filter(|f| !response.not_found.contains(f))
            .cloned()
            .collect();

        let mut availability: HashMap<String, Vec<(PeerKey, Vec<u32>)>> = HashMap::new();
        let mut peer_keys: Vec<(String, String, u16)> = response
            .peers
            .values()
            .map(|entry| (entry.peer_ip.clone(), entry.ip_addr.clone(), entry.upload_port))
            .collect();
        peer_keys.sort();
        peer_keys.dedup();

        for (_, ip_addr, upload_port) in &peer_keys {
            let found = match query_peer_inventory(ip_addr, *upload_port, &found_filenames) {
                Ok(found) => found,
                Err(err) => {
                    warn!(peer = %ip_addr, error = %err, "find query failed, skipping peer");
                    continue;
                }
            };
            let peer_key: PeerKey = (ip_addr.clone(), *upload_port);
            for (filename, ids) in found {
                availability.entry(filename).or_default().push((peer_key.clone(), ids));
            }
        }

        let mut combined: Vec<(PeerKey, Vec<String>)> = Vec::new();
        let mut combined_index: HashMap<PeerKey, usize> = HashMap::new();

        for filename in &found_filenames {
            let peer_avail = availability.get(filename).cloned().unwrap_or_default();
            if peer_avail.is_empty() {
                warn!(
                    filename = %filename,
                    "tracker reported a holder but no peer answered find with this file, skipping"
                );
                continue;
            }
            let held = self.store.list_pieces_for([filename.as_str()]);
            let held: std::collections::HashSet<u32> =
                held.get(filename.as_str()).cloned().unwrap_or_default().into_iter().collect();

            let queue = scheduler::schedule(filename, &peer_avail, &held);
            for (peer, names) in queue {
                if names.is_empty() {
                    continue;
                }
                match combined_index.get(&peer) {
                    Some(&idx) => combined[idx].1.extend(names),
                    None => {
                        combined_index.insert(peer.clone(), combined.len());
                        combined.push((peer, names));
                    }
                }
            }
        }

        let downloaded = if combined.is_empty() {
            Vec::new()
        } else {
            download::run(
                &combined,
                &found_filenames,
                &self.temp_dir,
                &self.repo_dir,
                &self.store,
                progress,
            )?
        };

        if !downloaded.is_empty() {
            let mut info = self.file_info.lock().unwrap();
            for (name, file_info) in &downloaded {
                info.insert(name.clone(), *file_info);
            }
            let snapshot = info.clone();
            drop(info);
            self.publish(&snapshot)?;
        }

        Ok(FetchOutcome {
            already_held,
            not_found: response.not_found,
            downloaded,
        })
    }
}

/// Result of a `fetch` dispatch, reported back to the shell for display.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub already_held: Vec<String>,
    pub not_found: Vec<String>,
    pub downloaded: Vec<(String, FileInfo)>,
}

fn query_peer_inventory(
    ip_addr: &str,
    upload_port: u16,
    filenames: &[String],
) -> Result<HashMap<String, Vec<u32>>, Error> {
    let mut stream = TcpStream::connect((ip_addr, upload_port))?;
    let frame = format!("find {}", filenames.join(" "));
    stream.write_all(frame.as_bytes())?;
    let body = protocol::read_frame(&mut stream)?;
    let response = protocol::parse_find_response(&body)?;

    let mut out = HashMap::new();
    for (filename, ids) in response {
        let ids: Vec<u32> = ids.iter().filter_map(|s| s.parse().ok()).collect();
        out.insert(filename, ids);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    /// A bound listener that is never `accept`ed, so any connection attempt
    /// against it would hang rather than fail fast — used to prove a fetch
    /// path never dials out.
    fn unaccepting_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn already_held_filenames_skip_the_tracker_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        // Never accepted, so a stray write/read on `control` would hang
        // instead of silently succeeding.
        let (_listener, port) = unaccepting_listener();
        let control = TcpStream::connect(("127.0.0.1", port)).unwrap();

        let mut file_info = FileInfoMap::new();
        file_info.insert("a.txt".to_string(), FileInfo::for_file_size(10, 524288));

        let store = Arc::new(PieceStore::open(tmp.path().join("pieces")).unwrap());
        let node = Node {
            store,
            repo_dir: tmp.path().join("repo"),
            temp_dir: tmp.path().join("temp"),
            advertise_ip: "127.0.0.1".to_string(),
            upload_port: 0,
            control: Mutex::new(control),
            file_info: Mutex::new(file_info),
        };

        let outcome = node.fetch(&["a.txt".to_string()]).unwrap();
        assert_eq!(outcome.already_held, vec!["a.txt".to_string()]);
        assert!(outcome.not_found.is_empty());
        assert!(outcome.downloaded.is_empty());
    }
}
