//! Tracker Registry: accepts peer registrations, answers fetch/discover,
//! and keeps the Metainfo snapshot file in sync.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{self, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::metainfo::Metainfo;
use crate::protocol::{self, ControlVerb, FetchPeerEntry, FetchResponse, FileInfoMap};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Metainfo(crate::metainfo::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{}", err),
            Self::Metainfo(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<crate::metainfo::Error> for Error {
    fn from(value: crate::metainfo::Error) -> Self {
        Self::Metainfo(value)
    }
}

/// Keys the live peer map by `(ip, control_port)`, the address the tracker
/// accepted the registration connection from.
type PeerMapKey = (String, u16);

/// A registered peer's control connection, guarded by a single lock so that
/// the handler's reads and any shell-initiated write share one ordering.
struct PeerRecord {
    ip: String,
    control_port: u16,
    upload_port: u16,
    file_info: Mutex<FileInfoMap>,
    conn: Mutex<TcpStream>,
}

impl PeerRecord {
    fn node_key(&self) -> String {
        format!("{}:{}", self.ip, self.upload_port)
    }
}

/// Shared tracker state: the live peer map and the durable Metainfo snapshot.
pub struct Registry {
    tracker_addr: String,
    metainfo_path: PathBuf,
    max_nodes: usize,
    metainfo: Mutex<Metainfo>,
    peers: Mutex<HashMap<PeerMapKey, Arc<PeerRecord>>>,
}

impl Registry {
    pub fn open(
        tracker_addr: impl Into<String>,
        metainfo_path: PathBuf,
        max_nodes: usize,
    ) -> Result<Arc<Self>, Error> {
        let tracker_addr = tracker_addr.into();
        let metainfo = Metainfo::load_or_init(&metainfo_path, tracker_addr.clone())?;
        Ok(Arc::new(Self {
            tracker_addr,
            metainfo_path,
            max_nodes,
            metainfo: Mutex::new(metainfo),
            peers: Mutex::new(HashMap::new()),
        }))
    }

    /// Whether another peer can currently register (`--max-nodes`).
    pub fn has_capacity(&self) -> bool {
        self.peers.lock().unwrap().len() < self.max_nodes
    }

    /// Filenames currently known to the swarm — the tracker-shell `list` command.
    pub fn list_filenames(&self) -> Vec<String> {
        self.metainfo.lock().unwrap().filenames()
    }

    /// Live peer count, reported by the tracker-shell `list` command alongside filenames.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    fn persist(&self, metainfo: &Metainfo) {
        if let Err(err) = metainfo.save(&self.metainfo_path) {
            tracing::error!(error = %err, "failed to persist metainfo snapshot");
        }
    }

    fn register_peer(
        &self,
        ip: &str,
        control_port: u16,
        upload_port: u16,
        file_info: FileInfoMap,
        stream: TcpStream,
    ) -> Arc<PeerRecord> {
        let record = Arc::new(PeerRecord {
            ip: ip.to_string(),
            control_port,
            upload_port,
            file_info: Mutex::new(file_info),
            conn: Mutex::new(stream),
        });

        {
            let mut metainfo = self.metainfo.lock().unwrap();
            metainfo.merge_publish(&record.node_key(), &record.file_info.lock().unwrap());
            self.persist(&metainfo);
        }

        self.peers
            .lock()
            .unwrap()
            .insert((ip.to_string(), control_port), Arc::clone(&record));
        record
    }

    /// Replaces `record`'s own inventory wholesale and additively merges it
    /// into Metainfo: republishing does not remove pieces a node no longer
    /// lists, only adds to what the swarm knows it holds.
    fn handle_publish(&self, record: &PeerRecord, file_info: FileInfoMap) {
        *record.file_info.lock().unwrap() = file_info;
        let mut metainfo = self.metainfo.lock().unwrap();
        metainfo.merge_publish(&record.node_key(), &record.file_info.lock().unwrap());
        self.persist(&metainfo);
    }

    fn handle_fetch(&self, filenames: &[String]) -> FetchResponse {
        let (found, not_found) = {
            let metainfo = self.metainfo.lock().unwrap();
            metainfo.lookup(filenames.iter().map(String::as_str))
        };

        let mut holder_nodes: HashSet<String> = HashSet::new();
        for nodes in found.values() {
            holder_nodes.extend(nodes.iter().cloned());
        }

        let mut peers_out = HashMap::new();
        for record in self.peers.lock().unwrap().values() {
            if holder_nodes.contains(&record.node_key()) {
                let key = format!("{}:{}", record.ip, record.control_port);
                peers_out.insert(
                    key.clone(),
                    FetchPeerEntry {
                        peer_ip: key,
                        ip_addr: record.ip.clone(),
                        upload_port: record.upload_port,
                    },
                );
            }
        }

        FetchResponse {
            peers: peers_out,
            tracker_ip: self.tracker_addr.clone(),
            not_found,
        }
    }

    fn remove_peer(&self, key: &PeerMapKey) {
        let record = self.peers.lock().unwrap().remove(key);
        let Some(record) = record else { return };

        let mut metainfo = self.metainfo.lock().unwrap();
        metainfo.remove_node(&record.node_key());
        self.persist(&metainfo);
    }

    /// Best-effort `tracker close` notification to every live peer, sent
    /// before the tracker process exits.
    pub fn notify_shutdown(&self) {
        let records: Vec<Arc<PeerRecord>> = self.peers.lock().unwrap().values().cloned().collect();
        for record in records {
            let mut guard = record.conn.lock().unwrap();
            let _ = guard.set_write_timeout(Some(CLOSE_NOTIFY_TIMEOUT));
            let _ = guard.write_all(b"tracker close");
        }
    }
}

/// Binds the tracker's listening socket. `std` does not expose `SO_REUSEADDR`
/// without an extra crate, so a tracker restart may briefly hit
/// `AddrInUse` — an accepted limitation rather than a new dependency.
pub fn bind(host: &str, port: u16) -> io::Result<TcpListener> {
    TcpListener::bind((host, port))
}

/// Spawns the acceptor thread: one `std::thread::spawn` per incoming
/// connection, matching the teacher's thread-per-connection style.
pub fn spawn_acceptor(registry: Arc<Registry>, listener: TcpListener) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        info!(addr = %registry.tracker_addr, "tracker listening");
        for incoming in listener.incoming() {
            match incoming {
                Ok(stream) => {
                    let registry = Arc::clone(&registry);
                    thread::spawn(move || handle_connection(registry, stream));
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }
    })
}

fn handle_connection(registry: Arc<Registry>, mut stream: TcpStream) {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());

    if stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).is_err() {
        warn!(peer = %peer_addr, "failed to set handshake timeout");
        return;
    }

    match protocol::read_frame(&mut stream) {
        Ok(greeting) if greeting.trim() == "First Connection" => {}
        Ok(other) => {
            warn!(peer = %peer_addr, frame = %other, "expected handshake greeting");
            return;
        }
        Err(err) => {
            warn!(peer = %peer_addr, error = %err, "handshake greeting read failed");
            return;
        }
    }

    let handshake = match protocol::read_frame(&mut stream) {
        Ok(line) => match protocol::parse_handshake(&line) {
            Ok(h) => h,
            Err(err) => {
                warn!(peer = %peer_addr, error = %err, "malformed handshake");
                return;
            }
        },
        Err(err) => {
            warn!(peer = %peer_addr, error = %err, "handshake read failed");
            return;
        }
    };

    if stream.set_read_timeout(None).is_err() {
        warn!(peer = %peer_addr, "failed to clear handshake timeout");
        return;
    }

    if !registry.has_capacity() {
        warn!(peer = %peer_addr, "rejecting registration: tracker at max-nodes capacity");
        let _ = stream.write_all(b"error: tracker full");
        return;
    }

    if stream.write_all(b"Connected").is_err() {
        warn!(peer = %peer_addr, "failed to ack handshake");
        return;
    }

    let key: PeerMapKey = (handshake.ip.clone(), handshake.control_port);
    let record = registry.register_peer(
        &handshake.ip,
        handshake.control_port,
        handshake.upload_port,
        handshake.file_info,
        stream,
    );
    info!(
        peer = %peer_addr,
        ip = %handshake.ip,
        control_port = handshake.control_port,
        "peer registered"
    );

    loop {
        let frame = {
            let mut guard = record.conn.lock().unwrap();
            protocol::read_frame(&mut guard)
        };

        let frame = match frame {
            Ok(f) if f.is_empty() => {
                debug!(peer = %peer_addr, "peer connection closed");
                break;
            }
            Ok(f) => f,
            Err(err) => {
                warn!(peer = %peer_addr, error = %err, "control read failed");
                break;
            }
        };

        match protocol::parse_control_verb(&frame) {
            ControlVerb::Fetch(filenames) => {
                let response = registry.handle_fetch(&filenames);
                let mut guard = record.conn.lock().unwrap();
                let _ = guard.write_all(response.to_string().as_bytes());
            }
            ControlVerb::Publish(file_info) => {
                registry.handle_publish(&record, file_info);
                let mut guard = record.conn.lock().unwrap();
                let _ = guard.write_all(b"OK");
            }
            ControlVerb::Discover => {
                let body = protocol::encode_discover_response(&registry.list_filenames());
                let mut guard = record.conn.lock().unwrap();
                let _ = guard.write_all(body.as_bytes());
            }
            ControlVerb::Close => {
                debug!(peer = %peer_addr, "peer requested close");
                break;
            }
            ControlVerb::Unknown(raw) => {
                warn!(peer = %peer_addr, frame = %raw, "unknown control verb");
                let mut guard = record.conn.lock().unwrap();
                let _ = guard.write_all(b"error: unknown verb");
            }
        }
    }

    registry.remove_peer(&key);
    info!(peer = %peer_addr, "peer removed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::FileInfo;

    fn file_info(size: u64) -> FileInfo {
        FileInfo::for_file_size(size, 524288)
    }

    #[test]
    fn register_then_fetch_reports_holder() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("metainfo.json");
        let registry = Registry::open("127.0.0.1:8000", path, 128).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let dummy = TcpStream::connect(addr).unwrap();
        let _accepted = listener.accept().unwrap();

        let mut info = FileInfoMap::new();
        info.insert("a.txt".to_string(), file_info(10));
        registry.register_peer("127.0.0.1", 9001, 9002, info, dummy);

        let response = registry.handle_fetch(&["a.txt".to_string()]);
        assert!(response.peers.contains_key("127.0.0.1:9001"));
        assert!(response.not_found.is_empty());
    }

    #[test]
    fn fetch_reports_not_found_for_unknown_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("metainfo.json");
        let registry = Registry::open("127.0.0.1:8000", path, 128).unwrap();

        let response = registry.handle_fetch(&["ghost.txt".to_string()]);
        assert_eq!(response.not_found, vec!["ghost.txt".to_string()]);
        assert!(response.peers.is_empty());
    }

    #[test]
    fn remove_peer_purges_metainfo_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("metainfo.json");
        let registry = Registry::open("127.0.0.1:8000", path, 128).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let dummy = TcpStream::connect(addr).unwrap();
        let _accepted = listener.accept().unwrap();

        let mut info = FileInfoMap::new();
        info.insert("a.txt".to_string(), file_info(10));
        registry.register_peer("127.0.0.1", 9001, 9002, info, dummy);

        registry.remove_peer(&("127.0.0.1".to_string(), 9001));

        assert!(registry.list_filenames().is_empty());
    }
}
