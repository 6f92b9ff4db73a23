//! Wire protocol: the ASCII verb frames and JSON payloads shared by the
//! Tracker Registry and the Peer Server.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::net::TcpStream;

use serde_json::{json, Value};

use crate::piece::FileInfo;

/// Frames are bounded at 1024 bytes, except piece-body transfers which are
/// streamed separately.
pub const FRAME_LIMIT: usize = 1024;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Json(serde_json::Error),
    Malformed(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{}", err),
            Self::Json(err) => write!(f, "malformed JSON: {}", err),
            Self::Malformed(msg) => write!(f, "malformed frame: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// Reads one frame (at most [`FRAME_LIMIT`] bytes) in a single `read` call,
/// mirroring the original's `recv(1024)`: no loop-until-delimiter, since
/// every request fits in one TCP segment by construction.
pub fn read_frame(stream: &mut TcpStream) -> Result<String, Error> {
    let mut buf = [0u8; FRAME_LIMIT];
    let n = stream.read(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf[..n]).to_string())
}

/// `filename -> FileInfo`, the JSON tail of the handshake and the body of
/// `publish`.
pub type FileInfoMap = HashMap<String, FileInfo>;

/// The four whitespace-delimited fields plus JSON tail of `First Connection`'s
/// follow-up message: `<ip> <cport> <uport> <file_info_json>`.
pub struct Handshake {
    pub ip: String,
    pub control_port: u16,
    pub upload_port: u16,
    pub file_info: FileInfoMap,
}

pub fn parse_handshake(line: &str) -> Result<Handshake, Error> {
    let mut parts = line.trim().splitn(4, char::is_whitespace);
    let ip = parts
        .next()
        .ok_or_else(|| Error::Malformed("missing ip".into()))?
        .to_string();
    let control_port: u16 = parts
        .next()
        .ok_or_else(|| Error::Malformed("missing control_port".into()))?
        .parse()
        .map_err(|_| Error::Malformed("invalid control_port".into()))?;
    let upload_port: u16 = parts
        .next()
        .ok_or_else(|| Error::Malformed("missing upload_port".into()))?
        .parse()
        .map_err(|_| Error::Malformed("invalid upload_port".into()))?;
    let json_tail = parts
        .next()
        .ok_or_else(|| Error::Malformed("missing file_info".into()))?;
    let file_info: FileInfoMap = serde_json::from_str(json_tail)?;

    Ok(Handshake {
        ip,
        control_port,
        upload_port,
        file_info,
    })
}

pub fn encode_handshake(ip: &str, control_port: u16, upload_port: u16, file_info: &FileInfoMap) -> String {
    format!(
        "{} {} {} {}",
        ip,
        control_port,
        upload_port,
        serde_json::to_string(file_info).unwrap_or_default()
    )
}

/// Tracker control verbs, parsed from a frame following the handshake.
pub enum ControlVerb {
    Fetch(Vec<String>),
    Publish(FileInfoMap),
    Discover,
    Close,
    Unknown(String),
}

pub fn parse_control_verb(line: &str) -> ControlVerb {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((v, r)) => (v, r.trim()),
        None => (line, ""),
    };

    match verb {
        "fetch" => ControlVerb::Fetch(rest.split_whitespace().map(String::from).collect()),
        "publish" => match serde_json::from_str::<FileInfoMap>(rest) {
            Ok(map) => ControlVerb::Publish(map),
            Err(_) => ControlVerb::Unknown(line.to_string()),
        },
        "discover" => ControlVerb::Discover,
        "close" => ControlVerb::Close,
        _ => ControlVerb::Unknown(line.to_string()),
    }
}

/// Peer-server verbs: `find <f1> ...` and `request <piece_filename>`.
pub enum PeerVerb {
    Find(Vec<String>),
    Request(String),
    Unknown,
}

pub fn parse_peer_verb(line: &str) -> PeerVerb {
    let line = line.trim();
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("find") => {
            let files: Vec<String> = parts.map(String::from).collect();
            if files.is_empty() {
                PeerVerb::Unknown
            } else {
                PeerVerb::Find(files)
            }
        }
        Some("request") => match parts.next() {
            Some(name) => PeerVerb::Request(name.to_string()),
            None => PeerVerb::Unknown,
        },
        _ => PeerVerb::Unknown,
    }
}

/// `find` response: `{filename: [piece_id_str, ...]}`.
pub fn encode_find_response(pieces: &HashMap<String, Vec<u32>>) -> String {
    let as_strings: HashMap<&String, Vec<String>> = pieces
        .iter()
        .map(|(name, ids)| (name, ids.iter().map(|id| id.to_string()).collect()))
        .collect();
    serde_json::to_string(&as_strings).unwrap_or_default()
}

pub fn parse_find_response(body: &str) -> Result<HashMap<String, Vec<String>>, Error> {
    Ok(serde_json::from_str(body)?)
}

/// One peer entry inside a `fetch` response: the control-connection key maps
/// to where to dial for the upload (piece-serving) connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPeerEntry {
    pub peer_ip: String,
    pub ip_addr: String,
    pub upload_port: u16,
}

/// The `fetch` response is a flat JSON object mixing per-peer entries with
/// two reserved keys (`tracker_ip`, `not_found`), so it's encoded/decoded by
/// hand against `serde_json::Value` rather than derived.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    /// Keyed by `"ip:control_port"`.
    pub peers: HashMap<String, FetchPeerEntry>,
    pub tracker_ip: String,
    pub not_found: Vec<String>,
}

impl FetchResponse {
    pub fn to_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        for (key, entry) in &self.peers {
            obj.insert(
                key.clone(),
                json!({
                    "peer_ip": entry.peer_ip,
                    "ip_addr": entry.ip_addr,
                    "upload_port": entry.upload_port,
                }),
            );
        }
        obj.insert("tracker_ip".to_string(), json!(self.tracker_ip));
        obj.insert("not_found".to_string(), json!(self.not_found));
        Value::Object(obj)
    }

    pub fn to_string(&self) -> String {
        self.to_json().to_string()
    }

    pub fn from_str(body: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(body)?;
        let obj = value
            .as_object()
            .ok_or_else(|| Error::Malformed("fetch response is not an object".into()))?;

        let tracker_ip = obj
            .get("tracker_ip")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let not_found = obj
            .get("not_found")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let mut peers = HashMap::new();
        for (key, entry) in obj {
            if key == "tracker_ip" || key == "not_found" {
                continue;
            }
            let Some(entry) = entry.as_object() else {
                continue;
            };
            let peer_ip = entry
                .get("peer_ip")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let ip_addr = entry
                .get("ip_addr")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let upload_port = entry
                .get("upload_port")
                .and_then(Value::as_u64)
                .unwrap_or_default() as u16;
            peers.insert(
                key.clone(),
                FetchPeerEntry {
                    peer_ip,
                    ip_addr,
                    upload_port,
                },
            );
        }

        Ok(Self {
            peers,
            tracker_ip,
            not_found,
        })
    }
}

/// `discover` response: a JSON array of filenames.
pub fn encode_discover_response(filenames: &[String]) -> String {
    serde_json::to_string(filenames).unwrap_or_default()
}

pub fn parse_discover_response(body: &str) -> Result<Vec<String>, Error> {
    Ok(serde_json::from_str(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let mut file_info = FileInfoMap::new();
        file_info.insert(
            "a.txt".to_string(),
            FileInfo {
                file_size: 10,
                piece_size: 524288,
                piece_count: 1,
            },
        );
        let line = encode_handshake("127.0.0.1", 5000, 5001, &file_info);
        let parsed = parse_handshake(&line).unwrap();
        assert_eq!(parsed.ip, "127.0.0.1");
        assert_eq!(parsed.control_port, 5000);
        assert_eq!(parsed.upload_port, 5001);
        assert_eq!(parsed.file_info, file_info);
    }

    #[test]
    fn fetch_response_round_trips() {
        let mut peers = HashMap::new();
        peers.insert(
            "127.0.0.1:6000".to_string(),
            FetchPeerEntry {
                peer_ip: "127.0.0.1:6000".to_string(),
                ip_addr: "127.0.0.1".to_string(),
                upload_port: 6001,
            },
        );
        let response = FetchResponse {
            peers,
            tracker_ip: "127.0.0.1:8000".to_string(),
            not_found: vec!["ghost.txt".to_string()],
        };

        let parsed = FetchResponse::from_str(&response.to_string()).unwrap();
        assert_eq!(parsed.tracker_ip, response.tracker_ip);
        assert_eq!(parsed.not_found, response.not_found);
        assert_eq!(parsed.peers, response.peers);
    }

    #[test]
    fn parse_control_verb_recognizes_fetch() {
        match parse_control_verb("fetch a.txt b.txt") {
            ControlVerb::Fetch(files) => assert_eq!(files, vec!["a.txt", "b.txt"]),
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn parse_peer_verb_recognizes_request() {
        match parse_peer_verb("request 1MB_0.txt") {
            PeerVerb::Request(name) => assert_eq!(name, "1MB_0.txt"),
            _ => panic!("expected request"),
        }
    }
}
