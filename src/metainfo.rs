//! Metainfo: the tracker's durable `filename -> {..., nodes[]}` snapshot.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use crate::protocol::FileInfoMap;

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
            Self::Json(err) => write!(f, "{}", err),
            Self::Malformed(msg) => write!(f, "malformed metainfo: {}", msg),
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

/// One entry of the persisted metainfo map: everything published about a
/// filename, plus the set of `"ip:upload_port"` nodes currently holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetainfoEntry {
    pub file_size: u64,
    pub piece_size: u32,
    pub piece_count: u32,
    pub nodes: BTreeSet<String>,
}

/// The tracker's whole durable view: `tracker_addr` plus one entry per
/// filename known to the swarm.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub tracker_addr: String,
    pub files: HashMap<String, MetainfoEntry>,
}

impl Metainfo {
    pub fn new(tracker_addr: impl Into<String>) -> Self {
        Self {
            tracker_addr: tracker_addr.into(),
            files: HashMap::new(),
        }
    }

    /// Applies the additive-merge rule: new files are inserted with `node`
    /// as their sole holder; files already known only gain `node` in their
    /// `nodes` set (their size/piece metadata is not overwritten by a later
    /// publish).
    pub fn merge_publish(&mut self, node: &str, file_info: &FileInfoMap) {
        for (filename, info) in file_info {
            self.files
                .entry(filename.clone())
                .and_modify(|entry| {
                    entry.nodes.insert(node.to_string());
                })
                .or_insert_with(|| MetainfoEntry {
                    file_size: info.file_size,
                    piece_size: info.piece_size,
                    piece_count: info.piece_count,
                    nodes: [node.to_string()].into_iter().collect(),
                });
        }
    }

    /// Removes `node` from every file's `nodes` set, dropping any file entry
    /// left with no holders (P5).
    pub fn remove_node(&mut self, node: &str) {
        self.files.retain(|_, entry| {
            entry.nodes.remove(node);
            !entry.nodes.is_empty()
        });
    }

    /// Filenames known to the swarm (excludes `tracker_addr`).
    pub fn filenames(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    /// Splits `filenames` into ones Metainfo knows about (with their current
    /// node set) and ones it doesn't (`not_found`).
    pub fn lookup<'a>(
        &self,
        filenames: impl IntoIterator<Item = &'a str>,
    ) -> (HashMap<String, BTreeSet<String>>, Vec<String>) {
        let mut found = HashMap::new();
        let mut not_found = Vec::new();
        for filename in filenames {
            match self.files.get(filename) {
                Some(entry) => {
                    found.insert(filename.to_string(), entry.nodes.clone());
                }
                None => not_found.push(filename.to_string()),
            }
        }
        (found, not_found)
    }

    pub fn to_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("tracker_addr".to_string(), json!(self.tracker_addr));
        for (filename, entry) in &self.files {
            obj.insert(
                filename.clone(),
                json!({
                    "file_size": entry.file_size,
                    "piece_size": entry.piece_size,
                    "piece_count": entry.piece_count,
                    "nodes": entry.nodes.iter().collect::<Vec<_>>(),
                }),
            );
        }
        Value::Object(obj)
    }

    pub fn from_json(value: &Value) -> Result<Self, Error> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::Malformed("metainfo root is not an object".into()))?;

        let tracker_addr = obj
            .get("tracker_addr")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Malformed("missing tracker_addr".into()))?
            .to_string();

        let mut files = HashMap::new();
        for (key, entry) in obj {
            if key == "tracker_addr" {
                continue;
            }
            let entry = entry
                .as_object()
                .ok_or_else(|| Error::Malformed(format!("entry {} is not an object", key)))?;
            let file_size = entry
                .get("file_size")
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::Malformed(format!("{} missing file_size", key)))?;
            let piece_size = entry
                .get("piece_size")
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::Malformed(format!("{} missing piece_size", key)))?
                as u32;
            let piece_count = entry
                .get("piece_count")
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::Malformed(format!("{} missing piece_count", key)))?
                as u32;
            let nodes = entry
                .get("nodes")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();

            files.insert(
                key.clone(),
                MetainfoEntry {
                    file_size,
                    piece_size,
                    piece_count,
                    nodes,
                },
            );
        }

        Ok(Self { tracker_addr, files })
    }

    /// Rewrites the snapshot file with the full current state on every
    /// mutation; there is no partial/append update path.
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let body = serde_json::to_vec_pretty(&self.to_json())?;
        fs::write(path, body)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let body = fs::read(path)?;
        let value: Value = serde_json::from_slice(&body)?;
        Self::from_json(&value)
    }

    pub fn load_or_init(path: &Path, tracker_addr: impl Into<String>) -> Result<Self, Error> {
        if path.exists() {
            Self::load(path)
        } else {
            let info = Self::new(tracker_addr);
            info.save(path)?;
            Ok(info)
        }
    }
}

/// Default location for the snapshot file, relative to the tracker's
/// working directory.
pub fn default_path() -> PathBuf {
    PathBuf::from("metainfo.json")
}
