//! Peer Server: answers `find`/`request` from other peers over the piece
//! store.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use threadpool::ThreadPool;
use tracing::{debug, warn};

use crate::piece::PieceStore;
use crate::protocol::{self, PeerVerb};

const MAX_INBOUND_CONNECTIONS: usize = 32;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Binds an OS-chosen port on `advertise_ip` and returns the listener plus
/// the port a caller should publish as `upload_port`.
pub fn bind(advertise_ip: &str) -> Result<(TcpListener, u16), Error> {
    let listener = TcpListener::bind((advertise_ip, 0))?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

/// Runs the accept loop on the calling thread, handing each connection to a
/// bounded `threadpool` worker rather than an unbounded `thread::spawn` per
/// connection, capping concurrent inbound upload-serving threads.
pub fn serve(listener: TcpListener, store: Arc<PieceStore>) {
    let pool = ThreadPool::new(MAX_INBOUND_CONNECTIONS);
    for incoming in listener.incoming() {
        match incoming {
            Ok(stream) => {
                let store = Arc::clone(&store);
                pool.execute(move || handle_connection(stream, &store));
            }
            Err(err) => warn!(error = %err, "peer server accept failed"),
        }
    }
}

fn handle_connection(mut stream: TcpStream, store: &PieceStore) {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());

    let frame = match protocol::read_frame(&mut stream) {
        Ok(f) => f,
        Err(err) => {
            warn!(peer = %peer_addr, error = %err, "failed to read request");
            return;
        }
    };

    match protocol::parse_peer_verb(&frame) {
        PeerVerb::Find(filenames) => {
            let borrowed: Vec<&str> = filenames.iter().map(String::as_str).collect();
            let pieces: HashMap<String, Vec<u32>> = store.list_pieces_for(borrowed);
            let body = protocol::encode_find_response(&pieces);
            if let Err(err) = stream.write_all(body.as_bytes()) {
                warn!(peer = %peer_addr, error = %err, "failed to send find response");
            }
            debug!(peer = %peer_addr, filenames = ?filenames, "served find");
        }
        PeerVerb::Request(piece_name) => match store.read_piece(&piece_name) {
            Ok(bytes) => {
                if let Err(err) = stream.write_all(&bytes) {
                    warn!(peer = %peer_addr, piece = %piece_name, error = %err, "failed to stream piece");
                } else {
                    debug!(peer = %peer_addr, piece = %piece_name, bytes = bytes.len(), "served request");
                }
            }
            Err(err) => {
                warn!(peer = %peer_addr, piece = %piece_name, error = %err, "requested piece missing");
            }
        },
        PeerVerb::Unknown => {
            debug!(peer = %peer_addr, frame = %frame, "unknown verb, closing");
        }
    }
}
