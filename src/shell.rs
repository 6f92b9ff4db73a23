//! Line-oriented stdin command dispatcher. Binds each shell command straight
//! onto the library calls in [`crate::node`] and [`crate::tracker`]; no
//! business logic lives here.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use crate::node::Node;
use crate::tracker::Registry;

const PING_TIMEOUT_SECS: u64 = 2;

fn prompt(out: &mut impl Write, text: &str) {
    let _ = write!(out, "{}", text);
    let _ = out.flush();
}

/// Runs the tracker-side shell: `list`, `ping <host:port>`, and `exit`.
pub fn run_tracker(registry: Arc<Registry>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        prompt(&mut stdout, "tracker> ");
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("list") => {
                let filenames = registry.list_filenames();
                println!("{} peer(s), {} file(s):", registry.peer_count(), filenames.len());
                for name in filenames {
                    println!("  {}", name);
                }
            }
            Some("ping") => {
                let Some(addr) = parts.next() else {
                    println!("usage: ping <host:port>");
                    continue;
                };
                match addr.rsplit_once(':').and_then(|(host, port)| port.parse::<u16>().ok().map(|port| (host, port))) {
                    Some((host, port)) => {
                        if ping(host, port) {
                            println!("{} is alive", addr);
                        } else {
                            println!("{} is offline", addr);
                        }
                    }
                    None => println!("usage: ping <host:port>"),
                }
            }
            Some("exit") | Some("quit") => {
                registry.notify_shutdown();
                break;
            }
            _ => println!("unknown command: {}", line),
        }
    }
}

/// Runs the node-side shell: `fetch`, `publish`, `discover`, `close`, `piece`, `exit`.
pub fn run_node(node: &Node) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        prompt(&mut stdout, "node> ");
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("fetch") => {
                let filenames: Vec<String> = parts.map(String::from).collect();
                if filenames.is_empty() {
                    println!("usage: fetch <file> [file...]");
                    continue;
                }
                match node.fetch(&filenames) {
                    Ok(outcome) => {
                        for name in &outcome.already_held {
                            println!("already have {}", name);
                        }
                        for name in &outcome.not_found {
                            println!("warning: {} not found on tracker", name);
                        }
                        for (name, info) in &outcome.downloaded {
                            println!("fetched {} ({} bytes, {} pieces)", name, info.file_size, info.piece_count);
                        }
                    }
                    Err(err) => println!("fetch failed: {}", err),
                }
            }
            Some("publish") => match node.publish_current() {
                Ok(()) => println!("published"),
                Err(err) => println!("publish failed: {}", err),
            },
            Some("discover") => match node.discover() {
                Ok(filenames) => {
                    for name in filenames {
                        println!("  {}", name);
                    }
                }
                Err(err) => println!("discover failed: {}", err),
            },
            Some("piece") => {
                let Some(filename) = parts.next() else {
                    println!("usage: piece <file>");
                    continue;
                };
                let ids = node.local_pieces(filename);
                println!("{}: {:?}", filename, ids);
            }
            Some("close") | Some("exit") | Some("quit") => {
                if let Err(err) = node.close() {
                    println!("close failed: {}", err);
                }
                break;
            }
            _ => println!("unknown command: {}", line),
        }
    }
}

/// `ping <host:port>`: tracker-shell-only reachability probe, implemented as
/// a bare TCP connect against the peer's control port rather than a round
/// trip over its (persistent, single-reader) tracker control connection.
pub fn ping(host: &str, port: u16) -> bool {
    use std::net::{TcpStream, ToSocketAddrs};
    use std::time::Duration;

    let addr = match (host, port).to_socket_addrs().ok().and_then(|mut i| i.next()) {
        Some(addr) => addr,
        None => return false,
    };
    TcpStream::connect_timeout(&addr, Duration::from_secs(PING_TIMEOUT_SECS)).is_ok()
}
