use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use torrentd::node::Node;
use torrentd::{peer_server, piece::PieceStore, shell, tracker};

/// A centralized-tracker peer-to-peer file distribution daemon.
#[derive(Parser)]
#[command(name = "torrentd", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the tracker registry.
    Tracker {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8000)]
        port: u16,
        #[arg(long, default_value_t = 128)]
        max_nodes: usize,
        #[arg(long, default_value = "metainfo.json")]
        metainfo_path: PathBuf,
    },
    /// Run a peer node: upload server, download manager, and command shell.
    Node {
        #[arg(long, default_value = "127.0.0.1")]
        tracker_host: String,
        #[arg(long, default_value_t = 8000)]
        tracker_port: u16,
        #[arg(long, default_value = "127.0.0.1")]
        advertise_ip: String,
        #[arg(long, default_value = "repo")]
        repo_dir: PathBuf,
        #[arg(long, default_value = "pieces")]
        pieces_dir: PathBuf,
        #[arg(long, default_value = "temp")]
        temp_dir: PathBuf,
        #[arg(long, default_value_t = torrentd::PIECE_SIZE)]
        piece_size: u64,
    },
}

fn main() {
    torrentd::init_logging();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Tracker { host, port, max_nodes, metainfo_path } => {
            run_tracker(host, port, max_nodes, metainfo_path)
        }
        Command::Node {
            tracker_host,
            tracker_port,
            advertise_ip,
            repo_dir,
            pieces_dir,
            temp_dir,
            piece_size,
        } => run_node(tracker_host, tracker_port, advertise_ip, repo_dir, pieces_dir, temp_dir, piece_size),
    };

    if let Err(err) = result {
        eprintln!("fatal: {}", err);
        std::process::exit(1);
    }
}

fn run_tracker(host: String, port: u16, max_nodes: usize, metainfo_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tracker::bind(&host, port)?;
    let tracker_addr = format!("{}:{}", host, port);
    let registry = tracker::Registry::open(tracker_addr, metainfo_path, max_nodes)?;

    tracker::spawn_acceptor(Arc::clone(&registry), listener);
    shell::run_tracker(registry);
    Ok(())
}

fn run_node(
    tracker_host: String,
    tracker_port: u16,
    advertise_ip: String,
    repo_dir: PathBuf,
    pieces_dir: PathBuf,
    temp_dir: PathBuf,
    piece_size: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(PieceStore::with_piece_size(&pieces_dir, piece_size)?);

    let (listener, upload_port) = peer_server::bind(&advertise_ip)?;
    {
        let store = Arc::clone(&store);
        std::thread::spawn(move || peer_server::serve(listener, store));
    }

    let node = Node::bootstrap(
        &tracker_host,
        tracker_port,
        advertise_ip,
        upload_port,
        store,
        repo_dir,
        temp_dir,
    )?;

    shell::run_node(&node);
    Ok(())
}
