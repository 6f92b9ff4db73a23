pub mod piece;
pub mod protocol;
pub mod scheduler;
pub mod metainfo;
pub mod tracker;
pub mod peer_server;
pub mod download;
pub mod node;
pub mod shell;

/// Default piece size used when slicing files into pieces: 512 KiB.
pub const PIECE_SIZE: u64 = 524288;

/// Initializes the process-wide `tracing` subscriber from `RUST_LOG`,
/// defaulting to `info` when the variable is unset or invalid.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
