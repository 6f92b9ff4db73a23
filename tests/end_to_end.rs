//! Drives a real tracker and real peer nodes over loopback TCP, exercising
//! registration, fetch/publish, and peer departure end to end.

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use torrentd::node::Node;
use torrentd::piece::PieceStore;
use torrentd::tracker::{self, Registry};
use torrentd::{peer_server, PIECE_SIZE};

fn start_tracker(dir: &std::path::Path) -> (Arc<Registry>, String, u16) {
    let listener = tracker::bind("127.0.0.1", 0).unwrap();
    let port = listener.local_addr().unwrap().port();
    let registry = Registry::open(
        format!("127.0.0.1:{}", port),
        dir.join("metainfo.json"),
        128,
    )
    .unwrap();
    tracker::spawn_acceptor(Arc::clone(&registry), listener);
    (registry, "127.0.0.1".to_string(), port)
}

fn start_peer(base: &std::path::Path, tracker_host: &str, tracker_port: u16) -> Node {
    let store = Arc::new(PieceStore::open(base.join("pieces")).unwrap());
    let (listener, upload_port) = peer_server::bind("127.0.0.1").unwrap();
    {
        let store = Arc::clone(&store);
        thread::spawn(move || peer_server::serve(listener, store));
    }

    Node::bootstrap(
        tracker_host,
        tracker_port,
        "127.0.0.1".to_string(),
        upload_port,
        store,
        base.join("repo"),
        base.join("temp"),
    )
    .unwrap()
}

#[test]
fn single_source_file_round_trips_to_a_second_peer() {
    let tmp = tempfile::tempdir().unwrap();
    let (_registry, tracker_host, tracker_port) = start_tracker(tmp.path());

    let a_base = tmp.path().join("a");
    fs::create_dir_all(a_base.join("repo")).unwrap();
    let data = vec![9u8; (PIECE_SIZE as usize) + 1024];
    fs::write(a_base.join("repo").join("1MB.txt"), &data).unwrap();
    let node_a = start_peer(&a_base, &tracker_host, tracker_port);

    let b_base = tmp.path().join("b");
    let node_b = start_peer(&b_base, &tracker_host, tracker_port);

    thread::sleep(Duration::from_millis(100));

    let outcome = node_b.fetch(&["1MB.txt".to_string()]).unwrap();
    assert!(outcome.not_found.is_empty());
    assert_eq!(outcome.downloaded[0].0, "1MB.txt");

    let received = fs::read(b_base.join("repo").join("1MB.txt")).unwrap();
    assert_eq!(received, data);

    let discovered = node_b.discover().unwrap();
    assert!(discovered.contains(&"1MB.txt".to_string()));

    node_a.close().unwrap();
    node_b.close().unwrap();
}

#[test]
fn fetching_an_unpublished_file_reports_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let (_registry, tracker_host, tracker_port) = start_tracker(tmp.path());

    let base = tmp.path().join("solo");
    let node = start_peer(&base, &tracker_host, tracker_port);

    let outcome = node.fetch(&["ghost.txt".to_string()]).unwrap();
    assert_eq!(outcome.not_found, vec!["ghost.txt".to_string()]);
    assert!(outcome.downloaded.is_empty());

    node.close().unwrap();
}

#[test]
fn peer_disconnect_purges_its_files_from_discover() {
    let tmp = tempfile::tempdir().unwrap();
    let (registry, tracker_host, tracker_port) = start_tracker(tmp.path());

    let a_base = tmp.path().join("a");
    fs::create_dir_all(a_base.join("repo")).unwrap();
    fs::write(a_base.join("repo").join("solo.txt"), b"hello").unwrap();
    let node_a = start_peer(&a_base, &tracker_host, tracker_port);

    thread::sleep(Duration::from_millis(50));
    assert!(registry.list_filenames().contains(&"solo.txt".to_string()));

    node_a.close().unwrap();
    thread::sleep(Duration::from_millis(100));

    assert!(!registry.list_filenames().contains(&"solo.txt".to_string()));
}
