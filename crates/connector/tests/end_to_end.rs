//! End-to-end tests for the share connector.
//!
//! A real server runs on a temporary socket over a local backend root, and
//! each test drives it with the client role:
//! - Reachability and folder management
//! - Paged listings
//! - Upload and ranged download
//! - Error statuses and recovery between clients

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use connector::backend::LocalConnector;
use connector::client;
use connector::config::Config;
use connector::processor::is_upload_marker;
use connector::{ExchangeOutcome, Server};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const ENOENT: i32 = 2;
const ENOTEMPTY: i32 = 39;

struct Fixture {
    dir: TempDir,
    config: Config,
    shutdown: CancellationToken,
    server: JoinHandle<anyhow::Result<()>>,
}

impl Fixture {
    /// Start a server with small buffers so transfers span many packets.
    async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.connector.socket_path = dir.path().join("run").join("connector.sock");
        config.backend.root = dir.path().join("shares");
        config.buffers.queue_size = 3;
        config.buffers.unix_sock_buffer = 1024;
        config.buffers.backend_read_buffer = 4096;
        config.buffers.backend_write_buffer = 1000;
        std::fs::create_dir_all(config.backend.root.join("srv/share")).unwrap();

        let connector = Arc::new(LocalConnector::new(&config.backend.root));
        let server = Server::bind(&config, connector).await.unwrap();
        let shutdown = server.shutdown_token();
        let server = tokio::spawn(server.run());

        Self {
            dir,
            config,
            shutdown,
            server,
        }
    }

    fn share(&self, relative: &str) -> std::path::PathBuf {
        self.config.backend.root.join("srv/share").join(relative)
    }

    fn write(&self, relative: &str, contents: &[u8]) {
        let path = self.share(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    async fn run(&self, op_code: u8, url: &str, tweak: impl FnOnce(&mut Config)) -> ExchangeOutcome {
        let mut config = self.config.clone();
        config.request.op_code = op_code;
        config.request.url = url.to_string();
        tweak(&mut config);
        tokio::time::timeout(Duration::from_secs(30), client::run(&config))
            .await
            .expect("exchange timed out")
            .unwrap()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.server.await.unwrap().unwrap();
        assert!(!self.config.connector.socket_path.exists());
    }
}

fn entries(outcome: &ExchangeOutcome) -> Vec<String> {
    match outcome {
        ExchangeOutcome::Completed { entries, .. } => {
            let mut names: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
            names.sort();
            names
        }
        other => panic!("exchange failed: {}", other),
    }
}

fn bytes(outcome: &ExchangeOutcome) -> u64 {
    match outcome {
        ExchangeOutcome::Completed { bytes, .. } => *bytes,
        other => panic!("exchange failed: {}", other),
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// =============================================================================
// Reachability and folders
// =============================================================================

#[tokio::test]
async fn test_connection_to_share() {
    let fixture = Fixture::start().await;

    let outcome = fixture.run(6, "smb://srv/share", |_| {}).await;
    assert!(outcome.is_success());
    assert_eq!(entries(&outcome), vec!["share"]);

    let outcome = fixture.run(6, "srv/missing", |_| {}).await;
    assert_eq!(outcome.code(), ENOENT);

    fixture.stop().await;
}

#[tokio::test]
async fn test_add_folder_then_delete_tree() {
    let fixture = Fixture::start().await;

    let outcome = fixture.run(4, "srv/share/docs", |_| {}).await;
    assert_eq!(entries(&outcome), vec!["docs"]);
    assert!(fixture.share("docs").is_dir());

    fixture.write("docs/a.txt", b"a");
    fixture.write("docs/nested/b.txt", b"b");

    let outcome = fixture.run(5, "srv/share/docs", |_| {}).await;
    match &outcome {
        ExchangeOutcome::Completed { entries, .. } => assert!(entries[0].is_directory),
        other => panic!("delete failed: {}", other),
    }
    assert!(!fixture.share("docs").exists());

    fixture.stop().await;
}

// =============================================================================
// Listing
// =============================================================================

#[tokio::test]
async fn test_list_pages_and_filters() {
    let fixture = Fixture::start().await;
    for name in ["a.txt", "b.txt", "c.txt", ".hidden", ".1234abcd.connector-tmp"] {
        fixture.write(name, b"x");
    }
    std::fs::create_dir_all(fixture.share("folder")).unwrap();

    let outcome = fixture
        .run(1, "srv/share", |c| c.request.page_size = 2)
        .await;
    let names = entries(&outcome);
    assert_eq!(names, vec![".hidden", "a.txt", "b.txt", "c.txt", "folder"]);
    assert!(!names.iter().any(|n| is_upload_marker(n)));

    let outcome = fixture
        .run(1, "srv/share", |c| {
            c.request.show_hidden_files = false;
            c.request.show_only_folders = true;
        })
        .await;
    assert_eq!(entries(&outcome), vec!["folder"]);

    fixture.stop().await;
}

#[tokio::test]
async fn test_list_server_shares() {
    let fixture = Fixture::start().await;
    std::fs::create_dir_all(fixture.config.backend.root.join("srv/other")).unwrap();

    let outcome = fixture.run(1, "smb://srv", |_| {}).await;
    assert_eq!(entries(&outcome), vec!["other", "share"]);

    fixture.stop().await;
}

// =============================================================================
// Transfers
// =============================================================================

#[tokio::test]
async fn test_upload_then_download() {
    let fixture = Fixture::start().await;
    let contents = pattern(20_000);
    let source = fixture.dir.path().join("source.bin");
    std::fs::write(&source, &contents).unwrap();

    let outcome = fixture
        .run(3, "srv/share/incoming/data.bin", |c| {
            c.request.input_file = source.clone();
        })
        .await;
    assert_eq!(bytes(&outcome), contents.len() as u64);
    assert_eq!(std::fs::read(fixture.share("incoming/data.bin")).unwrap(), contents);
    let leftovers: Vec<_> = std::fs::read_dir(fixture.share("incoming"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| is_upload_marker(&e.file_name().to_string_lossy()))
        .collect();
    assert!(leftovers.is_empty());

    let output = fixture.dir.path().join("copy.bin");
    let outcome = fixture
        .run(2, "srv/share/incoming/data.bin", |c| {
            c.request.output_file = output.clone();
        })
        .await;
    assert_eq!(bytes(&outcome), contents.len() as u64);
    assert_eq!(std::fs::read(&output).unwrap(), contents);

    fixture.stop().await;
}

#[tokio::test]
async fn test_ranged_download() {
    let fixture = Fixture::start().await;
    let contents = pattern(100);
    fixture.write("hundred.bin", &contents);

    let output = fixture.dir.path().join("range.bin");
    let outcome = fixture
        .run(2, "srv/share/hundred.bin", |c| {
            c.request.start_offset = 10;
            c.request.end_offset = 19;
            c.request.output_file = output.clone();
        })
        .await;
    assert_eq!(bytes(&outcome), 10);
    assert_eq!(std::fs::read(&output).unwrap(), &contents[10..20]);

    fixture.stop().await;
}

#[tokio::test]
async fn test_empty_file_download() {
    let fixture = Fixture::start().await;
    fixture.write("empty.bin", b"");

    let output = fixture.dir.path().join("empty.out");
    let outcome = fixture
        .run(2, "srv/share/empty.bin", |c| c.request.output_file = output.clone())
        .await;
    assert_eq!(bytes(&outcome), 0);
    assert_eq!(read_len(&output), 0);

    fixture.stop().await;
}

fn read_len(path: &Path) -> u64 {
    std::fs::metadata(path).unwrap().len()
}

// =============================================================================
// Errors
// =============================================================================

#[tokio::test]
async fn test_errors_do_not_stop_the_server() {
    let fixture = Fixture::start().await;

    let outcome = fixture
        .run(2, "srv/share/ghost.bin", |c| {
            c.request.output_file = fixture.dir.path().join("ghost.out");
        })
        .await;
    assert_eq!(outcome.code(), ENOENT);

    fixture.write("full/keep.txt", b"x");
    let outcome = fixture.run(4, "srv/share/full", |_| {}).await;
    assert!(!outcome.is_success());

    // The server is still serving
    let outcome = fixture.run(6, "srv/share/full/keep.txt", |_| {}).await;
    assert_eq!(entries(&outcome), vec!["keep.txt"]);

    fixture.stop().await;
}

#[tokio::test]
async fn test_delete_reports_leftover_directory() {
    let fixture = Fixture::start().await;
    fixture.write("locked/inner/keep.txt", b"x");

    let inner = fixture.share("locked/inner");
    let mut perms = std::fs::metadata(&inner).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o555);
    std::fs::set_permissions(&inner, perms).unwrap();

    let outcome = fixture.run(5, "srv/share/locked", |_| {}).await;

    // Root ignores directory permissions and removes the whole tree
    if inner.exists() {
        let mut restore = std::fs::metadata(&inner).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut restore, 0o755);
        std::fs::set_permissions(&inner, restore).unwrap();
        assert_eq!(outcome.code(), ENOTEMPTY);
    } else {
        assert!(outcome.is_success());
    }

    fixture.stop().await;
}
