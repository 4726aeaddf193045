mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use music_catalog::db::CatalogRepository;
use music_catalog::scanner::{AutoScanner, ScanError, ScanRequest, ScanService};

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_new_scan_cancels_and_replaces_active_scan() {
    let h = Harness::new();
    h.add_track("song.flac", &[("title", "Song")]);
    h.tools.block_next_probe();

    let service = Arc::new(ScanService::new(h.scanner()));

    let first = tokio::spawn({
        let service = service.clone();
        async move { service.run(ScanRequest::default()).await }
    });
    let tools = h.tools.clone();
    wait_until(|| tools.is_blocked()).await;
    assert!(service.is_scanning());

    let second = service.run(ScanRequest::default()).await.unwrap();
    let first = first.await.unwrap();

    assert!(matches!(first, Err(ScanError::Cancelled)));
    assert_eq!(second.files_added, 1);
    assert_eq!(h.tools.max_active(), 1);
    assert!(!service.is_scanning());

    let files = CatalogRepository::new(h.pool.clone())
        .file_paths(h.library.id)
        .unwrap();
    assert_eq!(files, vec![h.path("song.flac")]);
}

#[tokio::test]
async fn test_cancel_stops_active_scan() {
    let h = Harness::new();
    h.add_track("song.flac", &[("title", "Song")]);
    h.tools.block_next_probe();

    let service = Arc::new(ScanService::new(h.scanner()));
    let running = tokio::spawn({
        let service = service.clone();
        async move { service.run(ScanRequest::default()).await }
    });
    let tools = h.tools.clone();
    wait_until(|| tools.is_blocked()).await;

    service.cancel().await;

    assert!(!service.is_scanning());
    assert!(matches!(running.await.unwrap(), Err(ScanError::Cancelled)));
    assert!(CatalogRepository::new(h.pool.clone())
        .file_paths(h.library.id)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_scan_state_counts_probed_files() {
    let h = Harness::new();
    h.add_track("one.flac", &[("title", "One")]);
    h.add_track("two.flac", &[("title", "Two")]);

    let service = ScanService::new(h.scanner());
    service.run(ScanRequest::new(true)).await.unwrap();

    assert_eq!(service.state().get_count(), 2);
}

#[tokio::test]
async fn test_auto_scanner_scans_periodically() {
    let h = Harness::new();
    h.add_track("song.flac", &[("title", "Song")]);

    let service = Arc::new(ScanService::new(h.scanner()));
    let mut auto_scanner = AutoScanner::new(service.clone(), Duration::from_millis(20));
    let handle = auto_scanner.start();

    let pool = h.pool.clone();
    let library_id = h.library.id;
    wait_until(|| {
        CatalogRepository::new(pool.clone())
            .file_paths(library_id)
            .is_ok_and(|files| files.len() == 1)
    })
    .await;

    handle.stop();
    service.cancel().await;
    assert_eq!(h.tools.probe_count(), 1);
}
