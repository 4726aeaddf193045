//! Single-flight scan execution and periodic background scanning.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ScanError, ScanRequest, ScanState, ScanSummary, Scanner};

/// Handle to the scan currently holding the catalog's write path.
struct ActiveScan {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl ActiveScan {
    /// Request cancellation and wait until the scan has fully stopped.
    async fn stop(mut self) {
        self.cancel.cancel();
        // A closed channel means the guard is gone, which also means stopped.
        let _ = self.done.wait_for(|finished| *finished).await;
    }
}

/// Marks the scan finished when the blocking task ends, even by panic.
struct FinishGuard {
    state: Arc<ScanState>,
    done: watch::Sender<bool>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.state.finish();
        self.done.send_replace(true);
    }
}

/// Runs scans one at a time.
///
/// Starting a scan while another is active cancels the active one and waits
/// for it to stop before the new one begins. Requests are never dropped.
pub struct ScanService {
    scanner: Arc<Scanner>,
    state: Arc<ScanState>,
    active: Mutex<Option<ActiveScan>>,
}

impl ScanService {
    pub fn new(scanner: Scanner) -> Self {
        Self {
            scanner: Arc::new(scanner),
            state: Arc::new(ScanState::new()),
            active: Mutex::new(None),
        }
    }

    /// Progress of the current or last scan.
    pub fn state(&self) -> Arc<ScanState> {
        self.state.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.state.is_scanning()
    }

    /// Run a scan to completion, replacing any scan already running.
    pub async fn run(&self, request: ScanRequest) -> Result<ScanSummary, ScanError> {
        let (cancel, done) = {
            let mut active = self.active.lock().await;
            if let Some(previous) = active.take() {
                info!("Cancelling active scan before starting a new one");
                previous.stop().await;
            }

            let cancel = CancellationToken::new();
            let (done_tx, done_rx) = watch::channel(false);
            *active = Some(ActiveScan {
                cancel: cancel.clone(),
                done: done_rx,
            });
            (cancel, done_tx)
        };

        self.state.begin();
        let guard = FinishGuard {
            state: self.state.clone(),
            done,
        };
        let scanner = self.scanner.clone();
        let state = self.state.clone();

        // Diesel and the external tools block, so the scan runs off the runtime.
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            scanner.scan(&request, &cancel, Some(&state))
        })
        .await
        .map_err(|e| ScanError::Join(e.to_string()))?
    }

    /// Cancel the active scan, if any, and wait for it to stop.
    pub async fn cancel(&self) {
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            previous.stop().await;
        }
    }
}

/// Background scanner that runs an incremental scan once per interval.
pub struct AutoScanner {
    service: Arc<ScanService>,
    interval: Duration,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl AutoScanner {
    pub fn new(service: Arc<ScanService>, interval: Duration) -> Self {
        Self {
            service,
            interval,
            shutdown_tx: None,
        }
    }

    /// Start the auto-scanner in the background.
    /// Returns a handle that can be used to stop the scanner.
    pub fn start(&mut self) -> AutoScanHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let service = self.service.clone();
        let interval = self.interval;

        tokio::spawn(async move {
            Self::run_scan_loop(service, interval, shutdown_rx).await;
        });

        AutoScanHandle { shutdown_tx }
    }

    async fn run_scan_loop(
        service: Arc<ScanService>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!(?interval, "Auto-scanner started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Auto-scanner received shutdown signal");
                        break;
                    }
                }
            }

            if service.is_scanning() {
                debug!("Skipping auto-scan: scan already in progress");
                continue;
            }

            info!("Starting auto-scan (incremental)");
            match service.run(ScanRequest::default()).await {
                Ok(summary) => {
                    info!(
                        files_added = summary.files_added,
                        files_updated = summary.files_updated,
                        files_skipped = summary.files_skipped,
                        files_removed = summary.files_removed,
                        files_failed = summary.files_failed,
                        "Auto-scan complete"
                    );
                }
                Err(ScanError::NoLibraries) => {
                    debug!("Auto-scan skipped: no libraries configured");
                }
                Err(ScanError::Cancelled) => {
                    info!("Auto-scan cancelled");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Auto-scan failed");
                }
            }
        }

        info!("Auto-scanner stopped");
    }
}

/// Handle for controlling the auto-scanner.
pub struct AutoScanHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl AutoScanHandle {
    /// Stop the auto-scanner. A scan already running is left to the service.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
