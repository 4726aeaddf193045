#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use music_catalog::config::ScannerConfig;
use music_catalog::db::{DbConfig, DbPool, LibraryRepository, run_migrations};
use music_catalog::models::catalog::{Library, NewLibrary};
use music_catalog::scanner::probe::{MediaTools, ProbeReport, ProbeSections, ToolError};
use music_catalog::scanner::{ScanRequest, ScanSummary, Scanner};

/// Stand-in for the probe and digest programs, answering with canned
/// reports keyed by file name.
#[derive(Default)]
pub struct FakeTools {
    reports: Mutex<HashMap<String, Value>>,
    digests: Mutex<HashMap<String, Vec<u8>>>,
    failing_digests: Mutex<HashSet<String>>,
    block_next: AtomicBool,
    blocked: AtomicBool,
    active: AtomicUsize,
    max_active: AtomicUsize,
    pub probes: AtomicUsize,
}

impl FakeTools {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn report(&self, name: &str, report: Value) {
        self.reports.lock().unwrap().insert(name.to_string(), report);
    }

    pub fn digest(&self, name: &str, digest: &[u8]) {
        self.digests.lock().unwrap().insert(name.to_string(), digest.to_vec());
    }

    /// Make every digest request for `name` fail like a crashed tool.
    pub fn fail_digest(&self, name: &str) {
        self.failing_digests.lock().unwrap().insert(name.to_string());
    }

    /// Make the next probe hang until its scan is cancelled.
    pub fn block_next_probe(&self) {
        self.block_next.store(true, Ordering::SeqCst);
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    fn name(path: &Path) -> String {
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl MediaTools for FakeTools {
    fn probe(
        &self,
        path: &Path,
        sections: ProbeSections,
        cancel: &CancellationToken,
    ) -> Result<ProbeReport, ToolError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let result = if self.block_next.swap(false, Ordering::SeqCst) {
            self.blocked.store(true, Ordering::SeqCst);
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            self.blocked.store(false, Ordering::SeqCst);
            Err(ToolError::Cancelled)
        } else {
            match self.reports.lock().unwrap().get(&Self::name(path)) {
                Some(report) => {
                    let mut report = report.clone();
                    if !sections.contains(ProbeSections::PACKETS)
                        && let Some(fields) = report.as_object_mut()
                    {
                        fields.remove("packets");
                    }
                    ProbeReport::parse(report.to_string().as_bytes())
                }
                None => Err(ToolError::Failed { status: Some(1) }),
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn stream_digest(
        &self,
        path: &Path,
        stream_index: i32,
        _cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ToolError> {
        let name = Self::name(path);
        if self.failing_digests.lock().unwrap().contains(&name) {
            return Err(ToolError::Failed { status: Some(1) });
        }
        Ok(self
            .digests
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .unwrap_or_else(|| format!("{}#{}", name, stream_index).into_bytes()))
    }
}

/// Probe output for a single-stream audio file.
pub fn audio(tags: &[(&str, &str)]) -> Value {
    let tags: serde_json::Map<String, Value> = tags
        .iter()
        .map(|(key, value)| (key.to_string(), json!(value)))
        .collect();

    json!({
        "format": {
            "format_name": "flac",
            "duration": "180.000000",
            "bit_rate": "900000",
            "tags": tags,
        },
        "streams": [
            {"index": 0, "codec_type": "audio", "codec_name": "flac"}
        ]
    })
}

/// Probe output for a still image.
pub fn image() -> Value {
    json!({
        "format": {"format_name": "image2"},
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "mjpeg"}
        ]
    })
}

/// A temporary catalog database and music tree.
pub struct Harness {
    _db_dir: TempDir,
    pub music: TempDir,
    pub pool: DbPool,
    pub tools: Arc<FakeTools>,
    pub library: Library,
}

impl Harness {
    pub fn new() -> Self {
        let db_dir = tempfile::tempdir().unwrap();
        let music = tempfile::tempdir().unwrap();

        let db_path = db_dir.path().join("catalog.db");
        let pool = DbConfig::new(db_path.to_str().unwrap()).build_pool().unwrap();
        run_migrations(&mut pool.get().unwrap()).unwrap();

        let library = LibraryRepository::new(pool.clone())
            .create(&NewLibrary::new("Music", music.path().to_str().unwrap()))
            .unwrap();

        Self {
            _db_dir: db_dir,
            music,
            pool,
            tools: FakeTools::new(),
            library,
        }
    }

    pub fn scanner(&self) -> Scanner {
        Scanner::new(self.pool.clone(), self.tools.clone(), ScannerConfig::default())
    }

    pub fn scan(&self) -> ScanSummary {
        self.scanner()
            .scan(&ScanRequest::default(), &CancellationToken::new(), None)
            .unwrap()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.music.path().join(relative)
    }

    /// Write a file under the music tree, creating parent directories.
    pub fn write(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.path(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    /// Write an audio file and register its probe output.
    pub fn add_track(&self, relative: &str, tags: &[(&str, &str)]) -> PathBuf {
        let path = self.write(relative, relative);
        self.tools.report(&file_name(&path), audio(tags));
        path
    }
}

pub fn file_name(path: &Path) -> String {
    path.file_name().unwrap().to_string_lossy().into_owned()
}
