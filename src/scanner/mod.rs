//! Music library scanner.
//!
//! Walks each library's directory tree, diffs it against the catalog, probes
//! new and changed files with external tools, and reconciles the results.
//! Work is committed per directory, so an interrupted scan keeps everything
//! committed before it and the next scan picks up where it stopped.

pub mod fixup;
pub mod probe;
pub mod reconcile;
pub mod service;
pub mod tags;
pub mod track;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::ScannerConfig;
use crate::db::catalog::{self, CatalogError, DirectoryRow, FileRow, NewDirectoryRow, NewFileRow};
use crate::db::{DbPool, LibraryRepository};
use crate::models::catalog::Library;

use self::probe::{FfmpegTools, MediaTools, ToolError};
use self::reconcile::EntityCache;
use self::track::TrackChanges;

pub use self::service::{AutoScanHandle, AutoScanner, ScanService};

/// Errors that can occur during scanning.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Media tool error: {0}")]
    Tool(ToolError),

    #[error("Scan cancelled")]
    Cancelled,

    #[error("No libraries configured")]
    NoLibraries,

    #[error("Library not found: {0}")]
    LibraryNotFound(String),

    #[error("Scan task failed: {0}")]
    Join(String),
}

impl From<ToolError> for ScanError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::Cancelled => ScanError::Cancelled,
            other => ScanError::Tool(other),
        }
    }
}

impl From<diesel::result::Error> for ScanError {
    fn from(err: diesel::result::Error) -> Self {
        ScanError::Catalog(CatalogError::Database(err))
    }
}

impl From<diesel::r2d2::PoolError> for ScanError {
    fn from(err: diesel::r2d2::PoolError) -> Self {
        ScanError::Catalog(CatalogError::Pool(err))
    }
}

/// Counters describing what a scan changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub directories_added: usize,
    pub directories_removed: usize,
    pub files_added: usize,
    pub files_updated: usize,
    pub files_skipped: usize,
    pub files_removed: usize,
    pub files_failed: usize,
    pub tracks_added: usize,
    pub tracks_updated: usize,
    pub tracks_removed: usize,
    pub artists_added: usize,
    pub albums_added: usize,
    pub genres_added: usize,
    pub covers_applied: usize,
    pub artists_fixed: usize,
    pub albums_fixed: usize,
}

impl ScanSummary {
    /// Whether the scan left the catalog exactly as it found it.
    pub fn is_unchanged(&self) -> bool {
        let skipped_only = ScanSummary {
            files_skipped: self.files_skipped,
            ..Default::default()
        };
        *self == skipped_only
    }

    fn add_tracks(&mut self, changes: TrackChanges) {
        self.tracks_added += changes.added;
        self.tracks_updated += changes.updated;
        self.tracks_removed += changes.removed;
        self.artists_added += changes.artists_added;
        self.albums_added += changes.albums_added;
        self.genres_added += changes.genres_added;
    }
}

impl AddAssign for ScanSummary {
    fn add_assign(&mut self, other: Self) {
        self.directories_added += other.directories_added;
        self.directories_removed += other.directories_removed;
        self.files_added += other.files_added;
        self.files_updated += other.files_updated;
        self.files_skipped += other.files_skipped;
        self.files_removed += other.files_removed;
        self.files_failed += other.files_failed;
        self.tracks_added += other.tracks_added;
        self.tracks_updated += other.tracks_updated;
        self.tracks_removed += other.tracks_removed;
        self.artists_added += other.artists_added;
        self.albums_added += other.albums_added;
        self.genres_added += other.genres_added;
        self.covers_applied += other.covers_applied;
        self.artists_fixed += other.artists_fixed;
        self.albums_fixed += other.albums_fixed;
    }
}

/// Shared state for tracking scan progress.
///
/// Shared across threads behind an `Arc`; every operation is atomic.
#[derive(Debug, Default)]
pub struct ScanState {
    /// Whether a scan is currently in progress.
    scanning: AtomicBool,
    /// Number of files probed so far.
    count: AtomicU64,
}

impl ScanState {
    /// Create a new scan state.
    pub fn new() -> Self {
        Self {
            scanning: AtomicBool::new(false),
            count: AtomicU64::new(0),
        }
    }

    /// Check if a scan is currently in progress.
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Get the current file count.
    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Mark a scan as started and reset the count.
    pub fn begin(&self) {
        self.count.store(0, Ordering::SeqCst);
        self.scanning.store(true, Ordering::SeqCst);
    }

    /// Mark the scan as complete.
    pub fn finish(&self) {
        self.scanning.store(false, Ordering::SeqCst);
    }

    /// Increment the count by 1 and return the new value.
    pub fn increment_count(&self) -> u64 {
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Scan mode controlling how files are scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    /// Full scan - re-probe all files regardless of size and modification time.
    Full,
    /// Incremental scan - only probe new or modified files.
    #[default]
    Incremental,
}

impl ScanMode {
    pub fn from_force(force: bool) -> Self {
        if force { ScanMode::Full } else { ScanMode::Incremental }
    }
}

/// What a scan should cover.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRequest {
    pub mode: ScanMode,
    /// Restrict the scan to the library with this name.
    pub library: Option<String>,
}

impl ScanRequest {
    pub fn new(force: bool) -> Self {
        Self {
            mode: ScanMode::from_force(force),
            library: None,
        }
    }

    pub fn library(mut self, name: impl Into<String>) -> Self {
        self.library = Some(name.into());
        self
    }
}

/// Music library scanner.
pub struct Scanner {
    pool: DbPool,
    tools: Arc<dyn MediaTools>,
    config: ScannerConfig,
}

impl Scanner {
    /// Create a scanner backed by the given media tools.
    pub fn new(pool: DbPool, tools: Arc<dyn MediaTools>, config: ScannerConfig) -> Self {
        Self {
            pool,
            tools,
            config,
        }
    }

    /// Create a scanner running the configured `ffprobe`/`ffmpeg` programs.
    pub fn with_ffmpeg(pool: DbPool, config: ScannerConfig) -> Self {
        let tools = Arc::new(FfmpegTools::new(&config));
        Self::new(pool, tools, config)
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Run the scan described by `request`.
    pub fn scan(
        &self,
        request: &ScanRequest,
        cancel: &CancellationToken,
        state: Option<&ScanState>,
    ) -> Result<ScanSummary, ScanError> {
        match &request.library {
            Some(name) => self.scan_library_by_name(name, request.mode, cancel, state),
            None => self.scan_all(request.mode, cancel, state),
        }
    }

    /// Scan every library. A failing library is logged and skipped; only
    /// cancellation stops the whole scan.
    pub fn scan_all(
        &self,
        mode: ScanMode,
        cancel: &CancellationToken,
        state: Option<&ScanState>,
    ) -> Result<ScanSummary, ScanError> {
        let libraries = LibraryRepository::new(self.pool.clone()).find_all()?;

        if libraries.is_empty() {
            return Err(ScanError::NoLibraries);
        }

        let mut total = ScanSummary::default();
        for library in &libraries {
            match self.scan_library(library, mode, cancel, state) {
                Ok(summary) => total += summary,
                Err(ScanError::Cancelled) => return Err(ScanError::Cancelled),
                Err(e) => {
                    tracing::error!(library = %library.name, error = %e, "Library scan failed");
                }
            }
        }

        Ok(total)
    }

    pub fn scan_library_by_name(
        &self,
        name: &str,
        mode: ScanMode,
        cancel: &CancellationToken,
        state: Option<&ScanState>,
    ) -> Result<ScanSummary, ScanError> {
        let library = LibraryRepository::new(self.pool.clone())
            .find_by_name(name)?
            .ok_or_else(|| ScanError::LibraryNotFound(name.to_string()))?;

        self.scan_library(&library, mode, cancel, state)
    }

    /// Scan one library: its directory tree, then the fixup pass.
    pub fn scan_library(
        &self,
        library: &Library,
        mode: ScanMode,
        cancel: &CancellationToken,
        state: Option<&ScanState>,
    ) -> Result<ScanSummary, ScanError> {
        info!(library = %library.name, path = %library.path, ?mode, "Scanning library");

        let mut conn = self.pool.get()?;
        let mut scan = LibraryScan {
            tools: self.tools.as_ref(),
            config: &self.config,
            library,
            mode,
            cancel,
            state,
            cache: EntityCache::new(),
            summary: ScanSummary::default(),
        };

        let root = scan.ensure_root(&mut conn)?;
        scan.scan_directory(&mut conn, &root)?;

        let fixups = fixup::run_fixups(&mut conn, cancel)?;
        scan.summary.artists_fixed += fixups.artists;
        scan.summary.albums_fixed += fixups.albums;

        let summary = scan.summary;
        info!(
            library = %library.name,
            files_added = summary.files_added,
            files_updated = summary.files_updated,
            files_skipped = summary.files_skipped,
            files_removed = summary.files_removed,
            files_failed = summary.files_failed,
            artists_fixed = summary.artists_fixed,
            albums_fixed = summary.albums_fixed,
            "Library scan complete"
        );

        Ok(summary)
    }
}

/// Size and modification time of a file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStat {
    size: i64,
    /// Milliseconds since the Unix epoch.
    modified: i64,
}

/// Entries found directly inside a directory on disk.
#[derive(Debug, Default)]
struct Listing {
    /// Subdirectory paths.
    directories: BTreeSet<String>,
    /// File names with their stats.
    files: BTreeMap<String, FileStat>,
}

fn list_directory(path: &Path) -> std::io::Result<Listing> {
    if !fs::metadata(path)?.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotADirectory,
            format!("{} is not a directory", path.display()),
        ));
    }

    let mut listing = Listing::default();

    for entry in WalkDir::new(path)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                debug!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        let Some(entry_path) = entry.path().to_str() else {
            warn!(path = %entry.path().display(), "Skipping non UTF-8 path");
            continue;
        };

        if entry.file_type().is_dir() {
            listing.directories.insert(entry_path.to_string());
        } else if entry.file_type().is_file() {
            let Ok(metadata) = entry.metadata() else {
                debug!(path = %entry_path, "File vanished while listing");
                continue;
            };
            let modified = metadata
                .modified()
                .ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|age| age.as_millis() as i64)
                .unwrap_or_default();

            listing.files.insert(
                entry.file_name().to_string_lossy().into_owned(),
                FileStat {
                    size: metadata.len() as i64,
                    modified,
                },
            );
        }
    }

    Ok(listing)
}

fn now() -> NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

/// One library's scan: its unit-of-work cache and running summary.
struct LibraryScan<'a> {
    tools: &'a dyn MediaTools,
    config: &'a ScannerConfig,
    library: &'a Library,
    mode: ScanMode,
    cancel: &'a CancellationToken,
    state: Option<&'a ScanState>,
    cache: EntityCache,
    summary: ScanSummary,
}

impl LibraryScan<'_> {
    fn check_cancelled(&self) -> Result<(), ScanError> {
        if self.cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        Ok(())
    }

    /// The library's root directory row, recreated when the library moved.
    fn ensure_root(&mut self, conn: &mut SqliteConnection) -> Result<DirectoryRow, ScanError> {
        let existing = catalog::find_root_directory(conn, self.library.id)?;
        if let Some(root) = &existing
            && root.path == self.library.path
        {
            return Ok(root.clone());
        }

        conn.transaction::<_, ScanError, _>(|conn| {
            let now = now();
            if let Some(old) = existing {
                info!(
                    library = %self.library.name,
                    from = %old.path,
                    to = %self.library.path,
                    "Library root moved, replacing directory tree"
                );
                self.summary.directories_removed += catalog::delete_directory(conn, old.id)?;
            }

            let root = catalog::insert_directory(
                conn,
                &NewDirectoryRow {
                    library_id: self.library.id,
                    parent_id: None,
                    path: &self.library.path,
                    added: now,
                },
            )?;
            self.summary.directories_added += 1;
            catalog::bump_content_modified(conn, self.library.id, now)?;
            Ok(root)
        })
    }

    /// Sync one directory with the disk, then recurse into its children and
    /// finally apply the directory-level cover.
    fn scan_directory(
        &mut self,
        conn: &mut SqliteConnection,
        directory: &DirectoryRow,
    ) -> Result<(), ScanError> {
        self.check_cancelled()?;

        let path = PathBuf::from(&directory.path);
        let mut listing = match list_directory(&path) {
            Ok(listing) => listing,
            Err(e) if directory.is_root() => {
                warn!(
                    library = %self.library.name,
                    path = %directory.path,
                    error = %e,
                    "Library root unavailable, skipping"
                );
                return Ok(());
            }
            Err(e) => return self.discard_directory(conn, directory, e.into()),
        };

        let result = conn.transaction::<_, ScanError, _>(|conn| {
            self.sync_directory(conn, directory, &path, &mut listing)
        });
        self.cache.clear();
        let children = match result {
            Ok(children) => children,
            Err(e) => return self.discard_directory(conn, directory, e),
        };

        for child in &children {
            self.scan_directory(conn, child)?;
        }

        self.check_cancelled()?;
        let result =
            conn.transaction::<_, ScanError, _>(|conn| self.apply_directory_cover(conn, directory));
        if let Err(e) = result {
            return self.discard_directory(conn, directory, e);
        }

        Ok(())
    }

    /// Recover from a failure inside one directory. Cancellation propagates;
    /// any other error removes the directory's subtree so the next scan
    /// starts it afresh, and the scan moves on to its siblings. The root row
    /// is never removed this way.
    fn discard_directory(
        &mut self,
        conn: &mut SqliteConnection,
        directory: &DirectoryRow,
        error: ScanError,
    ) -> Result<(), ScanError> {
        if matches!(error, ScanError::Cancelled) {
            return Err(error);
        }

        if directory.is_root() {
            warn!(
                library = %self.library.name,
                path = %directory.path,
                error = %error,
                "Failed to scan library root"
            );
            return Ok(());
        }

        warn!(path = %directory.path, error = %error, "Failed to scan directory, removing");
        let removed = conn.transaction::<_, ScanError, _>(|conn| {
            let removed = catalog::delete_directory(conn, directory.id)?;
            catalog::bump_content_modified(conn, self.library.id, now())?;
            Ok(removed)
        });
        match removed {
            Ok(removed) => self.summary.directories_removed += removed,
            Err(e) => warn!(path = %directory.path, error = %e, "Failed to remove directory"),
        }

        Ok(())
    }

    /// Apply one directory's diff inside the caller's transaction and return
    /// the subdirectories to recurse into.
    fn sync_directory(
        &mut self,
        conn: &mut SqliteConnection,
        directory: &DirectoryRow,
        path: &Path,
        listing: &mut Listing,
    ) -> Result<Vec<DirectoryRow>, ScanError> {
        let now = now();
        let mut mutated = false;

        let mut children = Vec::new();
        for child in catalog::child_directories(conn, directory.id)? {
            if listing.directories.remove(&child.path) {
                children.push(child);
            } else {
                debug!(path = %child.path, "Directory removed");
                self.summary.directories_removed += catalog::delete_directory(conn, child.id)?;
                mutated = true;
            }
        }
        for child_path in std::mem::take(&mut listing.directories) {
            let new_directory = NewDirectoryRow {
                library_id: self.library.id,
                parent_id: Some(directory.id),
                path: &child_path,
                added: now,
            };
            match conn.transaction(|conn| catalog::insert_directory(conn, &new_directory)) {
                Ok(child) => {
                    debug!(path = %child_path, "Directory added");
                    self.summary.directories_added += 1;
                    children.push(child);
                    mutated = true;
                }
                Err(e) => {
                    warn!(path = %child_path, error = %e, "Failed to add directory, skipping");
                }
            }
        }

        let mut pending: Vec<(FileRow, FileStat, bool)> = Vec::new();
        let mut stale = Vec::new();
        for file in catalog::directory_files(conn, directory.id)? {
            match listing.files.remove(&file.name) {
                None => stale.push(file.id),
                Some(stat)
                    if self.mode == ScanMode::Incremental
                        && file.size == stat.size
                        && file.modified == stat.modified =>
                {
                    self.summary.files_skipped += 1;
                }
                Some(stat) => pending.push((file, stat, false)),
            }
        }

        if !stale.is_empty() {
            self.summary.files_removed += catalog::delete_files(conn, &stale)?;
            mutated = true;
        }

        for (name, stat) in std::mem::take(&mut listing.files) {
            let file = catalog::insert_file(
                conn,
                &NewFileRow {
                    library_id: self.library.id,
                    directory_id: directory.id,
                    name: &name,
                    size: stat.size,
                    modified: stat.modified,
                    format_name: None,
                    added: now,
                },
            )?;
            pending.push((file, stat, true));
        }

        for (file, stat, is_new) in pending {
            self.check_cancelled()?;

            let file_path = path.join(&file.name);
            let result = conn.transaction::<_, ScanError, _>(|conn| {
                self.scan_file(conn, &file, &file_path, stat)
            });

            match result {
                Ok((changes, file_changed)) => {
                    if is_new {
                        self.summary.files_added += 1;
                    } else {
                        self.summary.files_updated += 1;
                    }
                    mutated |= is_new || file_changed || !changes.is_empty();
                    self.summary.add_tracks(changes);
                }
                Err(ScanError::Cancelled) => return Err(ScanError::Cancelled),
                Err(e) => {
                    warn!(path = %file_path.display(), error = %e, "Failed to scan file, removing");
                    self.cache.clear();
                    catalog::delete_files(conn, &[file.id])?;
                    self.summary.files_failed += 1;
                    // A new file that fails leaves no trace in the catalog.
                    mutated |= !is_new;
                }
            }

            if let Some(state) = self.state {
                state.increment_count();
            }
        }

        if mutated {
            catalog::bump_content_modified(conn, self.library.id, now)?;
        }

        Ok(children)
    }

    /// Probe one file and reconcile its pictures and tracks. Also returns
    /// whether the file row or its pictures changed.
    fn scan_file(
        &mut self,
        conn: &mut SqliteConnection,
        file: &FileRow,
        path: &Path,
        stat: FileStat,
    ) -> Result<(TrackChanges, bool), ScanError> {
        debug!(path = %path.display(), "Probing file");

        let report = probe::probe_file(self.tools, path, self.cancel)?;
        let picture = track::resolve_picture(conn, self.tools, file, path, &report, self.cancel)?;
        let changes =
            track::build_tracks(conn, &mut self.cache, file, &report, picture.id, now())?;

        let format_name = report.format_name();
        let file_changed = file.size != stat.size
            || file.modified != stat.modified
            || file.format_name.as_deref() != format_name;
        if file_changed {
            catalog::update_file(conn, file.id, stat.size, stat.modified, format_name)?;
        }

        Ok((changes, file_changed || picture.changed))
    }

    /// Give tracks in this directory without a cover the picture of the
    /// directory's cover image file, if it has one.
    fn apply_directory_cover(
        &mut self,
        conn: &mut SqliteConnection,
        directory: &DirectoryRow,
    ) -> Result<(), ScanError> {
        let files = catalog::directory_files(conn, directory.id)?;
        if !files.iter().any(|f| self.config.is_cover_file(&f.name)) {
            return Ok(());
        }

        let mut cover = None;
        'names: for name in &self.config.cover_file_names {
            for file in files.iter().filter(|f| f.name.eq_ignore_ascii_case(name)) {
                if let Some(picture) = catalog::file_pictures(conn, file.id)?.first() {
                    cover = Some(picture.id);
                    break 'names;
                }
            }
        }

        let Some(picture_id) = cover else {
            return Ok(());
        };

        let file_ids: Vec<i32> = files.iter().map(|f| f.id).collect();
        let applied = catalog::set_missing_track_pictures(conn, &file_ids, picture_id)?;
        if applied > 0 {
            debug!(path = %directory.path, tracks = applied, "Applied directory cover");
            self.summary.covers_applied += applied;
        }

        Ok(())
    }
}
