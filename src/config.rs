//! Scanner configuration.

use std::time::Duration;

/// Default interval between background scans (24 hours).
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 24 * 60 * 60;

const ENV_FFPROBE: &str = "MUSIC_CATALOG_FFPROBE";
const ENV_FFMPEG: &str = "MUSIC_CATALOG_FFMPEG";
const ENV_DIGEST: &str = "MUSIC_CATALOG_DIGEST";
const ENV_SCAN_INTERVAL: &str = "MUSIC_CATALOG_SCAN_INTERVAL_SECS";

/// Settings shared by the scanner and its external tools.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Program used to probe media files.
    pub probe_program: String,
    /// Program used to digest individual streams.
    pub digest_program: String,
    /// Digest algorithm handed to the digest program.
    pub digest_algorithm: String,
    /// Interval between background scans.
    pub scan_interval: Duration,
    /// File names (compared case-insensitively) whose picture serves as the
    /// cover of every track in the same directory lacking one.
    pub cover_file_names: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            probe_program: "ffprobe".to_string(),
            digest_program: "ffmpeg".to_string(),
            digest_algorithm: "sha256".to_string(),
            scan_interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
            cover_file_names: vec!["cover.jpg".to_string(), "cover.png".to_string()],
        }
    }
}

impl ScannerConfig {
    /// Defaults overridden by `MUSIC_CATALOG_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each known key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(program) = lookup(ENV_FFPROBE).filter(|v| !v.is_empty()) {
            config.probe_program = program;
        }
        if let Some(program) = lookup(ENV_FFMPEG).filter(|v| !v.is_empty()) {
            config.digest_program = program;
        }
        if let Some(algorithm) = lookup(ENV_DIGEST).filter(|v| !v.is_empty()) {
            config.digest_algorithm = algorithm;
        }
        if let Some(raw) = lookup(ENV_SCAN_INTERVAL) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.scan_interval = Duration::from_secs(secs),
                _ => tracing::warn!(
                    value = %raw,
                    "Ignoring invalid {}, keeping {:?}",
                    ENV_SCAN_INTERVAL,
                    config.scan_interval
                ),
            }
        }

        config
    }

    /// Whether `file_name` names a directory-level cover image.
    pub fn is_cover_file(&self, file_name: &str) -> bool {
        self.cover_file_names
            .iter()
            .any(|name| name.eq_ignore_ascii_case(file_name))
    }
}
