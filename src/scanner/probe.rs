//! External media tools: structured probing and per-stream digests.
//!
//! Both tools run as blocking subprocesses. The caller's cancellation token is
//! polled while a tool runs; a cancelled tool is killed and reported as
//! [`ToolError::Cancelled`].

use std::collections::HashMap;
use std::io::Read;
use std::ops::BitOr;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ScannerConfig;

/// How often a running tool is checked for exit or cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Container formats that hold a single still image.
const STILL_IMAGE_FORMATS: &[&str] = &[
    "image2", "png_pipe", "jpeg_pipe", "bmp_pipe", "webp_pipe", "gif", "mjpeg",
];

/// Errors reported by the external tools.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Failed to start tool: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to read tool output: {0}")]
    Io(#[source] std::io::Error),

    #[error("Tool exited with status {status:?}")]
    Failed { status: Option<i32> },

    #[error("Malformed tool output: {0}")]
    Malformed(String),

    #[error("Tool reported error {code}: {message}")]
    Reported { code: i64, message: String },

    #[error("Tool run cancelled")]
    Cancelled,
}

/// Report sections requested from the probe tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSections(u8);

impl ProbeSections {
    pub const ERROR: Self = Self(1);
    pub const FORMAT: Self = Self(1 << 1);
    pub const STREAMS: Self = Self(1 << 2);
    pub const PACKETS: Self = Self(1 << 3);
    pub const DEFAULT: Self = Self(Self::ERROR.0 | Self::FORMAT.0 | Self::STREAMS.0);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Command-line switches selecting these sections.
    pub fn args(self) -> Vec<&'static str> {
        [
            (Self::ERROR, "-show_error"),
            (Self::FORMAT, "-show_format"),
            (Self::STREAMS, "-show_streams"),
            (Self::PACKETS, "-show_packets"),
        ]
        .into_iter()
        .filter(|(section, _)| self.contains(*section))
        .map(|(_, arg)| arg)
        .collect()
    }
}

impl BitOr for ProbeSections {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ============================================================================
// Probe report
// ============================================================================

/// Structured probe output.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeReport {
    #[serde(default)]
    pub error: Option<ProbeErrorInfo>,
    #[serde(default)]
    pub format: Option<ProbeFormat>,
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
    #[serde(default)]
    pub packets: Option<Vec<ProbePacket>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeErrorInfo {
    #[serde(default, deserialize_with = "lenient_i64")]
    pub code: Option<i64>,
    #[serde(default, rename = "string")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeFormat {
    #[serde(default)]
    pub format_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub duration: Option<f64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub size: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub bit_rate: Option<i64>,
    #[serde(default, deserialize_with = "lenient_tags")]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeDisposition {
    #[serde(default, deserialize_with = "lenient_i64")]
    pub attached_pic: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeStream {
    pub index: i32,
    #[serde(default)]
    pub codec_type: Option<String>,
    #[serde(default)]
    pub codec_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub bit_rate: Option<i64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub duration: Option<f64>,
    #[serde(default)]
    pub disposition: ProbeDisposition,
    #[serde(default, deserialize_with = "lenient_tags")]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbePacket {
    pub stream_index: i32,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub size: Option<i64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub duration_time: Option<f64>,
}

/// Numbers arrive as JSON numbers or as strings, with `"N/A"` for unknown.
#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = match Option::<Lenient>::deserialize(deserializer)? {
        Some(Lenient::Int(v)) => Some(v as f64),
        Some(Lenient::Float(v)) => Some(v),
        Some(Lenient::Text(s)) => s.trim().parse::<f64>().ok(),
        Some(Lenient::Bool(_)) | None => None,
    };
    Ok(value.filter(|v| v.is_finite()))
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Ok(match Option::<Lenient>::deserialize(deserializer)? {
        Some(Lenient::Int(v)) => Some(v),
        Some(Lenient::Float(v)) if v.is_finite() => Some(v.round() as i64),
        Some(Lenient::Text(s)) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .map(|v| v.round() as i64)
            })
        }
        Some(Lenient::Bool(v)) => Some(v as i64),
        _ => None,
    })
}

fn lenient_tags<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<HashMap<String, String>, D::Error> {
    let raw = Option::<HashMap<String, serde_json::Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(key, value)| match value {
            serde_json::Value::String(s) => Some((key, s)),
            serde_json::Value::Null => None,
            other => Some((key, other.to_string())),
        })
        .collect())
}

/// First entry of a comma-joined name list.
fn first_name(names: &str) -> Option<&str> {
    names.split(',').map(str::trim).find(|name| !name.is_empty())
}

impl ProbeReport {
    /// Parse the probe tool's JSON output. A reported error is a failure.
    pub fn parse(output: &[u8]) -> Result<Self, ToolError> {
        let report: ProbeReport =
            serde_json::from_slice(output).map_err(|e| ToolError::Malformed(e.to_string()))?;

        if let Some(error) = &report.error {
            return Err(ToolError::Reported {
                code: error.code.unwrap_or_default(),
                message: error.message.clone().unwrap_or_default(),
            });
        }

        Ok(report)
    }

    /// Container format name, preferring `mp4` among comma-joined alternatives.
    pub fn format_name(&self) -> Option<&str> {
        let names = self.format.as_ref()?.format_name.as_deref()?;
        if names.split(',').any(|name| name.trim() == "mp4") {
            return Some("mp4");
        }
        first_name(names)
    }

    pub fn is_still_image(&self) -> bool {
        self.format_name()
            .is_some_and(|name| STILL_IMAGE_FORMATS.contains(&name))
    }

    pub fn audio_streams(&self) -> impl Iterator<Item = &ProbeStream> {
        self.streams.iter().filter(|stream| stream.is_audio())
    }

    pub fn format_duration(&self) -> Option<f64> {
        self.format.as_ref().and_then(|format| format.duration)
    }

    pub fn format_bit_rate(&self) -> Option<i64> {
        self.format.as_ref().and_then(|format| format.bit_rate)
    }

    /// Whether some audio stream lacks a duration or bit rate that neither the
    /// stream nor the container can supply.
    pub fn needs_packets(&self) -> bool {
        let format_duration = self.format_duration();
        let format_bit_rate = self.format_bit_rate();

        self.audio_streams().any(|stream| {
            stream.duration.or(format_duration).is_none()
                || stream.bit_rate.or(format_bit_rate).is_none()
        })
    }

    /// Total packet bytes and seconds for one stream, if packets were requested.
    fn packet_totals(&self, stream_index: i32) -> Option<(i64, f64)> {
        let packets = self.packets.as_ref()?;
        let mut bytes = 0i64;
        let mut seconds = 0f64;
        let mut seen = false;

        for packet in packets.iter().filter(|p| p.stream_index == stream_index) {
            seen = true;
            bytes += packet.size.unwrap_or_default();
            seconds += packet.duration_time.unwrap_or_default();
        }

        seen.then_some((bytes, seconds))
    }

    /// Stream duration summed over its packets.
    pub fn packet_duration(&self, stream_index: i32) -> Option<f64> {
        self.packet_totals(stream_index)
            .map(|(_, seconds)| seconds)
            .filter(|seconds| *seconds > 0.0)
    }

    /// Stream bit rate derived from its packets, rounded to the nearest integer.
    pub fn packet_bit_rate(&self, stream_index: i32) -> Option<i64> {
        let (bytes, seconds) = self.packet_totals(stream_index)?;
        if seconds <= 0.0 {
            return None;
        }
        Some((bytes as f64 * 8.0 / seconds).round() as i64)
    }
}

impl ProbeStream {
    pub fn is_audio(&self) -> bool {
        self.codec_type.as_deref() == Some("audio")
    }

    pub fn is_video(&self) -> bool {
        self.codec_type.as_deref() == Some("video")
    }

    pub fn is_attached_picture(&self) -> bool {
        self.is_video() && self.disposition.attached_pic.unwrap_or_default() != 0
    }

    /// Codec name, taking the first of comma-joined alternatives.
    pub fn codec(&self) -> Option<&str> {
        self.codec_name.as_deref().and_then(first_name)
    }

    /// Tag value looked up case-insensitively.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .get(key)
            .or_else(|| {
                self.tags
                    .iter()
                    .filter(|(k, _)| k.eq_ignore_ascii_case(key))
                    .min_by(|a, b| a.0.cmp(b.0))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }
}

// ============================================================================
// Digests
// ============================================================================

/// Parse a `<algorithm>=<hex digits>` line into raw digest bytes.
pub fn parse_digest(output: &[u8]) -> Result<Vec<u8>, ToolError> {
    let text = std::str::from_utf8(output).map_err(|e| ToolError::Malformed(e.to_string()))?;
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| ToolError::Malformed("empty digest output".to_string()))?;

    let (_, digits) = line
        .split_once('=')
        .ok_or_else(|| ToolError::Malformed(format!("no digest in {:?}", line)))?;
    let digits = digits.trim();
    if digits.is_empty() {
        return Err(ToolError::Malformed("empty digest".to_string()));
    }

    hex::decode(digits).map_err(|e| ToolError::Malformed(format!("bad digest {:?}: {}", digits, e)))
}

/// Keep the low 64 bits of a digest as a big-endian integer.
pub fn digest_to_i64(digest: &[u8]) -> i64 {
    let tail = &digest[digest.len().saturating_sub(8)..];
    let mut bytes = [0u8; 8];
    bytes[8 - tail.len()..].copy_from_slice(tail);
    i64::from_be_bytes(bytes)
}

// ============================================================================
// Tools
// ============================================================================

/// The external probe and digest programs.
pub trait MediaTools: Send + Sync {
    /// Probe a file for the requested report sections.
    fn probe(
        &self,
        path: &Path,
        sections: ProbeSections,
        cancel: &CancellationToken,
    ) -> Result<ProbeReport, ToolError>;

    /// Digest one elementary stream of a file.
    fn stream_digest(
        &self,
        path: &Path,
        stream_index: i32,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ToolError>;
}

/// `ffprobe` / `ffmpeg` backed tools.
#[derive(Debug, Clone)]
pub struct FfmpegTools {
    probe_program: String,
    digest_program: String,
    digest_algorithm: String,
}

impl FfmpegTools {
    pub fn new(config: &ScannerConfig) -> Self {
        Self {
            probe_program: config.probe_program.clone(),
            digest_program: config.digest_program.clone(),
            digest_algorithm: config.digest_algorithm.clone(),
        }
    }
}

impl MediaTools for FfmpegTools {
    fn probe(
        &self,
        path: &Path,
        sections: ProbeSections,
        cancel: &CancellationToken,
    ) -> Result<ProbeReport, ToolError> {
        let mut command = Command::new(&self.probe_program);
        command
            .args(["-v", "fatal", "-print_format", "json"])
            .args(sections.args())
            .arg(path);

        let output = run_tool(command, cancel)?;
        ProbeReport::parse(&output)
    }

    fn stream_digest(
        &self,
        path: &Path,
        stream_index: i32,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ToolError> {
        let mut command = Command::new(&self.digest_program);
        command
            .args(["-nostdin", "-v", "fatal", "-i"])
            .arg(path)
            .arg("-map")
            .arg(format!("0:{}", stream_index))
            .args(["-c", "copy", "-f", "hash", "-hash"])
            .arg(&self.digest_algorithm)
            .arg("-");

        let output = run_tool(command, cancel)?;
        parse_digest(&output)
    }
}

/// Run a tool to completion and return its stdout.
fn run_tool(mut command: Command, cancel: &CancellationToken) -> Result<Vec<u8>, ToolError> {
    if cancel.is_cancelled() {
        return Err(ToolError::Cancelled);
    }

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(ToolError::Spawn)?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ToolError::Malformed("stdout not captured".to_string()))?;

    // Drain stdout concurrently so a chatty tool cannot block on a full pipe.
    let reader = thread::spawn(move || {
        let mut buffer = Vec::new();
        stdout.read_to_end(&mut buffer).map(|_| buffer)
    });

    let status = loop {
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            let _ = reader.join();
            return Err(ToolError::Cancelled);
        }

        match child.try_wait().map_err(ToolError::Io)? {
            Some(status) => break status,
            None => thread::sleep(POLL_INTERVAL),
        }
    };

    let output = reader
        .join()
        .map_err(|_| ToolError::Malformed("output reader panicked".to_string()))?
        .map_err(ToolError::Io)?;

    if !status.success() {
        return Err(ToolError::Failed {
            status: status.code(),
        });
    }

    Ok(output)
}

// ============================================================================
// Escalating probe
// ============================================================================

enum ProbeStage {
    Initial,
    ProbedMinimal(ProbeReport),
    ProbedWithPackets(ProbeReport),
    Done(ProbeReport),
    Failed(ToolError),
}

/// Probe a file, re-probing once with packet detail when an audio stream's
/// duration or bit rate can only be derived from its packets.
pub fn probe_file(
    tools: &dyn MediaTools,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<ProbeReport, ToolError> {
    let mut stage = ProbeStage::Initial;

    loop {
        stage = match stage {
            ProbeStage::Initial => match tools.probe(path, ProbeSections::DEFAULT, cancel) {
                Ok(report) => ProbeStage::ProbedMinimal(report),
                Err(e) => ProbeStage::Failed(e),
            },
            ProbeStage::ProbedMinimal(report) if report.needs_packets() => {
                debug!(path = %path.display(), "Re-probing with packet detail");
                let sections = ProbeSections::DEFAULT | ProbeSections::PACKETS;
                match tools.probe(path, sections, cancel) {
                    Ok(report) => ProbeStage::ProbedWithPackets(report),
                    Err(e) => ProbeStage::Failed(e),
                }
            }
            ProbeStage::ProbedMinimal(report) | ProbeStage::ProbedWithPackets(report) => {
                ProbeStage::Done(report)
            }
            ProbeStage::Done(report) => return Ok(report),
            ProbeStage::Failed(e) => return Err(e),
        };
    }
}
