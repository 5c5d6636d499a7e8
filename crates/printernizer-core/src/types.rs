// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Core domain types for the Printernizer fleet coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Unique identifier for a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Supported printer vendor families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrinterKind {
    BambuLab,
    PrusaCore,
}

impl PrinterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BambuLab => "bambu_lab",
            Self::PrusaCore => "prusa_core",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "bambu_lab" => Some(Self::BambuLab),
            "prusa_core" => Some(Self::PrusaCore),
            _ => None,
        }
    }
}

impl std::fmt::Display for PrinterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized printer state, shared across vendor families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrinterState {
    Online,
    Printing,
    Paused,
    Error,
    Offline,
    Unknown,
}

impl PrinterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Printing => "printing",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Offline => "offline",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "online" => Self::Online,
            "printing" => Self::Printing,
            "paused" => Self::Paused,
            "error" => Self::Error,
            "offline" => Self::Offline,
            _ => Self::Unknown,
        }
    }
}

/// Normalized snapshot of a printer's state at one instant.
///
/// Produced by drivers, consumed by the monitor. Absent vendor fields stay
/// `None` — they are never substituted with zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub printer_id: String,
    pub state: PrinterState,
    pub message: Option<String>,
    pub temperature_bed: Option<f64>,
    pub temperature_bed_target: Option<f64>,
    pub temperature_nozzle: Option<f64>,
    pub temperature_nozzle_target: Option<f64>,
    /// Progress percent, clamped to [0, 100] when present.
    pub progress: Option<f64>,
    /// Filename of the job currently printing, as the vendor reports it.
    pub current_job: Option<String>,
    /// Resolved file row id, stamped by the monitor when the filename matches
    /// a stored file.
    pub current_job_file_id: Option<String>,
    pub current_job_has_thumbnail: Option<bool>,
    pub current_job_thumbnail_url: Option<String>,
    pub remaining_minutes: Option<u32>,
    pub elapsed_minutes: Option<u32>,
    /// Printer-reported print start time. Preferred over any server-derived
    /// time because it survives reconnects and restarts.
    pub print_start_time: Option<DateTime<Utc>>,
    /// Raw vendor payload, kept for diagnostics only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl StatusUpdate {
    /// A bare snapshot with just a state. Used as a building block by drivers.
    pub fn new(printer_id: impl Into<String>, state: PrinterState) -> Self {
        Self {
            printer_id: printer_id.into(),
            state,
            message: None,
            temperature_bed: None,
            temperature_bed_target: None,
            temperature_nozzle: None,
            temperature_nozzle_target: None,
            progress: None,
            current_job: None,
            current_job_file_id: None,
            current_job_has_thumbnail: None,
            current_job_thumbnail_url: None,
            remaining_minutes: None,
            elapsed_minutes: None,
            print_start_time: None,
            raw: None,
            timestamp: Utc::now(),
        }
    }

    /// Error snapshot — `get_status` never fails, it returns one of these.
    pub fn error(printer_id: impl Into<String>, message: impl Into<String>) -> Self {
        let mut update = Self::new(printer_id, PrinterState::Error);
        update.message = Some(message.into());
        update
    }

    /// Clamp progress into [0, 100], converting a fractional 0..1 value to
    /// percent first.
    pub fn set_progress(&mut self, value: f64) {
        let percent = if value <= 1.0 && value > 0.0 {
            value * 100.0
        } else {
            value
        };
        self.progress = Some(percent.clamp(0.0, 100.0));
    }

    /// Derive the print start time from elapsed seconds when the vendor did
    /// not supply one directly.
    pub fn derive_start_time(&mut self, elapsed_seconds: i64) {
        self.elapsed_minutes = Some((elapsed_seconds / 60).max(0) as u32);
        if self.print_start_time.is_none() {
            self.print_start_time =
                Some(Utc::now() - chrono::Duration::seconds(elapsed_seconds));
        }
    }
}

/// File extension kinds the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    ThreeMf,
    Gcode,
    Bgcode,
    Stl,
    Obj,
    Ply,
    Unknown,
}

impl FileKind {
    pub fn from_filename(filename: &str) -> Self {
        let lower = filename.to_ascii_lowercase();
        match lower.rsplit('.').next() {
            Some("3mf") => Self::ThreeMf,
            Some("gcode") => Self::Gcode,
            Some("bgcode") => Self::Bgcode,
            Some("stl") => Self::Stl,
            Some("obj") => Self::Obj,
            Some("ply") => Self::Ply,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThreeMf => "3mf",
            Self::Gcode => "gcode",
            Self::Bgcode => "bgcode",
            Self::Stl => "stl",
            Self::Obj => "obj",
            Self::Ply => "ply",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "3mf" => Self::ThreeMf,
            "gcode" => Self::Gcode,
            "bgcode" => Self::Bgcode,
            "stl" => Self::Stl,
            "obj" => Self::Obj,
            "ply" => Self::Ply,
            _ => Self::Unknown,
        }
    }

    /// Whether this kind can carry an embedded thumbnail.
    pub fn has_embedded_thumbnails(&self) -> bool {
        matches!(self, Self::ThreeMf | Self::Gcode | Self::Bgcode)
    }

    /// Whether a preview can be rendered from the geometry itself.
    pub fn is_renderable_mesh(&self) -> bool {
        matches!(self, Self::Stl | Self::Obj)
    }
}

/// Where a file record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSource {
    Printer,
    LocalWatch,
    Upload,
}

impl FileSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Printer => "printer",
            Self::LocalWatch => "local_watch",
            Self::Upload => "upload",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "local_watch" => Self::LocalWatch,
            "upload" => Self::Upload,
            _ => Self::Printer,
        }
    }
}

/// Lifecycle status of a file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Available,
    Downloading,
    Downloaded,
    Failed,
    Unavailable,
    Deleted,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Failed => "failed",
            Self::Unavailable => "unavailable",
            Self::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "downloading" => Self::Downloading,
            "downloaded" => Self::Downloaded,
            "failed" => Self::Failed,
            "unavailable" => Self::Unavailable,
            "deleted" => Self::Deleted,
            _ => Self::Available,
        }
    }
}

/// How a thumbnail was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailSource {
    Embedded,
    Printer,
    Generated,
}

impl ThumbnailSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embedded => "embedded",
            Self::Printer => "printer",
            Self::Generated => "generated",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "embedded" => Some(Self::Embedded),
            "printer" => Some(Self::Printer),
            "generated" => Some(Self::Generated),
            _ => None,
        }
    }
}

/// Stored thumbnail blob with its dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Encoded format, e.g. "png".
    pub format: String,
    pub source: ThumbnailSource,
}

/// A file row as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterFileRecord {
    /// `{printer_id}_{filename}` for printer files, `local_{hash}` for
    /// watch-folder files.
    pub id: String,
    /// Owning printer id, or "local" for watch-folder files.
    pub printer_id: String,
    pub filename: String,
    pub display_name: String,
    pub size: Option<u64>,
    pub kind: FileKind,
    pub status: FileStatus,
    pub source: FileSource,
    /// Local filesystem path once downloaded or uploaded.
    pub file_path: Option<String>,
    pub watch_folder: Option<String>,
    pub relative_path: Option<String>,
    /// Vendor / parser metadata, merged over time without clobbering keys.
    pub metadata: Option<serde_json::Value>,
    pub download_progress: Option<u8>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub modified_time: Option<DateTime<Utc>>,
    pub thumbnail: Option<Thumbnail>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PrinterFileRecord {
    pub fn new_printer_file(printer_id: &str, filename: &str) -> Self {
        let now = Utc::now();
        Self {
            id: printer_file_id(printer_id, filename),
            printer_id: printer_id.to_string(),
            filename: filename.to_string(),
            display_name: filename.to_string(),
            size: None,
            kind: FileKind::from_filename(filename),
            status: FileStatus::Available,
            source: FileSource::Printer,
            file_path: None,
            watch_folder: None,
            relative_path: None,
            metadata: None,
            download_progress: None,
            downloaded_at: None,
            modified_time: None,
            thumbnail: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Invariant: `has_thumbnail` holds exactly when a blob with known
    /// dimensions is present.
    pub fn has_thumbnail(&self) -> bool {
        self.thumbnail.is_some()
    }
}

/// Composite file id for printer-resident files.
pub fn printer_file_id(printer_id: &str, filename: &str) -> String {
    format!("{printer_id}_{filename}")
}

/// File id for watch-folder files: a stable hash of the absolute path.
pub fn local_file_id(path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    let digest = hasher.finalize();
    format!("local_{}", &hex::encode(digest)[..16])
}

/// A file as listed by a printer driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFile {
    pub filename: String,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    /// Vendor-side path or download reference.
    pub path: String,
}

/// Lifecycle states of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    /// Whether this status counts as active for dedup and deletion guards.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Paused)
    }
}

/// Provenance metadata attached to auto-created jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerInfo {
    #[serde(default)]
    pub auto_created: bool,
    #[serde(default)]
    pub discovered_on_startup: bool,
    pub printer_start_time: Option<DateTime<Utc>>,
    pub discovery_time: Option<DateTime<Utc>>,
}

/// A print job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub printer_id: String,
    pub printer_kind: PrinterKind,
    /// Filename minus known 3D extensions.
    pub job_name: String,
    /// Raw filename as the printer reported it.
    pub filename: String,
    pub status: JobStatus,
    /// When the core first saw the job.
    pub created_at: DateTime<Utc>,
    /// Printer-reported start time — authoritative for dedup.
    pub start_time: Option<DateTime<Utc>>,
    pub progress: f64,
    pub file_id: Option<String>,
    pub customer_info: Option<CustomerInfo>,
}

/// Terminal and in-flight phases of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPhase {
    Starting,
    Downloading,
    Completed,
    Failed,
    NotFound,
}

impl DownloadPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::NotFound)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::NotFound => "not_found",
        }
    }
}

/// In-memory download state, keyed by file id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadState {
    pub phase: DownloadPhase,
    pub progress: u8,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub updated_at: DateTime<Utc>,
}

impl DownloadState {
    pub fn starting() -> Self {
        Self {
            phase: DownloadPhase::Starting,
            progress: 0,
            bytes_downloaded: 0,
            total_bytes: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Strip the Bambu `cache/` prefix from a reported filename.
pub fn clean_filename(filename: &str) -> &str {
    filename.strip_prefix("cache/").unwrap_or(filename)
}

/// Derive a job name: strip `cache/`, surrounding whitespace, and known 3D
/// extensions.
pub fn job_name_from_filename(filename: &str) -> String {
    let clean = clean_filename(filename.trim()).trim();
    let lower = clean.to_ascii_lowercase();
    for ext in [".gcode", ".bgcode", ".3mf", ".stl"] {
        if lower.ends_with(ext) {
            return clean[..clean.len() - ext.len()].to_string();
        }
    }
    clean.to_string()
}

/// Heuristic: does the filename carry a printable extension?
pub fn is_print_file(filename: &str) -> bool {
    matches!(
        FileKind::from_filename(filename),
        FileKind::Gcode | FileKind::Bgcode | FileKind::ThreeMf
    )
}
