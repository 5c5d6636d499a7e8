// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Persistent store for the fleet core, backed by SQLite.
//
// The store holds printer rows, file rows (including thumbnail blobs and
// enhanced metadata columns), and job records. File content itself lives on
// disk — only paths and thumbnails are stored here.
//
// All methods are synchronous because `rusqlite` does not support async
// natively. Callers share the store as `Arc<Mutex<Store>>`; every statement
// is sub-millisecond so lock contention is negligible next to printer I/O.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, instrument};

use printernizer_core::config::PrinterConfig;
use printernizer_core::error::{PrinternizerError, Result};
use printernizer_core::types::{
    CustomerInfo, FileKind, FileSource, FileStatus, Job, JobId, JobStatus, PrinterFileRecord,
    PrinterKind, PrinterState, Thumbnail, ThumbnailSource,
};

/// Shared handle used by every service.
pub type SharedStore = Arc<Mutex<Store>>;

const CREATE_SCHEMA_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS printers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        ip_address TEXT NOT NULL,
        api_key TEXT,
        access_code TEXT,
        serial_number TEXT,
        webcam_url TEXT,
        location TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        current_status TEXT NOT NULL DEFAULT 'unknown',
        last_seen TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS files (
        id TEXT PRIMARY KEY,
        printer_id TEXT NOT NULL,
        filename TEXT NOT NULL,
        display_name TEXT NOT NULL,
        size INTEGER,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        source TEXT NOT NULL,
        file_path TEXT,
        watch_folder TEXT,
        relative_path TEXT,
        metadata TEXT,
        download_progress INTEGER,
        downloaded_at TEXT,
        modified_time TEXT,
        thumbnail BLOB,
        thumbnail_width INTEGER,
        thumbnail_height INTEGER,
        thumbnail_format TEXT,
        thumbnail_source TEXT,
        physical_properties TEXT,
        print_settings TEXT,
        material_requirements TEXT,
        cost_breakdown TEXT,
        quality_metrics TEXT,
        compatibility_info TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_files_printer_filename
        ON files (printer_id, filename);

    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        printer_id TEXT NOT NULL,
        printer_kind TEXT NOT NULL,
        job_name TEXT NOT NULL,
        filename TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        start_time TEXT,
        progress REAL NOT NULL DEFAULT 0,
        file_id TEXT,
        customer_info TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_jobs_printer_created
        ON jobs (printer_id, created_at DESC);

    CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_dedup
        ON jobs (printer_id, filename, start_time)
        WHERE start_time IS NOT NULL;
"#;

/// Six nullable JSON columns produced by enhanced metadata extraction.
#[derive(Debug, Clone, Default)]
pub struct EnhancedMetadataColumns {
    pub physical_properties: Option<serde_json::Value>,
    pub print_settings: Option<serde_json::Value>,
    pub material_requirements: Option<serde_json::Value>,
    pub cost_breakdown: Option<serde_json::Value>,
    pub quality_metrics: Option<serde_json::Value>,
    pub compatibility_info: Option<serde_json::Value>,
}

/// A printer row as persisted.
#[derive(Debug, Clone)]
pub struct PrinterRow {
    pub id: String,
    pub name: String,
    pub kind: PrinterKind,
    pub ip_address: String,
    pub webcam_url: Option<String>,
    pub location: Option<String>,
    pub is_active: bool,
    pub current_status: PrinterState,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The store. One open SQLite connection.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at the given path, applying WAL mode and
    /// the schema.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())
            .map_err(|e| PrinternizerError::Database(format!("open: {e}")))?;

        // WAL survives unclean shutdowns more gracefully and lets status
        // readers proceed while a monitor path is writing.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| PrinternizerError::Database(format!("WAL pragma: {e}")))?;

        conn.execute_batch(CREATE_SCHEMA_SQL)
            .map_err(|e| PrinternizerError::Database(format!("create schema: {e}")))?;

        info!("store opened");
        Ok(Self { conn })
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PrinternizerError::Database(format!("open in-memory: {e}")))?;
        conn.execute_batch(CREATE_SCHEMA_SQL)
            .map_err(|e| PrinternizerError::Database(format!("create schema: {e}")))?;
        debug!("in-memory store opened");
        Ok(Self { conn })
    }

    /// Convenience wrapper producing the shared handle.
    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    // -- Printers ------------------------------------------------------------

    /// Insert or update a printer's configuration fields. Runtime fields
    /// (`current_status`, `last_seen`) are preserved on update.
    #[instrument(skip(self, config), fields(printer_id = %config.id))]
    pub fn upsert_printer(&self, config: &PrinterConfig) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO printers
                 (id, name, kind, ip_address, api_key, access_code, serial_number,
                  webcam_url, location, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    kind = excluded.kind,
                    ip_address = excluded.ip_address,
                    api_key = excluded.api_key,
                    access_code = excluded.access_code,
                    serial_number = excluded.serial_number,
                    webcam_url = excluded.webcam_url,
                    location = excluded.location,
                    is_active = excluded.is_active,
                    updated_at = excluded.updated_at",
                params![
                    config.id,
                    config.name,
                    config.kind.as_str(),
                    config.ip_address,
                    config.api_key,
                    config.access_code,
                    config.serial_number,
                    config.webcam_url,
                    config.location,
                    config.is_active,
                    now,
                ],
            )
            .map_err(|e| PrinternizerError::Database(format!("upsert printer: {e}")))?;
        Ok(())
    }

    pub fn get_printer(&self, printer_id: &str) -> Result<Option<PrinterRow>> {
        self.conn
            .query_row(
                "SELECT id, name, kind, ip_address, webcam_url, location, is_active,
                        current_status, last_seen, created_at, updated_at
                 FROM printers WHERE id = ?1",
                params![printer_id],
                row_to_printer,
            )
            .optional()
            .map_err(|e| PrinternizerError::Database(format!("get printer: {e}")))
    }

    pub fn list_printers(&self) -> Result<Vec<PrinterRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, kind, ip_address, webcam_url, location, is_active,
                        current_status, last_seen, created_at, updated_at
                 FROM printers ORDER BY id",
            )
            .map_err(|e| PrinternizerError::Database(format!("prepare list printers: {e}")))?;
        let rows = stmt
            .query_map([], row_to_printer)
            .map_err(|e| PrinternizerError::Database(format!("list printers: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| PrinternizerError::Database(format!("collect printers: {e}")))?;
        Ok(rows)
    }

    /// Update a printer's normalized status and last-seen timestamp.
    pub fn update_printer_status(
        &self,
        printer_id: &str,
        state: PrinterState,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE printers SET current_status = ?1, last_seen = ?2, updated_at = ?2
                 WHERE id = ?3",
                params![state.as_str(), seen_at.to_rfc3339(), printer_id],
            )
            .map_err(|e| PrinternizerError::Database(format!("update printer status: {e}")))?;
        if rows == 0 {
            return Err(PrinternizerError::PrinterNotFound(printer_id.to_string()));
        }
        Ok(())
    }

    pub fn delete_printer(&self, printer_id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM printers WHERE id = ?1", params![printer_id])
            .map_err(|e| PrinternizerError::Database(format!("delete printer: {e}")))?;
        info!(printer_id, "printer row deleted");
        Ok(())
    }

    // -- Files ---------------------------------------------------------------

    /// Insert or refresh a file row. On update, thumbnails and metadata are
    /// preserved — discovery must never clear what processing has produced.
    #[instrument(skip(self, record), fields(file_id = %record.id))]
    pub fn upsert_file(&self, record: &PrinterFileRecord) -> Result<()> {
        let metadata = record
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO files
                 (id, printer_id, filename, display_name, size, kind, status, source,
                  file_path, watch_folder, relative_path, metadata, download_progress,
                  downloaded_at, modified_time, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)
                 ON CONFLICT(id) DO UPDATE SET
                    display_name = excluded.display_name,
                    size = excluded.size,
                    kind = excluded.kind,
                    status = CASE WHEN files.status = 'downloaded'
                                  THEN files.status ELSE excluded.status END,
                    source = excluded.source,
                    modified_time = excluded.modified_time,
                    updated_at = excluded.updated_at",
                params![
                    record.id,
                    record.printer_id,
                    record.filename,
                    record.display_name,
                    record.size.map(|s| s as i64),
                    record.kind.as_str(),
                    record.status.as_str(),
                    record.source.as_str(),
                    record.file_path,
                    record.watch_folder,
                    record.relative_path,
                    metadata,
                    record.download_progress,
                    record.downloaded_at.map(|t| t.to_rfc3339()),
                    record.modified_time.map(|t| t.to_rfc3339()),
                    now,
                ],
            )
            .map_err(|e| PrinternizerError::Database(format!("upsert file: {e}")))?;
        Ok(())
    }

    pub fn get_file(&self, file_id: &str) -> Result<Option<PrinterFileRecord>> {
        self.conn
            .query_row(
                &format!("{FILE_SELECT} WHERE id = ?1"),
                params![file_id],
                row_to_file,
            )
            .optional()
            .map_err(|e| PrinternizerError::Database(format!("get file: {e}")))
    }

    /// Lookup by `(printer_id, filename)` — the reconciliation hot path,
    /// backed by `idx_files_printer_filename`.
    pub fn find_file_by_name(
        &self,
        printer_id: &str,
        filename: &str,
    ) -> Result<Option<PrinterFileRecord>> {
        self.conn
            .query_row(
                &format!("{FILE_SELECT} WHERE printer_id = ?1 AND filename = ?2"),
                params![printer_id, filename],
                row_to_file,
            )
            .optional()
            .map_err(|e| PrinternizerError::Database(format!("find file by name: {e}")))
    }

    pub fn list_files(
        &self,
        printer_id: Option<&str>,
        source: Option<FileSource>,
    ) -> Result<Vec<PrinterFileRecord>> {
        let mut sql = FILE_SELECT.to_string();
        let mut clauses = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(pid) = printer_id {
            clauses.push(format!("printer_id = ?{}", args.len() + 1));
            args.push(Box::new(pid.to_string()));
        }
        if let Some(src) = source {
            clauses.push(format!("source = ?{}", args.len() + 1));
            args.push(Box::new(src.as_str().to_string()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY filename");

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| PrinternizerError::Database(format!("prepare list files: {e}")))?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                row_to_file,
            )
            .map_err(|e| PrinternizerError::Database(format!("list files: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| PrinternizerError::Database(format!("collect files: {e}")))?;
        Ok(rows)
    }

    /// Mark a file downloaded and record where it landed.
    pub fn mark_file_downloaded(
        &self,
        file_id: &str,
        file_path: &str,
        downloaded_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE files SET status = 'downloaded', file_path = ?1,
                        downloaded_at = ?2, download_progress = 100, updated_at = ?2
                 WHERE id = ?3",
                params![file_path, downloaded_at.to_rfc3339(), file_id],
            )
            .map_err(|e| PrinternizerError::Database(format!("mark downloaded: {e}")))?;
        Ok(())
    }

    pub fn set_file_status(&self, file_id: &str, status: FileStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE files SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), file_id],
            )
            .map_err(|e| PrinternizerError::Database(format!("set file status: {e}")))?;
        Ok(())
    }

    /// Store a thumbnail blob and its dimensions on the file row.
    pub fn set_file_thumbnail(&self, file_id: &str, thumbnail: &Thumbnail) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE files SET thumbnail = ?1, thumbnail_width = ?2,
                        thumbnail_height = ?3, thumbnail_format = ?4,
                        thumbnail_source = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    thumbnail.data,
                    thumbnail.width,
                    thumbnail.height,
                    thumbnail.format,
                    thumbnail.source.as_str(),
                    Utc::now().to_rfc3339(),
                    file_id,
                ],
            )
            .map_err(|e| PrinternizerError::Database(format!("set thumbnail: {e}")))?;
        if rows == 0 {
            return Err(PrinternizerError::FileNotFound(file_id.to_string()));
        }
        Ok(())
    }

    /// Merge new metadata keys into the file's JSON metadata. Existing keys
    /// win — processing never overwrites what is already known.
    pub fn merge_file_metadata(&self, file_id: &str, incoming: &serde_json::Value) -> Result<()> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT metadata FROM files WHERE id = ?1",
                params![file_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| PrinternizerError::Database(format!("read metadata: {e}")))?
            .flatten();

        let mut merged = incoming
            .as_object()
            .cloned()
            .unwrap_or_default();
        if let Some(raw) = existing {
            if let Ok(serde_json::Value::Object(current)) = serde_json::from_str(&raw) {
                for (key, value) in current {
                    merged.insert(key, value);
                }
            }
        }

        self.conn
            .execute(
                "UPDATE files SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
                params![
                    serde_json::Value::Object(merged).to_string(),
                    Utc::now().to_rfc3339(),
                    file_id,
                ],
            )
            .map_err(|e| PrinternizerError::Database(format!("merge metadata: {e}")))?;
        Ok(())
    }

    /// Write the six enhanced metadata columns. `None` groups are left NULL.
    pub fn set_enhanced_metadata(
        &self,
        file_id: &str,
        columns: &EnhancedMetadataColumns,
    ) -> Result<()> {
        let encode = |value: &Option<serde_json::Value>| value.as_ref().map(|v| v.to_string());
        self.conn
            .execute(
                "UPDATE files SET physical_properties = ?1, print_settings = ?2,
                        material_requirements = ?3, cost_breakdown = ?4,
                        quality_metrics = ?5, compatibility_info = ?6, updated_at = ?7
                 WHERE id = ?8",
                params![
                    encode(&columns.physical_properties),
                    encode(&columns.print_settings),
                    encode(&columns.material_requirements),
                    encode(&columns.cost_breakdown),
                    encode(&columns.quality_metrics),
                    encode(&columns.compatibility_info),
                    Utc::now().to_rfc3339(),
                    file_id,
                ],
            )
            .map_err(|e| PrinternizerError::Database(format!("set enhanced metadata: {e}")))?;
        Ok(())
    }

    /// Read the six enhanced metadata columns back.
    pub fn get_enhanced_metadata(&self, file_id: &str) -> Result<EnhancedMetadataColumns> {
        let row: Option<(
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
        )> = self
            .conn
            .query_row(
                "SELECT physical_properties, print_settings, material_requirements,
                        cost_breakdown, quality_metrics, compatibility_info
                 FROM files WHERE id = ?1",
                params![file_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| PrinternizerError::Database(format!("get enhanced metadata: {e}")))?;

        let (physical, print, material, cost, quality, compatibility) =
            row.ok_or_else(|| PrinternizerError::FileNotFound(file_id.to_string()))?;
        let decode = |raw: Option<String>| raw.and_then(|s| serde_json::from_str(&s).ok());
        Ok(EnhancedMetadataColumns {
            physical_properties: decode(physical),
            print_settings: decode(print),
            material_requirements: decode(material),
            cost_breakdown: decode(cost),
            quality_metrics: decode(quality),
            compatibility_info: decode(compatibility),
        })
    }

    pub fn delete_file(&self, file_id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM files WHERE id = ?1", params![file_id])
            .map_err(|e| PrinternizerError::Database(format!("delete file: {e}")))?;
        Ok(())
    }

    // -- Jobs ----------------------------------------------------------------

    /// Insert a job record. Returns `Ok(false)` when the dedup index rejected
    /// the row as a duplicate — the auto-job engine treats that as success.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub fn insert_job(&self, job: &Job) -> Result<bool> {
        let customer_info = job
            .customer_info
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = self.conn.execute(
            "INSERT INTO jobs
             (id, printer_id, printer_kind, job_name, filename, status, created_at,
              start_time, progress, file_id, customer_info)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                job.id.to_string(),
                job.printer_id,
                job.printer_kind.as_str(),
                job.job_name,
                job.filename,
                job.status.as_str(),
                job.created_at.to_rfc3339(),
                job.start_time.map(|t| t.to_rfc3339()),
                job.progress,
                job.file_id,
                customer_info,
            ],
        );

        match result {
            Ok(_) => {
                info!(job_id = %job.id, printer_id = %job.printer_id, "job inserted");
                Ok(true)
            }
            Err(e) if is_unique_violation(&e) => {
                debug!(job_id = %job.id, "job insert hit dedup index");
                Ok(false)
            }
            Err(e) => Err(PrinternizerError::Database(format!("insert job: {e}"))),
        }
    }

    pub fn get_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        self.conn
            .query_row(
                &format!("{JOB_SELECT} WHERE id = ?1"),
                params![job_id.to_string()],
                row_to_job,
            )
            .optional()
            .map_err(|e| PrinternizerError::Database(format!("get job: {e}")))
    }

    /// Recent jobs for a printer, newest first, optionally filtered by
    /// status.
    pub fn list_jobs(
        &self,
        printer_id: &str,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let limit = limit as i64;
        let rows = if let Some(status) = status {
            let sql = format!(
                "{JOB_SELECT} WHERE printer_id = ?1 AND status = ?2
                 ORDER BY created_at DESC LIMIT ?3"
            );
            let mut stmt = self
                .conn
                .prepare(&sql)
                .map_err(|e| PrinternizerError::Database(format!("prepare list jobs: {e}")))?;
            let result = stmt
                .query_map(params![printer_id, status.as_str(), limit], row_to_job)
                .map_err(|e| PrinternizerError::Database(format!("list jobs: {e}")))?
                .collect::<std::result::Result<Vec<_>, _>>();
            result
        } else {
            let sql = format!(
                "{JOB_SELECT} WHERE printer_id = ?1 ORDER BY created_at DESC LIMIT ?2"
            );
            let mut stmt = self
                .conn
                .prepare(&sql)
                .map_err(|e| PrinternizerError::Database(format!("prepare list jobs: {e}")))?;
            let result = stmt
                .query_map(params![printer_id, limit], row_to_job)
                .map_err(|e| PrinternizerError::Database(format!("list jobs: {e}")))?
                .collect::<std::result::Result<Vec<_>, _>>();
            result
        }
        .map_err(|e| PrinternizerError::Database(format!("collect jobs: {e}")))?;
        Ok(rows)
    }

    /// Jobs currently counted as active (`pending`, `running`, `paused`).
    pub fn count_active_jobs(&self, printer_id: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM jobs
                 WHERE printer_id = ?1 AND status IN ('pending', 'running', 'paused')",
                params![printer_id],
                |row| row.get(0),
            )
            .map_err(|e| PrinternizerError::Database(format!("count active jobs: {e}")))?;
        Ok(count as usize)
    }

    pub fn update_job_status(&self, job_id: &JobId, status: JobStatus) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE jobs SET status = ?1 WHERE id = ?2",
                params![status.as_str(), job_id.to_string()],
            )
            .map_err(|e| PrinternizerError::Database(format!("update job status: {e}")))?;
        if rows == 0 {
            return Err(PrinternizerError::Database(format!(
                "job {job_id} not found"
            )));
        }
        Ok(())
    }

    pub fn update_job_progress(&self, job_id: &JobId, progress: f64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET progress = ?1 WHERE id = ?2",
                params![progress.clamp(0.0, 100.0), job_id.to_string()],
            )
            .map_err(|e| PrinternizerError::Database(format!("update job progress: {e}")))?;
        Ok(())
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const FILE_SELECT: &str = "SELECT id, printer_id, filename, display_name, size, kind, status,
        source, file_path, watch_folder, relative_path, metadata, download_progress,
        downloaded_at, modified_time, thumbnail, thumbnail_width, thumbnail_height,
        thumbnail_format, thumbnail_source, created_at, updated_at
 FROM files";

const JOB_SELECT: &str = "SELECT id, printer_id, printer_kind, job_name, filename, status,
        created_at, start_time, progress, file_id, customer_info
 FROM jobs";

fn parse_timestamp(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_optional_timestamp(
    raw: Option<String>,
    column: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_timestamp(&s, column)).transpose()
}

fn row_to_printer(row: &rusqlite::Row<'_>) -> rusqlite::Result<PrinterRow> {
    let kind_str: String = row.get(2)?;
    let status_str: String = row.get(7)?;
    Ok(PrinterRow {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: PrinterKind::from_str(&kind_str).unwrap_or(PrinterKind::PrusaCore),
        ip_address: row.get(3)?,
        webcam_url: row.get(4)?,
        location: row.get(5)?,
        is_active: row.get(6)?,
        current_status: PrinterState::from_str(&status_str),
        last_seen: parse_optional_timestamp(row.get(8)?, 8)?,
        created_at: parse_timestamp(&row.get::<_, String>(9)?, 9)?,
        updated_at: parse_timestamp(&row.get::<_, String>(10)?, 10)?,
    })
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<PrinterFileRecord> {
    let kind: String = row.get(5)?;
    let status: String = row.get(6)?;
    let source: String = row.get(7)?;
    let metadata: Option<String> = row.get(11)?;
    let thumbnail_blob: Option<Vec<u8>> = row.get(15)?;

    let thumbnail = match thumbnail_blob {
        Some(data) => {
            let width: Option<u32> = row.get(16)?;
            let height: Option<u32> = row.get(17)?;
            let format: Option<String> = row.get(18)?;
            let source_str: Option<String> = row.get(19)?;
            match (width, height) {
                (Some(width), Some(height)) => Some(Thumbnail {
                    data,
                    width,
                    height,
                    format: format.unwrap_or_else(|| "png".into()),
                    source: source_str
                        .as_deref()
                        .and_then(ThumbnailSource::from_str)
                        .unwrap_or(ThumbnailSource::Embedded),
                }),
                // Blob without dimensions violates the thumbnail invariant;
                // treat the row as having none.
                _ => None,
            }
        }
        None => None,
    };

    Ok(PrinterFileRecord {
        id: row.get(0)?,
        printer_id: row.get(1)?,
        filename: row.get(2)?,
        display_name: row.get(3)?,
        size: row.get::<_, Option<i64>>(4)?.map(|s| s as u64),
        kind: FileKind::from_str(&kind),
        status: FileStatus::from_str(&status),
        source: FileSource::from_str(&source),
        file_path: row.get(8)?,
        watch_folder: row.get(9)?,
        relative_path: row.get(10)?,
        metadata: metadata.and_then(|raw| serde_json::from_str(&raw).ok()),
        download_progress: row.get(12)?,
        downloaded_at: parse_optional_timestamp(row.get(13)?, 13)?,
        modified_time: parse_optional_timestamp(row.get(14)?, 14)?,
        thumbnail,
        created_at: parse_timestamp(&row.get::<_, String>(20)?, 20)?,
        updated_at: parse_timestamp(&row.get::<_, String>(21)?, 21)?,
    })
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let id_str: String = row.get(0)?;
    let uuid = uuid::Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let kind_str: String = row.get(2)?;
    let status_str: String = row.get(5)?;
    let customer_info: Option<String> = row.get(10)?;

    Ok(Job {
        id: JobId(uuid),
        printer_id: row.get(1)?,
        printer_kind: PrinterKind::from_str(&kind_str).unwrap_or(PrinterKind::PrusaCore),
        job_name: row.get(3)?,
        filename: row.get(4)?,
        status: JobStatus::from_str(&status_str),
        created_at: parse_timestamp(&row.get::<_, String>(6)?, 6)?,
        start_time: parse_optional_timestamp(row.get(7)?, 7)?,
        progress: row.get(8)?,
        file_id: row.get(9)?,
        customer_info: customer_info
            .and_then(|raw| serde_json::from_str::<CustomerInfo>(&raw).ok()),
    })
}
