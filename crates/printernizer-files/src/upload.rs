// SPDX-License-Identifier: AGPL-3.0-or-later
//
// File uploads into the library area. A batch never fails as a whole: each
// file is accepted or rejected on its own and the composite result reports
// both. Accepted files go through the same thumbnail pipeline as downloads,
// via the bus.

use std::path::PathBuf;

use chrono::Utc;
use tracing::{info, instrument, warn};

use printernizer_core::bus::{topics, EventBus};
use printernizer_core::error::{PrinternizerError, Result};
use printernizer_core::types::{
    local_file_id, FileKind, FileSource, FileStatus, PrinterFileRecord,
};
use printernizer_store::SharedStore;

use crate::download::validate_safe_path;

/// One file in an upload batch.
pub struct UploadFile {
    pub filename: String,
    pub content: Vec<u8>,
}

/// Per-file outcome.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UploadResult {
    pub filename: String,
    pub success: bool,
    pub file_id: Option<String>,
    pub error: Option<String>,
}

/// Batch outcome.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UploadBatchResult {
    pub accepted: usize,
    pub rejected: usize,
    pub results: Vec<UploadResult>,
}

pub struct UploadService {
    store: SharedStore,
    bus: EventBus,
    library_root: PathBuf,
    enabled: bool,
    max_size_bytes: u64,
}

impl UploadService {
    pub fn new(
        store: SharedStore,
        bus: EventBus,
        library_root: impl Into<PathBuf>,
        enabled: bool,
        max_size_mb: u64,
    ) -> Self {
        Self {
            store,
            bus,
            library_root: library_root.into(),
            enabled,
            max_size_bytes: max_size_mb * 1024 * 1024,
        }
    }

    /// Upload a batch of files. Returns per-file results; a single bad file
    /// never sinks the batch.
    #[instrument(skip(self, files), fields(count = files.len(), is_business))]
    pub async fn upload(
        &self,
        files: Vec<UploadFile>,
        is_business: bool,
        notes: Option<String>,
    ) -> Result<UploadBatchResult> {
        if !self.enabled {
            return Err(PrinternizerError::ConfigurationInvalid(
                "uploads are disabled".into(),
            ));
        }

        let mut results = Vec::with_capacity(files.len());
        for file in files {
            let filename = file.filename.clone();
            match self.accept_one(file, is_business, notes.as_deref()).await {
                Ok(file_id) => results.push(UploadResult {
                    filename,
                    success: true,
                    file_id: Some(file_id),
                    error: None,
                }),
                Err(e) => {
                    warn!(filename = %filename, error = %e, "upload rejected");
                    results.push(UploadResult {
                        filename,
                        success: false,
                        file_id: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let accepted = results.iter().filter(|r| r.success).count();
        let batch = UploadBatchResult {
            accepted,
            rejected: results.len() - accepted,
            results,
        };
        info!(accepted = batch.accepted, rejected = batch.rejected, "upload batch processed");
        Ok(batch)
    }

    async fn accept_one(
        &self,
        file: UploadFile,
        is_business: bool,
        notes: Option<&str>,
    ) -> Result<String> {
        if file.content.is_empty() {
            return Err(PrinternizerError::ProcessingFailed("empty file".into()));
        }
        if file.content.len() as u64 > self.max_size_bytes {
            return Err(PrinternizerError::ProcessingFailed(format!(
                "file exceeds the {} MB upload limit",
                self.max_size_bytes / (1024 * 1024)
            )));
        }
        if FileKind::from_filename(&file.filename) == FileKind::Unknown {
            return Err(PrinternizerError::ProcessingFailed(format!(
                "unsupported file extension: {}",
                file.filename
            )));
        }

        let destination = validate_safe_path(&self.library_root, &file.filename)?;
        if destination.exists() {
            return Err(PrinternizerError::DuplicateFile(file.filename.clone()));
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&destination, &file.content).await?;

        let path_str = destination.display().to_string();
        let now = Utc::now();
        let record = PrinterFileRecord {
            id: local_file_id(&path_str),
            printer_id: "local".into(),
            filename: file.filename.clone(),
            display_name: file.filename.clone(),
            size: Some(file.content.len() as u64),
            kind: FileKind::from_filename(&file.filename),
            status: FileStatus::Downloaded,
            source: FileSource::Upload,
            file_path: Some(path_str.clone()),
            watch_folder: None,
            relative_path: None,
            metadata: Some(serde_json::json!({
                "is_business": is_business,
                "notes": notes,
                "uploaded_at": now.to_rfc3339(),
            })),
            download_progress: Some(100),
            downloaded_at: Some(now),
            modified_time: None,
            thumbnail: None,
            created_at: now,
            updated_at: now,
        };
        self.store
            .lock()
            .expect("store lock poisoned")
            .upsert_file(&record)?;

        // Same post-processing path as downloads.
        self.bus.publish(
            topics::FILE_NEEDS_THUMBNAIL_PROCESSING,
            serde_json::json!({
                "file_id": record.id,
                "file_path": path_str,
            }),
        );
        self.bus.publish(
            topics::LIBRARY_ADD_REQUEST,
            serde_json::json!({
                "printer_id": "local",
                "filename": file.filename,
                "file_path": path_str,
            }),
        );

        info!(file_id = %record.id, filename = %file.filename, "file uploaded");
        Ok(record.id)
    }
}
