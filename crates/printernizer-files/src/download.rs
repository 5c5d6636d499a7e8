// SPDX-License-Identifier: AGPL-3.0-or-later
//
// File downloads. `download_file` is the one and only download entry point:
// it owns the in-memory download state, validates the destination against
// the downloads root, drives the printer driver, verifies the result, and
// publishes the download events that feed thumbnail processing.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use printernizer_core::bus::{topics, EventBus};
use printernizer_core::error::{PrinternizerError, Result};
use printernizer_core::types::{
    printer_file_id, DownloadPhase, DownloadState, PrinterFileRecord,
};
use printernizer_drivers::DriverProvider;
use printernizer_store::SharedStore;

/// Result of a successful download, as returned to callers.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub file_id: String,
    pub local_path: PathBuf,
    pub file_size: u64,
}

pub struct DownloadManager {
    store: SharedStore,
    bus: EventBus,
    drivers: Arc<dyn DriverProvider>,
    downloads_root: PathBuf,
    states: Mutex<HashMap<String, DownloadState>>,
}

impl DownloadManager {
    pub fn new(
        store: SharedStore,
        bus: EventBus,
        drivers: Arc<dyn DriverProvider>,
        downloads_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            bus,
            drivers,
            downloads_root: downloads_root.into(),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Download a file from a printer.
    ///
    /// The destination defaults to `{downloads_root}/{printer_id}/{filename}`
    /// and is always validated against the downloads root — a filename that
    /// resolves outside it is refused before anything touches the disk.
    #[instrument(skip(self, destination), fields(printer_id, filename))]
    pub async fn download_file(
        &self,
        printer_id: &str,
        filename: &str,
        destination: Option<PathBuf>,
    ) -> Result<DownloadOutcome> {
        let file_id = printer_file_id(printer_id, filename);
        self.set_state(&file_id, DownloadState::starting());

        let destination = match destination {
            Some(path) => path,
            None => {
                match self.resolve_destination(printer_id, filename) {
                    Ok(path) => path,
                    Err(e) => {
                        // Path traversal: refused before the start event and
                        // before anything touches the disk.
                        self.fail(&file_id, printer_id, filename, &e).await;
                        return Err(e);
                    }
                }
            }
        };

        info!(destination = %destination.display(), "starting file download");
        self.bus.publish(
            topics::FILE_DOWNLOAD_STARTED,
            serde_json::json!({
                "printer_id": printer_id,
                "filename": filename,
                "file_id": file_id,
                "destination": destination.display().to_string(),
            }),
        );
        self.update_phase(&file_id, DownloadPhase::Downloading);
        self.broadcast_progress(&file_id);

        let driver = match self.drivers.driver(printer_id) {
            Some(driver) => driver,
            None => {
                let e = PrinternizerError::PrinterNotFound(printer_id.to_string());
                self.fail(&file_id, printer_id, filename, &e).await;
                return Err(e);
            }
        };

        if let Err(e) = driver.download_file(filename, &destination).await {
            self.fail(&file_id, printer_id, filename, &e).await;
            return Err(e);
        }

        // Verify the driver actually produced a file with content.
        let file_size = match tokio::fs::metadata(&destination).await {
            Ok(meta) if meta.len() > 0 => meta.len(),
            Ok(_) => {
                let e = PrinternizerError::DownloadFailed(
                    "download completed but file is empty".into(),
                );
                self.fail(&file_id, printer_id, filename, &e).await;
                return Err(e);
            }
            Err(_) => {
                let e = PrinternizerError::DownloadFailed(
                    "download completed but file not found".into(),
                );
                self.fail(&file_id, printer_id, filename, &e).await;
                return Err(e);
            }
        };

        let destination_str = destination.display().to_string();
        {
            let store = self.store.lock().expect("store lock poisoned");
            // The row may not exist yet if discovery has not run for this
            // printer — create it so the download is never orphaned.
            if store.get_file(&file_id)?.is_none() {
                store.upsert_file(&PrinterFileRecord::new_printer_file(printer_id, filename))?;
            }
            store.mark_file_downloaded(&file_id, &destination_str, Utc::now())?;
        }

        self.complete(&file_id, file_size);

        // Ordering contract: completion is announced before the thumbnail
        // handoff for the same file.
        self.bus.publish(
            topics::FILE_DOWNLOAD_COMPLETE,
            serde_json::json!({
                "printer_id": printer_id,
                "filename": filename,
                "file_id": file_id,
                "local_path": destination_str,
                "file_size": file_size,
            }),
        );
        self.bus.publish(
            topics::FILE_NEEDS_THUMBNAIL_PROCESSING,
            serde_json::json!({
                "file_id": file_id,
                "file_path": destination_str,
            }),
        );
        self.bus.publish(
            topics::LIBRARY_ADD_REQUEST,
            serde_json::json!({
                "printer_id": printer_id,
                "filename": filename,
                "file_path": destination_str,
            }),
        );

        info!(size_bytes = file_size, "file download completed");
        Ok(DownloadOutcome {
            file_id,
            local_path: destination,
            file_size,
        })
    }

    /// Current download state for a file, falling back to the persisted row
    /// for downloads from earlier runs.
    pub fn download_status(&self, file_id: &str) -> serde_json::Value {
        if let Some(state) = self
            .states
            .lock()
            .expect("state lock poisoned")
            .get(file_id)
        {
            return serde_json::json!({
                "file_id": file_id,
                "status": state.phase.as_str(),
                "progress": state.progress,
                "bytes_downloaded": state.bytes_downloaded,
                "total_bytes": state.total_bytes,
            });
        }

        let row = self
            .store
            .lock()
            .expect("store lock poisoned")
            .get_file(file_id)
            .ok()
            .flatten();
        match row {
            Some(file) => serde_json::json!({
                "file_id": file_id,
                "status": file.status.as_str(),
                "progress": file.download_progress.unwrap_or(0),
                "downloaded_at": file.downloaded_at.map(|t| t.to_rfc3339()),
                "local_path": file.file_path,
            }),
            None => serde_json::json!({
                "file_id": file_id,
                "status": DownloadPhase::NotFound.as_str(),
                "progress": 0,
            }),
        }
    }

    /// Drop terminal download states older than the threshold so the map
    /// does not grow for the lifetime of the process.
    pub fn cleanup_download_status(&self, max_age_hours: i64) {
        let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours);
        let mut states = self.states.lock().expect("state lock poisoned");
        let before = states.len();
        states.retain(|_, state| !(state.phase.is_terminal() && state.updated_at < cutoff));
        let removed = before - states.len();
        if removed > 0 {
            info!(removed, "cleaned up download status entries");
        }
    }

    /// Snapshot of every tracked download (for status endpoints).
    pub fn all_download_states(&self) -> HashMap<String, DownloadState> {
        self.states.lock().expect("state lock poisoned").clone()
    }

    // -- internal ------------------------------------------------------------

    fn resolve_destination(&self, printer_id: &str, filename: &str) -> Result<PathBuf> {
        let base = self.downloads_root.join(printer_id);
        validate_safe_path(&base, filename)
    }

    fn set_state(&self, file_id: &str, state: DownloadState) {
        self.states
            .lock()
            .expect("state lock poisoned")
            .insert(file_id.to_string(), state);
    }

    fn update_phase(&self, file_id: &str, phase: DownloadPhase) {
        if let Some(state) = self
            .states
            .lock()
            .expect("state lock poisoned")
            .get_mut(file_id)
        {
            state.phase = phase;
            state.updated_at = Utc::now();
        }
    }

    fn complete(&self, file_id: &str, file_size: u64) {
        if let Some(state) = self
            .states
            .lock()
            .expect("state lock poisoned")
            .get_mut(file_id)
        {
            state.phase = DownloadPhase::Completed;
            state.progress = 100;
            state.bytes_downloaded = file_size;
            state.total_bytes = file_size;
            state.updated_at = Utc::now();
        }
        self.broadcast_progress(file_id);
    }

    async fn fail(
        &self,
        file_id: &str,
        printer_id: &str,
        filename: &str,
        error: &PrinternizerError,
    ) {
        error!(%error, "file download failed");
        self.update_phase(file_id, DownloadPhase::Failed);
        self.broadcast_progress(file_id);

        let kind = match error {
            PrinternizerError::PathTraversal(_) => "path_traversal",
            PrinternizerError::PrinterNotFound(_) => "printer_not_found",
            _ => "download_failed",
        };
        self.bus.publish(
            topics::FILE_DOWNLOAD_FAILED,
            serde_json::json!({
                "printer_id": printer_id,
                "filename": filename,
                "file_id": file_id,
                "error": error.to_string(),
                "error_kind": kind,
            }),
        );
    }

    /// Progress broadcast for UI consumption. Failures here must never reach
    /// the download itself.
    fn broadcast_progress(&self, file_id: &str) {
        let state = self
            .states
            .lock()
            .expect("state lock poisoned")
            .get(file_id)
            .cloned();
        if let Some(state) = state {
            self.bus.publish(
                topics::SYSTEM_EVENT,
                serde_json::json!({
                    "type": "download_progress",
                    "download_id": file_id,
                    "status": state.phase.as_str(),
                    "progress": state.progress,
                    "bytes_downloaded": state.bytes_downloaded,
                    "total_bytes": state.total_bytes,
                }),
            );
        } else {
            debug!(file_id, "no download state to broadcast");
        }
    }
}

/// Resolve `base_dir/filename` and reject anything that escapes `base_dir`.
///
/// Works lexically (no filesystem access) so the check also holds before the
/// base directory exists.
pub fn validate_safe_path(base_dir: &Path, filename: &str) -> Result<PathBuf> {
    let candidate = base_dir.join(filename);
    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(PrinternizerError::PathTraversal(filename.to_string()));
                }
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }

    let mut base_normalized = PathBuf::new();
    for component in base_dir.components() {
        match component {
            Component::ParentDir => {
                base_normalized.pop();
            }
            Component::CurDir => {}
            other => base_normalized.push(other),
        }
    }

    if !normalized.starts_with(&base_normalized) {
        warn!(filename, "path traversal attempt rejected");
        return Err(PrinternizerError::PathTraversal(filename.to_string()));
    }
    Ok(normalized)
}
