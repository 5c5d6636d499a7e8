// SPDX-License-Identifier: AGPL-3.0-or-later
//
// File discovery: list files on a printer, upsert them into the store, and
// reconcile with what was known before. Removals are marked unavailable —
// discovery never deletes rows, and the upsert never clears thumbnails or
// metadata that processing has already produced.

use std::path::Path;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use printernizer_core::bus::{topics, EventBus};
use printernizer_core::error::Result;
use printernizer_core::types::{
    local_file_id, FileKind, FileSource, FileStatus, PrinterFileRecord,
};
use printernizer_drivers::DriverProvider;
use printernizer_store::SharedStore;
use std::sync::Arc;

/// Outcome of one sync pass over a printer.
#[derive(Debug, Clone)]
pub struct SyncResult {
    pub total_files: usize,
    pub added_files: usize,
    pub removed_files: usize,
}

pub struct FileDiscoveryService {
    store: SharedStore,
    bus: EventBus,
    drivers: Arc<dyn DriverProvider>,
}

impl FileDiscoveryService {
    pub fn new(store: SharedStore, bus: EventBus, drivers: Arc<dyn DriverProvider>) -> Self {
        Self { store, bus, drivers }
    }

    /// Ask the printer for its file list and upsert every entry. Publishes
    /// `files_discovered` with the stored rows.
    #[instrument(skip(self), fields(printer_id))]
    pub async fn discover_printer_files(
        &self,
        printer_id: &str,
    ) -> Result<Vec<PrinterFileRecord>> {
        let driver = self
            .drivers
            .driver(printer_id)
            .ok_or_else(|| {
                printernizer_core::error::PrinternizerError::PrinterNotFound(
                    printer_id.to_string(),
                )
            })?;

        let listed = match driver.list_files().await {
            Ok(files) => files,
            Err(e) => {
                // Fall back to what the store already knows.
                warn!(error = %e, "file listing failed, serving stored rows");
                let store = self.store.lock().expect("store lock poisoned");
                return store.list_files(Some(printer_id), Some(FileSource::Printer));
            }
        };

        let mut stored = Vec::with_capacity(listed.len());
        {
            let store = self.store.lock().expect("store lock poisoned");
            for remote in &listed {
                let mut record =
                    PrinterFileRecord::new_printer_file(printer_id, &remote.filename);
                record.size = remote.size;
                record.modified_time = remote.modified;
                if let Err(e) = store.upsert_file(&record) {
                    error!(filename = %remote.filename, error = %e, "file upsert failed");
                    continue;
                }
                stored.push(record);
            }
        }

        info!(count = stored.len(), "discovered printer files");
        self.bus.publish(
            topics::FILES_DISCOVERED,
            serde_json::json!({
                "printer_id": printer_id,
                "files": stored
                    .iter()
                    .map(|f| serde_json::json!({
                        "id": f.id,
                        "filename": f.filename,
                        "size": f.size,
                        "kind": f.kind.as_str(),
                    }))
                    .collect::<Vec<_>>(),
                "count": stored.len(),
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );

        Ok(stored)
    }

    /// Full sync: discover, then mark files that disappeared from the
    /// printer as unavailable. Publishes `file_sync_complete`.
    #[instrument(skip(self), fields(printer_id))]
    pub async fn sync_printer_files(&self, printer_id: &str) -> Result<SyncResult> {
        let known_before: Vec<PrinterFileRecord> = {
            let store = self.store.lock().expect("store lock poisoned");
            store.list_files(Some(printer_id), Some(FileSource::Printer))?
        };

        let current = self.discover_printer_files(printer_id).await?;

        let current_names: std::collections::HashSet<&str> =
            current.iter().map(|f| f.filename.as_str()).collect();
        let known_names: std::collections::HashSet<&str> =
            known_before.iter().map(|f| f.filename.as_str()).collect();

        let added = current_names.difference(&known_names).count();
        let mut removed = 0;
        {
            let store = self.store.lock().expect("store lock poisoned");
            for old in &known_before {
                if !current_names.contains(old.filename.as_str())
                    && old.status != FileStatus::Unavailable
                {
                    store.set_file_status(&old.id, FileStatus::Unavailable)?;
                    removed += 1;
                }
            }
        }

        let result = SyncResult {
            total_files: current.len(),
            added_files: added,
            removed_files: removed,
        };
        info!(
            total = result.total_files,
            added = result.added_files,
            removed = result.removed_files,
            "file sync complete"
        );

        self.bus.publish(
            topics::FILE_SYNC_COMPLETE,
            serde_json::json!({
                "printer_id": printer_id,
                "success": true,
                "total_files": result.total_files,
                "added_files": result.added_files,
                "removed_files": result.removed_files,
                "sync_time": Utc::now().to_rfc3339(),
            }),
        );

        Ok(result)
    }

    /// Scan a watch folder and upsert its printable files with `local_`
    /// hashed ids.
    #[instrument(skip(self, folder), fields(folder = %folder.as_ref().display()))]
    pub fn scan_watch_folder(&self, folder: impl AsRef<Path>) -> Result<Vec<PrinterFileRecord>> {
        let folder = folder.as_ref();
        let mut records = Vec::new();

        let entries = std::fs::read_dir(folder)?;
        let store = self.store.lock().expect("store lock poisoned");
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if FileKind::from_filename(filename) == FileKind::Unknown {
                continue;
            }

            let path_str = path.display().to_string();
            let now = Utc::now();
            let record = PrinterFileRecord {
                id: local_file_id(&path_str),
                printer_id: "local".into(),
                filename: filename.to_string(),
                display_name: filename.to_string(),
                size: entry.metadata().ok().map(|m| m.len()),
                kind: FileKind::from_filename(filename),
                status: FileStatus::Available,
                source: FileSource::LocalWatch,
                file_path: Some(path_str),
                watch_folder: Some(folder.display().to_string()),
                relative_path: Some(filename.to_string()),
                metadata: None,
                download_progress: None,
                downloaded_at: None,
                modified_time: None,
                thumbnail: None,
                created_at: now,
                updated_at: now,
            };
            store.upsert_file(&record)?;
            records.push(record);
        }

        info!(count = records.len(), "scanned watch folder");
        Ok(records)
    }

    /// Find a stored file by `(printer_id, filename)`.
    pub fn find_file_by_name(
        &self,
        printer_id: &str,
        filename: &str,
    ) -> Result<Option<PrinterFileRecord>> {
        let store = self.store.lock().expect("store lock poisoned");
        store.find_file_by_name(printer_id, filename)
    }

    /// Delete a file. The default is a soft delete (status change); a hard
    /// delete removes the row and any downloaded copy on disk.
    #[instrument(skip(self), fields(file_id, hard))]
    pub fn delete_file(&self, file_id: &str, hard: bool) -> Result<()> {
        let row = {
            let store = self.store.lock().expect("store lock poisoned");
            store
                .get_file(file_id)?
                .ok_or_else(|| {
                    printernizer_core::error::PrinternizerError::FileNotFound(
                        file_id.to_string(),
                    )
                })?
        };

        if hard {
            if let Some(path) = &row.file_path {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path, error = %e, "could not remove file from disk");
                }
            }
            let store = self.store.lock().expect("store lock poisoned");
            store.delete_file(file_id)?;
        } else {
            let store = self.store.lock().expect("store lock poisoned");
            store.set_file_status(file_id, FileStatus::Deleted)?;
        }

        self.bus.publish(
            topics::FILE_DELETED,
            serde_json::json!({
                "file_id": file_id,
                "printer_id": row.printer_id,
                "filename": row.filename,
                "hard": hard,
            }),
        );
        info!("file deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use printernizer_core::config::PrinterConfig;
    use printernizer_core::error::PrinternizerError;
    use printernizer_core::types::{PrinterKind, RemoteFile, StatusUpdate, Thumbnail, ThumbnailSource};
    use printernizer_drivers::{PrinterDriver, StatusSink};
    use printernizer_store::Store;
    use std::sync::Mutex;

    /// Driver stub that serves a fixed file list.
    struct ListingDriver {
        id: String,
        files: Mutex<Vec<RemoteFile>>,
    }

    #[async_trait]
    impl PrinterDriver for ListingDriver {
        fn printer_id(&self) -> &str {
            &self.id
        }
        fn kind(&self) -> PrinterKind {
            PrinterKind::PrusaCore
        }
        async fn connect(&self) -> printernizer_core::error::Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> printernizer_core::error::Result<()> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn get_status(&self) -> StatusUpdate {
            StatusUpdate::new(&self.id, printernizer_core::types::PrinterState::Online)
        }
        async fn list_files(&self) -> printernizer_core::error::Result<Vec<RemoteFile>> {
            Ok(self.files.lock().expect("files").clone())
        }
        async fn download_file(
            &self,
            _filename: &str,
            _local_path: &Path,
        ) -> printernizer_core::error::Result<()> {
            Err(PrinternizerError::DownloadFailed("stub".into()))
        }
        async fn pause(&self) -> printernizer_core::error::Result<()> {
            Ok(())
        }
        async fn resume(&self) -> printernizer_core::error::Result<()> {
            Ok(())
        }
        async fn stop(&self) -> printernizer_core::error::Result<()> {
            Ok(())
        }
        fn has_camera(&self) -> bool {
            false
        }
        fn camera_stream_url(&self) -> Option<String> {
            None
        }
        async fn take_snapshot(&self) -> printernizer_core::error::Result<Option<Vec<u8>>> {
            Ok(None)
        }
        fn set_status_sink(&self, _sink: StatusSink) {}
        async fn start_monitoring(&self) -> printernizer_core::error::Result<()> {
            Ok(())
        }
        async fn stop_monitoring(&self) {}
    }

    struct SingleDriverProvider(Arc<ListingDriver>);

    impl DriverProvider for SingleDriverProvider {
        fn driver(&self, printer_id: &str) -> Option<Arc<dyn PrinterDriver>> {
            (printer_id == self.0.id).then(|| self.0.clone() as Arc<dyn PrinterDriver>)
        }
    }

    fn remote(filename: &str) -> RemoteFile {
        RemoteFile {
            filename: filename.into(),
            size: Some(1024),
            modified: None,
            path: filename.into(),
        }
    }

    fn service_with_files(files: Vec<RemoteFile>) -> (FileDiscoveryService, SharedStore, EventBus) {
        let store = Store::open_in_memory().expect("store").into_shared();
        let bus = EventBus::new();
        let driver = Arc::new(ListingDriver {
            id: "p1".into(),
            files: Mutex::new(files),
        });
        let service = FileDiscoveryService::new(
            store.clone(),
            bus.clone(),
            Arc::new(SingleDriverProvider(driver)),
        );
        (service, store, bus)
    }

    #[tokio::test]
    async fn discovery_stores_files_and_publishes() {
        let (service, store, bus) = service_with_files(vec![remote("a.3mf"), remote("b.gcode")]);
        let mut events = bus.subscribe(topics::FILES_DISCOVERED);

        let files = service.discover_printer_files("p1").await.expect("discover");
        assert_eq!(files.len(), 2);

        let rows = store
            .lock()
            .expect("store")
            .list_files(Some("p1"), None)
            .expect("list");
        assert_eq!(rows.len(), 2);

        let event = events.recv().await.expect("event");
        assert_eq!(event.payload["count"], 2);
    }

    #[tokio::test]
    async fn sync_marks_vanished_files_unavailable() {
        let (service, store, bus) = service_with_files(vec![remote("keep.3mf"), remote("gone.3mf")]);
        let mut events = bus.subscribe(topics::FILE_SYNC_COMPLETE);

        service.sync_printer_files("p1").await.expect("first sync");

        // The printer now only reports keep.3mf — a second service over the
        // same store stands in for the changed listing.
        let driver = Arc::new(ListingDriver {
            id: "p1".into(),
            files: Mutex::new(vec![remote("keep.3mf")]),
        });
        let service2 = FileDiscoveryService::new(
            store.clone(),
            bus.clone(),
            Arc::new(SingleDriverProvider(driver)),
        );
        let result = service2.sync_printer_files("p1").await.expect("second sync");
        assert_eq!(result.total_files, 1);
        assert_eq!(result.removed_files, 1);

        let gone = store
            .lock()
            .expect("store")
            .find_file_by_name("p1", "gone.3mf")
            .expect("query")
            .expect("row kept");
        assert_eq!(gone.status, FileStatus::Unavailable);

        // Two sync events, one per pass.
        let _ = events.recv().await.expect("first event");
        let second = events.recv().await.expect("second event");
        assert_eq!(second.payload["removed_files"], 1);
    }

    #[tokio::test]
    async fn rediscovery_preserves_thumbnails() {
        let (service, store, _bus) = service_with_files(vec![remote("a.3mf")]);
        service.discover_printer_files("p1").await.expect("discover");

        {
            let store = store.lock().expect("store");
            store
                .set_file_thumbnail(
                    "p1_a.3mf",
                    &Thumbnail {
                        data: vec![9, 9],
                        width: 200,
                        height: 200,
                        format: "png".into(),
                        source: ThumbnailSource::Embedded,
                    },
                )
                .expect("thumbnail");
        }

        service.discover_printer_files("p1").await.expect("rediscover");
        let row = store
            .lock()
            .expect("store")
            .get_file("p1_a.3mf")
            .expect("get")
            .expect("row");
        assert!(row.has_thumbnail());
    }

    #[tokio::test]
    async fn soft_delete_keeps_row_and_publishes() {
        let (service, store, bus) = service_with_files(vec![remote("a.3mf")]);
        service.discover_printer_files("p1").await.expect("discover");
        let mut events = bus.subscribe(topics::FILE_DELETED);

        service.delete_file("p1_a.3mf", false).expect("soft delete");

        let row = store
            .lock()
            .expect("store")
            .get_file("p1_a.3mf")
            .expect("get")
            .expect("row kept");
        assert_eq!(row.status, FileStatus::Deleted);

        let event = events.recv().await.expect("event");
        assert_eq!(event.payload["hard"], false);
    }

    #[tokio::test]
    async fn hard_delete_removes_row_and_disk_file() {
        let (service, store, _bus) = service_with_files(vec![remote("a.3mf")]);
        service.discover_printer_files("p1").await.expect("discover");

        // Simulate a completed download so a disk file exists.
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.3mf");
        std::fs::write(&path, b"content").expect("write");
        store
            .lock()
            .expect("store")
            .mark_file_downloaded("p1_a.3mf", &path.display().to_string(), chrono::Utc::now())
            .expect("mark");

        service.delete_file("p1_a.3mf", true).expect("hard delete");

        assert!(store
            .lock()
            .expect("store")
            .get_file("p1_a.3mf")
            .expect("get")
            .is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn watch_folder_scan_assigns_local_ids() {
        let (service, store, _bus) = service_with_files(vec![]);
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("cube.stl"), b"solid cube").expect("write");
        std::fs::write(dir.path().join("notes.txt"), b"ignore me").expect("write");

        let records = service.scan_watch_folder(dir.path()).expect("scan");
        assert_eq!(records.len(), 1);
        assert!(records[0].id.starts_with("local_"));
        assert_eq!(records[0].source, FileSource::LocalWatch);

        let rows = store
            .lock()
            .expect("store")
            .list_files(Some("local"), Some(FileSource::LocalWatch))
            .expect("list");
        assert_eq!(rows.len(), 1);
    }
}
