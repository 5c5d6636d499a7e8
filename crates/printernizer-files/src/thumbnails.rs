// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Thumbnail processing. Sources, in priority order:
//   1. embedded thumbnails in 3MF / G-code files
//   2. the printer's thumbnail API (Prusa)
//   3. a generated mesh preview (STL, OBJ)
//
// The stage subscribes to `file_needs_thumbnail_processing` on the bus, so
// downloads and uploads feed it without calling it directly. Every attempt
// lands in a rolling in-memory log of the last 50 entries.

use std::collections::VecDeque;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use printernizer_core::bus::{topics, EventBus};
use printernizer_core::error::{PrinternizerError, Result};
use printernizer_core::types::{FileKind, Thumbnail, ThumbnailSource};
use printernizer_drivers::{DriverProvider, ThumbnailSize};
use printernizer_store::SharedStore;

use crate::metadata::{parse_config_attributes, parse_gcode_header_comments};
use crate::preview::PreviewRenderer;

const MAX_LOG_ENTRIES: usize = 50;
const TARGET_SIZE: (u32, u32) = (200, 200);
const SHUTDOWN_DEADLINE: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Started,
    Success,
    Failed,
}

/// One entry in the rolling processing log.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingLogEntry {
    pub timestamp: DateTime<Utc>,
    pub file_id: String,
    pub file_path: String,
    pub file_extension: String,
    pub status: ProcessingStatus,
    pub details: Option<String>,
}

/// An embedded thumbnail as found inside a file.
#[derive(Debug, Clone)]
pub struct EmbeddedThumbnail {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: String,
}

pub struct ThumbnailService {
    store: SharedStore,
    bus: EventBus,
    drivers: Arc<dyn DriverProvider>,
    renderer: Arc<PreviewRenderer>,
    log: Mutex<VecDeque<ProcessingLogEntry>>,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Self-handle for the subscriber task.
    weak: std::sync::Weak<ThumbnailService>,
}

impl ThumbnailService {
    pub fn new(store: SharedStore, bus: EventBus, drivers: Arc<dyn DriverProvider>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            bus,
            drivers,
            renderer: Arc::new(PreviewRenderer::new()),
            log: Mutex::new(VecDeque::new()),
            background: Mutex::new(Vec::new()),
            weak: weak.clone(),
        })
    }

    /// Start consuming `file_needs_thumbnail_processing` events.
    pub fn spawn_subscriber(&self) -> tokio::task::JoinHandle<()> {
        let service = self.weak.upgrade().expect("service alive");
        let mut receiver = self.bus.subscribe(topics::FILE_NEEDS_THUMBNAIL_PROCESSING);
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let file_id = event.payload.get("file_id").and_then(|v| v.as_str());
                let file_path = event.payload.get("file_path").and_then(|v| v.as_str());
                let (Some(file_id), Some(file_path)) = (file_id, file_path) else {
                    warn!(payload = %event.payload, "thumbnail event missing file_id/file_path");
                    continue;
                };
                // A failed file stays usable without a thumbnail; the error
                // is already in the processing log.
                let _ = service.process_file_thumbnails(file_path, file_id).await;
            }
        })
    }

    /// Extract or generate a thumbnail for one file and store it.
    ///
    /// Returns whether a thumbnail ended up on the file row.
    #[instrument(skip(self), fields(file_id, file_path))]
    pub async fn process_file_thumbnails(&self, file_path: &str, file_id: &str) -> Result<bool> {
        self.log_attempt(file_path, file_id, ProcessingStatus::Started, None);

        if !Path::new(file_path).exists() {
            let message = "file not found for thumbnail processing";
            warn!(message);
            self.log_attempt(file_path, file_id, ProcessingStatus::Failed, Some(message.into()));
            return Ok(false);
        }

        let kind = FileKind::from_filename(file_path);

        // Stage 1: embedded thumbnails and metadata, parsed off the runtime.
        let (embedded, metadata) = if kind.has_embedded_thumbnails() {
            let path = file_path.to_string();
            tokio::task::spawn_blocking(move || extract_embedded(&path, kind))
                .await
                .map_err(|e| PrinternizerError::ProcessingFailed(format!("parse task: {e}")))?
                .unwrap_or_else(|e| {
                    debug!(error = %e, "embedded extraction failed");
                    (Vec::new(), serde_json::Map::new())
                })
        } else {
            (Vec::new(), serde_json::Map::new())
        };

        let embedded_count = embedded.len();
        let mut thumbnail = pick_best(embedded).map(|found| Thumbnail {
            data: found.data,
            width: found.width,
            height: found.height,
            format: found.format,
            source: ThumbnailSource::Embedded,
        });

        // Stage 2: the printer API, for files whose format carries none.
        if thumbnail.is_none() {
            thumbnail = self.printer_thumbnail(file_id).await;
        }

        // Stage 3: render a preview from the mesh itself.
        let mut generated_mesh = false;
        if thumbnail.is_none() && kind.is_renderable_mesh() {
            let renderer = Arc::clone(&self.renderer);
            let path = file_path.to_string();
            let rendered = tokio::task::spawn_blocking(move || {
                renderer.render_preview(&path, kind, TARGET_SIZE.0)
            })
            .await
            .map_err(|e| PrinternizerError::ProcessingFailed(format!("render task: {e}")))?;
            match rendered {
                Ok(png) => {
                    generated_mesh = true;
                    thumbnail = Some(Thumbnail {
                        data: png,
                        width: TARGET_SIZE.0,
                        height: TARGET_SIZE.1,
                        format: "png".into(),
                        source: ThumbnailSource::Generated,
                    });
                }
                Err(e) => {
                    debug!(error = %e, "preview generation failed");
                }
            }
        }

        if thumbnail.is_none() && metadata.is_empty() {
            let message = "no thumbnail source available";
            self.log_attempt(file_path, file_id, ProcessingStatus::Failed, Some(message.into()));
            return Ok(false);
        }

        // Persist what we found.
        {
            let store = self.store.lock().expect("store lock poisoned");
            if let Some(thumbnail) = &thumbnail {
                store.set_file_thumbnail(file_id, thumbnail)?;
            }
            if !metadata.is_empty() {
                store.merge_file_metadata(
                    file_id,
                    &serde_json::Value::Object(metadata.clone()),
                )?;
            }
        }

        let has_thumbnail = thumbnail.is_some();
        self.log_attempt(
            file_path,
            file_id,
            ProcessingStatus::Success,
            Some(format!("{embedded_count} embedded thumbnails")),
        );
        info!(has_thumbnail, "thumbnail processing complete");

        self.bus.publish(
            topics::FILE_THUMBNAILS_PROCESSED,
            serde_json::json!({
                "file_id": file_id,
                "file_path": file_path,
                "thumbnail_count": embedded_count,
                "has_thumbnail": has_thumbnail,
                "thumbnail_source": thumbnail.as_ref().map(|t| t.source.as_str()),
                "metadata": serde_json::Value::Object(metadata),
            }),
        );

        // Mesh previews also get an animated variant, generated
        // fire-and-forget; its failure never marks the file as failed.
        if generated_mesh {
            self.spawn_animated_preview(file_path.to_string(), kind);
        }

        Ok(has_thumbnail)
    }

    /// Recent processing attempts, most recent first.
    pub fn processing_log(&self, limit: Option<usize>) -> Vec<ProcessingLogEntry> {
        let log = self.log.lock().expect("log lock poisoned");
        let take = limit.unwrap_or(log.len()).min(log.len());
        log.iter().take(take).cloned().collect()
    }

    /// Wait for background preview tasks, then cancel stragglers.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = {
            let mut background = self.background.lock().expect("tasks lock poisoned");
            background.drain(..).collect()
        };
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "draining thumbnail background tasks");
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(SHUTDOWN_DEADLINE, futures_join(handles))
            .await
            .is_err()
        {
            warn!("thumbnail background tasks timed out, cancelling");
            for abort in aborts {
                abort.abort();
            }
        }
    }

    // -- internal ------------------------------------------------------------

    async fn printer_thumbnail(&self, file_id: &str) -> Option<Thumbnail> {
        let row = self
            .store
            .lock()
            .expect("store lock poisoned")
            .get_file(file_id)
            .ok()
            .flatten()?;
        let driver = self.drivers.driver(&row.printer_id)?;

        match driver
            .download_thumbnail(&row.filename, ThumbnailSize::Large)
            .await
        {
            Ok(Some(bytes)) => {
                let (width, height) = png_dimensions(&bytes).unwrap_or(TARGET_SIZE);
                info!(file_id, size_bytes = bytes.len(), "thumbnail downloaded from printer API");
                Some(Thumbnail {
                    data: bytes,
                    width,
                    height,
                    format: "png".into(),
                    source: ThumbnailSource::Printer,
                })
            }
            Ok(None) => None,
            Err(e) => {
                debug!(file_id, error = %e, "printer thumbnail download failed");
                None
            }
        }
    }

    fn spawn_animated_preview(&self, file_path: String, kind: FileKind) {
        let renderer = Arc::clone(&self.renderer);
        let handle = tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                renderer.render_animated_preview(&file_path, kind, TARGET_SIZE.0)
            })
            .await;
            match result {
                Ok(Ok(gif)) => {
                    debug!(size_bytes = gif.len(), "animated preview generated");
                }
                Ok(Err(e)) => warn!(error = %e, "animated preview generation failed"),
                Err(e) => warn!(error = %e, "animated preview task failed"),
            }
        });
        self.background
            .lock()
            .expect("tasks lock poisoned")
            .push(handle);
    }

    fn log_attempt(
        &self,
        file_path: &str,
        file_id: &str,
        status: ProcessingStatus,
        details: Option<String>,
    ) {
        let entry = ProcessingLogEntry {
            timestamp: Utc::now(),
            file_id: file_id.to_string(),
            file_path: file_path.to_string(),
            file_extension: Path::new(file_path)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase(),
            status,
            details,
        };
        let mut log = self.log.lock().expect("log lock poisoned");
        log.push_front(entry);
        log.truncate(MAX_LOG_ENTRIES);
    }
}

async fn futures_join(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

// ---------------------------------------------------------------------------
// Embedded thumbnail extraction
// ---------------------------------------------------------------------------

fn extract_embedded(
    path: &str,
    kind: FileKind,
) -> Result<(Vec<EmbeddedThumbnail>, serde_json::Map<String, serde_json::Value>)> {
    match kind {
        FileKind::ThreeMf => extract_3mf(path),
        FileKind::Gcode | FileKind::Bgcode => {
            // bgcode is a binary container; the lossy read still finds any
            // plain-text thumbnail blocks some firmwares embed.
            let bytes = std::fs::read(path)?;
            let text = String::from_utf8_lossy(&bytes);
            let thumbnails = parse_gcode_thumbnails(&text);
            let metadata = parse_gcode_header_comments(&text)
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect();
            Ok((thumbnails, metadata))
        }
        _ => Ok((Vec::new(), serde_json::Map::new())),
    }
}

/// A 3MF is a ZIP container; thumbnails are PNGs under `Metadata/`, slicer
/// settings live in `.config` streams.
fn extract_3mf(
    path: &str,
) -> Result<(Vec<EmbeddedThumbnail>, serde_json::Map<String, serde_json::Value>)> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| PrinternizerError::ProcessingFailed(format!("3MF open: {e}")))?;

    let names: Vec<String> = archive.file_names().map(String::from).collect();
    let mut thumbnails = Vec::new();
    let mut metadata = serde_json::Map::new();

    for name in &names {
        let lower = name.to_lowercase();
        if lower.ends_with(".png") {
            let mut entry = archive.by_name(name).map_err(|e| {
                PrinternizerError::ProcessingFailed(format!("3MF entry {name}: {e}"))
            })?;
            let mut data = Vec::new();
            if entry.read_to_end(&mut data).is_err() {
                continue;
            }
            if let Some((width, height)) = png_dimensions(&data) {
                thumbnails.push(EmbeddedThumbnail {
                    data,
                    width,
                    height,
                    format: "png".into(),
                });
            }
        } else if lower.ends_with(".config") {
            let mut entry = archive.by_name(name).map_err(|e| {
                PrinternizerError::ProcessingFailed(format!("3MF entry {name}: {e}"))
            })?;
            let mut text = String::new();
            if entry.read_to_string(&mut text).is_ok() {
                for (key, value) in parse_config_attributes(&text) {
                    metadata
                        .entry(key)
                        .or_insert(serde_json::Value::String(value));
                }
            }
        }
    }

    debug!(
        thumbnails = thumbnails.len(),
        metadata_keys = metadata.len(),
        "parsed 3MF container"
    );
    Ok((thumbnails, metadata))
}

/// Parse `; thumbnail begin WxH LEN … ; thumbnail end` blocks: base64 PNG
/// split across comment lines.
pub(crate) fn parse_gcode_thumbnails(text: &str) -> Vec<EmbeddedThumbnail> {
    let mut thumbnails = Vec::new();
    let mut current: Option<(u32, u32, String)> = None;

    for line in text.lines() {
        let Some(comment) = line.trim().strip_prefix(';') else {
            // Thumbnail blocks live in a contiguous comment run; plain
            // G-code ends any open block.
            current = None;
            continue;
        };
        let comment = comment.trim();

        if let Some(header) = comment.strip_prefix("thumbnail begin") {
            let mut parts = header.split_whitespace();
            let dims = parts.next().unwrap_or("");
            if let Some((w, h)) = dims.split_once('x') {
                if let (Ok(width), Ok(height)) = (w.parse(), h.parse()) {
                    current = Some((width, height, String::new()));
                    continue;
                }
            }
            current = None;
        } else if comment == "thumbnail end" {
            if let Some((width, height, encoded)) = current.take() {
                match base64::engine::general_purpose::STANDARD.decode(&encoded) {
                    Ok(data) => thumbnails.push(EmbeddedThumbnail {
                        data,
                        width,
                        height,
                        format: "png".into(),
                    }),
                    Err(e) => debug!(error = %e, "undecodable thumbnail block"),
                }
            }
        } else if let Some((_, _, encoded)) = current.as_mut() {
            encoded.push_str(comment);
        }
    }

    thumbnails
}

/// Prefer the thumbnail closest to the UI target size.
fn pick_best(thumbnails: Vec<EmbeddedThumbnail>) -> Option<EmbeddedThumbnail> {
    thumbnails.into_iter().min_by_key(|t| {
        let dw = t.width.abs_diff(TARGET_SIZE.0);
        let dh = t.height.abs_diff(TARGET_SIZE.1);
        dw + dh
    })
}

/// Width and height from a PNG's IHDR chunk.
pub(crate) fn png_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 24 || &data[..8] != b"\x89PNG\r\n\x1a\n" {
        return None;
    }
    let width = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
    let height = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);
    Some((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use printernizer_core::types::{PrinterFileRecord, PrinterState, RemoteFile, StatusUpdate};
    use printernizer_core::types::PrinterKind;
    use printernizer_drivers::{PrinterDriver, StatusSink};
    use printernizer_store::Store;

    fn tiny_png(width: u32, height: u32) -> Vec<u8> {
        let image = image::RgbaImage::from_pixel(width, height, image::Rgba([0, 0, 0, 255]));
        let mut out = Vec::new();
        image
            .write_to(
                &mut std::io::Cursor::new(&mut out),
                image::ImageFormat::Png,
            )
            .expect("encode png");
        out
    }

    fn gcode_with_thumbnail(width: u32, height: u32) -> String {
        let png = tiny_png(width, height);
        let encoded = base64::engine::general_purpose::STANDARD.encode(&png);
        let mut out = String::new();
        out.push_str("; layer_height = 0.2\n");
        out.push_str(&format!("; thumbnail begin {width}x{height} {}\n", encoded.len()));
        for chunk in encoded.as_bytes().chunks(76) {
            out.push_str("; ");
            out.push_str(std::str::from_utf8(chunk).expect("ascii"));
            out.push('\n');
        }
        out.push_str("; thumbnail end\n");
        out.push_str("G28\n");
        out
    }

    /// Driver stub with an optional canned printer-API thumbnail.
    struct ThumbDriver {
        id: String,
        thumbnail: Option<Vec<u8>>,
    }

    #[async_trait]
    impl PrinterDriver for ThumbDriver {
        fn printer_id(&self) -> &str {
            &self.id
        }
        fn kind(&self) -> PrinterKind {
            PrinterKind::PrusaCore
        }
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn get_status(&self) -> StatusUpdate {
            StatusUpdate::new(&self.id, PrinterState::Online)
        }
        async fn list_files(&self) -> Result<Vec<RemoteFile>> {
            Ok(Vec::new())
        }
        async fn download_file(&self, _filename: &str, _local_path: &Path) -> Result<()> {
            Ok(())
        }
        async fn pause(&self) -> Result<()> {
            Ok(())
        }
        async fn resume(&self) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        fn has_camera(&self) -> bool {
            false
        }
        fn camera_stream_url(&self) -> Option<String> {
            None
        }
        async fn take_snapshot(&self) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        async fn download_thumbnail(
            &self,
            _filename: &str,
            _size: ThumbnailSize,
        ) -> Result<Option<Vec<u8>>> {
            Ok(self.thumbnail.clone())
        }
        fn set_status_sink(&self, _sink: StatusSink) {}
        async fn start_monitoring(&self) -> Result<()> {
            Ok(())
        }
        async fn stop_monitoring(&self) {}
    }

    struct Provider(Arc<ThumbDriver>);
    impl DriverProvider for Provider {
        fn driver(&self, printer_id: &str) -> Option<Arc<dyn PrinterDriver>> {
            (printer_id == self.0.id).then(|| self.0.clone() as Arc<dyn PrinterDriver>)
        }
    }

    fn service(
        driver_thumbnail: Option<Vec<u8>>,
    ) -> (Arc<ThumbnailService>, SharedStore, EventBus) {
        let store = Store::open_in_memory().expect("store").into_shared();
        let bus = EventBus::new();
        let driver = Arc::new(ThumbDriver {
            id: "p1".into(),
            thumbnail: driver_thumbnail,
        });
        let service = ThumbnailService::new(store.clone(), bus.clone(), Arc::new(Provider(driver)));
        (service, store, bus)
    }

    fn seed_file(store: &SharedStore, filename: &str) -> String {
        let record = PrinterFileRecord::new_printer_file("p1", filename);
        store
            .lock()
            .expect("store")
            .upsert_file(&record)
            .expect("seed");
        record.id
    }

    #[test]
    fn png_header_parsing() {
        let png = tiny_png(64, 32);
        assert_eq!(png_dimensions(&png), Some((64, 32)));
        assert_eq!(png_dimensions(b"not a png"), None);
    }

    #[test]
    fn gcode_thumbnail_block_roundtrip() {
        let gcode = gcode_with_thumbnail(48, 48);
        let thumbnails = parse_gcode_thumbnails(&gcode);
        assert_eq!(thumbnails.len(), 1);
        assert_eq!(thumbnails[0].width, 48);
        assert_eq!(png_dimensions(&thumbnails[0].data), Some((48, 48)));
    }

    #[test]
    fn best_thumbnail_is_closest_to_target() {
        let candidates = vec![
            EmbeddedThumbnail { data: vec![], width: 16, height: 16, format: "png".into() },
            EmbeddedThumbnail { data: vec![], width: 220, height: 220, format: "png".into() },
            EmbeddedThumbnail { data: vec![], width: 640, height: 480, format: "png".into() },
        ];
        let best = pick_best(candidates).expect("best");
        assert_eq!((best.width, best.height), (220, 220));
    }

    #[tokio::test]
    async fn embedded_gcode_thumbnail_is_stored() {
        let (service, store, bus) = service(None);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("part.gcode");
        std::fs::write(&path, gcode_with_thumbnail(200, 200)).expect("write");
        let file_id = seed_file(&store, "part.gcode");
        let mut events = bus.subscribe(topics::FILE_THUMBNAILS_PROCESSED);

        let got = service
            .process_file_thumbnails(&path.display().to_string(), &file_id)
            .await
            .expect("process");
        assert!(got);

        let row = store
            .lock()
            .expect("store")
            .get_file(&file_id)
            .expect("get")
            .expect("row");
        let thumb = row.thumbnail.expect("thumbnail");
        assert_eq!(thumb.source, ThumbnailSource::Embedded);
        assert_eq!((thumb.width, thumb.height), (200, 200));
        // Parsed header metadata was merged onto the row.
        assert_eq!(
            row.metadata.expect("metadata")["layer_height"],
            serde_json::json!("0.2")
        );

        let event = events.recv().await.expect("event");
        assert_eq!(event.payload["has_thumbnail"], true);
        assert_eq!(event.payload["thumbnail_source"], "embedded");
    }

    #[tokio::test]
    async fn printer_api_fallback_for_bgcode() {
        let png = tiny_png(300, 200);
        let (service, store, _bus) = service(Some(png));
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("part.bgcode");
        std::fs::write(&path, [0u8; 64]).expect("write");
        let file_id = seed_file(&store, "part.bgcode");

        let got = service
            .process_file_thumbnails(&path.display().to_string(), &file_id)
            .await
            .expect("process");
        assert!(got);

        let thumb = store
            .lock()
            .expect("store")
            .get_file(&file_id)
            .expect("get")
            .expect("row")
            .thumbnail
            .expect("thumbnail");
        assert_eq!(thumb.source, ThumbnailSource::Printer);
        // Dimensions came from the PNG header, not the default.
        assert_eq!((thumb.width, thumb.height), (300, 200));
    }

    #[tokio::test]
    async fn stl_gets_generated_preview_and_animated_task() {
        let (service, store, bus) = service(None);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cube.stl");
        // Minimal binary STL with one triangle.
        let mut stl = vec![0u8; 80];
        stl.extend(1u32.to_le_bytes());
        stl.extend([0u8; 12]);
        for v in [[0f32, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 1.0]] {
            for c in v {
                stl.extend(c.to_le_bytes());
            }
        }
        stl.extend([0u8; 2]);
        std::fs::write(&path, &stl).expect("write");
        let file_id = seed_file(&store, "cube.stl");
        let mut events = bus.subscribe(topics::FILE_THUMBNAILS_PROCESSED);

        let got = service
            .process_file_thumbnails(&path.display().to_string(), &file_id)
            .await
            .expect("process");
        assert!(got);

        let thumb = store
            .lock()
            .expect("store")
            .get_file(&file_id)
            .expect("get")
            .expect("row")
            .thumbnail
            .expect("thumbnail");
        assert_eq!(thumb.source, ThumbnailSource::Generated);
        assert_eq!((thumb.width, thumb.height), (200, 200));

        let event = events.recv().await.expect("event");
        assert_eq!(event.payload["thumbnail_source"], "generated");

        // The animated preview task was spawned; draining it must not hang.
        service.shutdown().await;
    }

    #[tokio::test]
    async fn missing_file_logs_failure() {
        let (service, _store, _bus) = service(None);
        let got = service
            .process_file_thumbnails("/nonexistent/part.gcode", "p1_part.gcode")
            .await
            .expect("process");
        assert!(!got);

        let log = service.processing_log(None);
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].status, ProcessingStatus::Failed);
        assert_eq!(log[1].status, ProcessingStatus::Started);
    }

    #[tokio::test]
    async fn processing_log_is_capped() {
        let (service, _store, _bus) = service(None);
        for i in 0..60 {
            let _ = service
                .process_file_thumbnails(&format!("/missing/f{i}.gcode"), &format!("id{i}"))
                .await;
        }
        assert_eq!(service.processing_log(None).len(), MAX_LOG_ENTRIES);
        assert_eq!(service.processing_log(Some(5)).len(), 5);
    }

    #[tokio::test]
    async fn threemf_extraction_prefers_target_size() {
        let (service, store, _bus) = service(None);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.3mf");

        // Build a 3MF container with two plate thumbnails and a config.
        let file = std::fs::File::create(&path).expect("create");
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        use std::io::Write;
        writer
            .start_file("Metadata/plate_1_small.png", options)
            .expect("entry");
        writer.write_all(&tiny_png(64, 64)).expect("write");
        writer
            .start_file("Metadata/plate_1.png", options)
            .expect("entry");
        writer.write_all(&tiny_png(256, 256)).expect("write");
        writer
            .start_file("Metadata/slice_info.config", options)
            .expect("entry");
        writer
            .write_all(br#"<metadata key="printer_model_id" value="A1"/>"#)
            .expect("write");
        writer.finish().expect("finish");

        let file_id = seed_file(&store, "model.3mf");
        let got = service
            .process_file_thumbnails(&path.display().to_string(), &file_id)
            .await
            .expect("process");
        assert!(got);

        let row = store
            .lock()
            .expect("store")
            .get_file(&file_id)
            .expect("get")
            .expect("row");
        let thumb = row.thumbnail.expect("thumbnail");
        // 256x256 is closer to 200x200 than 64x64.
        assert_eq!((thumb.width, thumb.height), (256, 256));
        assert_eq!(
            row.metadata.expect("metadata")["printer_model_id"],
            serde_json::json!("A1")
        );
    }
}
