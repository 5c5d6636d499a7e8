// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Prusa Core One driver, speaking the PrusaLink HTTP API.
//
// Status is polled at the configured cadence. The API is heterogeneous
// across firmware generations: progress arrives either as a bare percent or
// as `{completion: 0..1}`, and time fields come as `time_printing` /
// `time_remaining` with `printTime` / `printTimeLeft` as the legacy
// spelling. Both shapes are accepted everywhere.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use printernizer_core::config::PrinterConfig;
use printernizer_core::error::{PrinternizerError, Result};
use printernizer_core::types::{PrinterKind, PrinterState, RemoteFile, StatusUpdate};

use crate::{looks_like_json, not_connected, DriverSettings, PrinterDriver, StatusSink, ThumbnailSize};

/// Connect attempts before giving up.
const CONNECT_MAX_RETRIES: u32 = 3;
/// Backoff between connect attempts grows as `base × attempt`.
const CONNECT_BACKOFF_BASE: Duration = Duration::from_secs(2);

pub struct PrusaDriver {
    printer_id: String,
    name: String,
    /// `http://{ip}` — the API root is `{host}/api`.
    host: String,
    client: reqwest::Client,
    webcam_url: Option<String>,
    poll_interval: Duration,
    connected: AtomicBool,
    sink: StdMutex<Option<StatusSink>>,
    monitor_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PrusaDriver {
    pub fn new(config: &PrinterConfig, settings: &DriverSettings) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            PrinternizerError::ConfigurationInvalid(format!(
                "Prusa Core printer {} requires ip_address and api_key",
                config.id
            ))
        })?;

        let mut headers = reqwest::header::HeaderMap::new();
        let mut key_value =
            reqwest::header::HeaderValue::from_str(&api_key).map_err(|e| {
                PrinternizerError::ConfigurationInvalid(format!(
                    "printer {}: api_key is not a valid header value: {e}",
                    config.id
                ))
            })?;
        key_value.set_sensitive(true);
        headers.insert("X-Api-Key", key_value);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(settings.request_timeout)
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(|e| PrinternizerError::ConnectionFailed {
                printer_id: config.id.clone(),
                reason: format!("HTTP client build failed: {e}"),
            })?;

        Ok(Self {
            printer_id: config.id.clone(),
            name: config.name.clone(),
            host: format!("http://{}", config.ip_address),
            client,
            webcam_url: config.webcam_url.clone(),
            poll_interval: settings.poll_interval,
            connected: AtomicBool::new(false),
            sink: StdMutex::new(None),
            monitor_task: Mutex::new(None),
        })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/api{endpoint}", self.host)
    }

    /// Raw file entries (with `refs`) flattened out of the folder structure.
    async fn raw_files(&self) -> Result<Vec<serde_json::Value>> {
        let response = self
            .client
            .get(self.api_url("/files"))
            .send()
            .await
            .map_err(|e| PrinternizerError::ConnectionFailed {
                printer_id: self.printer_id.clone(),
                reason: format!("files request: {e}"),
            })?;

        match response.status().as_u16() {
            200 => {}
            403 => {
                warn!(printer_id = %self.printer_id, "files API access denied, check API key permissions");
                return Ok(Vec::new());
            }
            status => {
                warn!(printer_id = %self.printer_id, status, "files API returned error status");
                return Ok(Vec::new());
            }
        }

        let payload: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| PrinternizerError::ConnectionFailed {
                    printer_id: self.printer_id.clone(),
                    reason: format!("files response decode: {e}"),
                })?;

        Ok(flatten_file_tree(&payload))
    }

    /// Match a reported display name against the raw file index: exact
    /// `display`/`name` match first, then case-insensitive containment.
    async fn find_raw_file(&self, display_name: &str) -> Result<Option<serde_json::Value>> {
        let files = self.raw_files().await?;

        for file in &files {
            let display = file.get("display").and_then(|v| v.as_str()).unwrap_or("");
            let name = file.get("name").and_then(|v| v.as_str()).unwrap_or("");
            if display == display_name || name == display_name {
                return Ok(Some(file.clone()));
            }
        }

        let wanted = display_name.to_lowercase();
        for file in &files {
            let display = file
                .get("display")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_lowercase();
            let name = file
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_lowercase();
            if display.contains(&wanted)
                || name.contains(&wanted)
                || (!display.is_empty() && wanted.contains(&display))
                || (!name.is_empty() && wanted.contains(&name))
            {
                info!(printer_id = %self.printer_id, display_name, "resolved file by partial match");
                return Ok(Some(file.clone()));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl PrinterDriver for PrusaDriver {
    fn printer_id(&self) -> &str {
        &self.printer_id
    }

    fn kind(&self) -> PrinterKind {
        PrinterKind::PrusaCore
    }

    #[instrument(skip(self), fields(printer_id = %self.printer_id))]
    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            debug!("already connected");
            return Ok(());
        }

        info!(name = %self.name, host = %self.host, "connecting to Prusa printer");

        let mut last_error = String::new();
        for attempt in 1..=CONNECT_MAX_RETRIES {
            match self.client.get(self.api_url("/version")).send().await {
                Ok(response) if response.status().is_success() => {
                    let version: serde_json::Value =
                        response.json().await.unwrap_or_default();
                    info!(
                        server = version.get("server").and_then(|v| v.as_str()).unwrap_or("unknown"),
                        attempt,
                        "connected to Prusa printer"
                    );
                    self.connected.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    // Auth errors will not improve with retries.
                    let reason = match status {
                        401 => "authentication failed - check API key".to_string(),
                        403 => "access forbidden - check API key permissions".to_string(),
                        _ => format!("HTTP {status}"),
                    };
                    if status == 401 || status == 403 {
                        return Err(PrinternizerError::ConnectionFailed {
                            printer_id: self.printer_id.clone(),
                            reason,
                        });
                    }
                    last_error = reason;
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            if attempt < CONNECT_MAX_RETRIES {
                let wait = CONNECT_BACKOFF_BASE * attempt;
                warn!(attempt, wait_secs = wait.as_secs(), error = %last_error, "connection attempt failed, retrying");
                tokio::time::sleep(wait).await;
            }
        }

        error!(error = %last_error, "Prusa connection failed after retries");
        Err(PrinternizerError::ConnectionFailed {
            printer_id: self.printer_id.clone(),
            reason: last_error,
        })
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_monitoring().await;
        self.connected.store(false, Ordering::SeqCst);
        info!(printer_id = %self.printer_id, "disconnected from Prusa printer");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_status(&self) -> StatusUpdate {
        if !self.is_connected() {
            return StatusUpdate::error(&self.printer_id, "Not connected");
        }
        fetch_status(&self.client, &self.host, &self.printer_id).await
    }

    async fn list_files(&self) -> Result<Vec<RemoteFile>> {
        if !self.is_connected() {
            return Err(not_connected(&self.printer_id));
        }
        let raw = self.raw_files().await?;
        let files = raw.iter().filter_map(raw_to_remote_file).collect::<Vec<_>>();
        info!(printer_id = %self.printer_id, count = files.len(), "listed Prusa files");
        Ok(files)
    }

    #[instrument(skip(self, local_path), fields(printer_id = %self.printer_id, filename))]
    async fn download_file(&self, filename: &str, local_path: &Path) -> Result<()> {
        if !self.is_connected() {
            return Err(not_connected(&self.printer_id));
        }

        let file_info = self.find_raw_file(filename).await?.ok_or_else(|| {
            PrinternizerError::DownloadFailed(format!(
                "file {filename} not found in printer file list"
            ))
        })?;

        // refs.download gives the storage-relative path, but the path alone
        // is not an authenticated endpoint. The binary lives at
        // /api/v1/files/{storage}/{path} with the API key header.
        let download_ref = file_info
            .get("refs")
            .and_then(|refs| refs.get("download"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                PrinternizerError::DownloadFailed(format!(
                    "no download reference for {filename}"
                ))
            })?;

        let (storage, path) = parse_download_ref(download_ref).ok_or_else(|| {
            PrinternizerError::DownloadFailed(format!(
                "invalid download reference {download_ref:?}, expected storage/path"
            ))
        })?;

        let url = format!("{}/api/v1/files/{storage}/{path}", self.host);
        info!(%url, "downloading binary from Prusa");

        let response = self.client.get(&url).send().await.map_err(|e| {
            PrinternizerError::DownloadFailed(format!("download request: {e}"))
        })?;

        match response.status().as_u16() {
            200 => {}
            404 => {
                return Err(PrinternizerError::DownloadFailed(format!(
                    "file not found on printer: {storage}/{path}"
                )))
            }
            401 | 403 => {
                return Err(PrinternizerError::DownloadFailed(
                    "authentication failed for file download - check API key permissions".into(),
                ))
            }
            status => {
                return Err(PrinternizerError::DownloadFailed(format!(
                    "download returned HTTP {status}"
                )))
            }
        }

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // The guard removes the partial file on any error return and on
        // cancellation mid-stream.
        let mut guard = crate::PartialFileGuard::new(local_path);
        let mut stream = response.bytes_stream();
        let mut file = tokio::fs::File::create(local_path).await?;
        let mut first = true;
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                PrinternizerError::DownloadFailed(format!("download stream: {e}"))
            })?;
            if first {
                first = false;
                if looks_like_json(&chunk) {
                    error!(%url, "download endpoint answered with JSON metadata instead of binary content");
                    return Err(PrinternizerError::DownloadFailed(
                        "downloaded JSON metadata instead of binary file".into(),
                    ));
                }
            }
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        guard.disarm();

        info!(size_bytes = written, path = %local_path.display(), "downloaded file from Prusa");
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.job_command(serde_json::json!({"command": "pause", "action": "pause"}), "pause")
            .await
    }

    async fn resume(&self) -> Result<()> {
        self.job_command(serde_json::json!({"command": "pause", "action": "resume"}), "resume")
            .await
    }

    async fn stop(&self) -> Result<()> {
        self.job_command(serde_json::json!({"command": "cancel"}), "stop")
            .await
    }

    fn has_camera(&self) -> bool {
        // No integrated camera on the Core One; an external webcam may be
        // configured.
        self.webcam_url.is_some()
    }

    fn camera_stream_url(&self) -> Option<String> {
        self.webcam_url.clone()
    }

    async fn take_snapshot(&self) -> Result<Option<Vec<u8>>> {
        let Some(url) = &self.webcam_url else {
            return Ok(None);
        };
        let response = self.client.get(url).send().await.map_err(|e| {
            PrinternizerError::ConnectionFailed {
                printer_id: self.printer_id.clone(),
                reason: format!("snapshot request: {e}"),
            }
        })?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let bytes = response.bytes().await.map_err(|e| {
            PrinternizerError::ConnectionFailed {
                printer_id: self.printer_id.clone(),
                reason: format!("snapshot read: {e}"),
            }
        })?;
        Ok(Some(bytes.to_vec()))
    }

    async fn download_thumbnail(
        &self,
        filename: &str,
        size: ThumbnailSize,
    ) -> Result<Option<Vec<u8>>> {
        if !self.is_connected() {
            return Ok(None);
        }
        let Some(file_info) = self.find_raw_file(filename).await? else {
            debug!(printer_id = %self.printer_id, filename, "no file entry for thumbnail");
            return Ok(None);
        };

        let key = match size {
            ThumbnailSize::Large => "thumbnail",
            ThumbnailSize::Small => "icon",
        };
        let Some(thumb_ref) = file_info
            .get("refs")
            .and_then(|refs| refs.get(key))
            .and_then(|v| v.as_str())
        else {
            return Ok(None);
        };

        let url = format!("{}{thumb_ref}", self.host);
        let response = self.client.get(&url).send().await.map_err(|e| {
            PrinternizerError::DownloadFailed(format!("thumbnail request: {e}"))
        })?;
        if !response.status().is_success() {
            warn!(printer_id = %self.printer_id, filename, status = response.status().as_u16(), "thumbnail download failed");
            return Ok(None);
        }
        let bytes = response.bytes().await.map_err(|e| {
            PrinternizerError::DownloadFailed(format!("thumbnail read: {e}"))
        })?;
        info!(printer_id = %self.printer_id, filename, size_bytes = bytes.len(), "downloaded thumbnail from Prusa");
        Ok(Some(bytes.to_vec()))
    }

    fn set_status_sink(&self, sink: StatusSink) {
        *self.sink.lock().expect("sink lock poisoned") = Some(sink);
    }

    async fn start_monitoring(&self) -> Result<()> {
        let mut guard = self.monitor_task.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let sink = self
            .sink
            .lock()
            .expect("sink lock poisoned")
            .clone()
            .ok_or_else(|| PrinternizerError::ConnectionFailed {
                printer_id: self.printer_id.clone(),
                reason: "no status sink registered".into(),
            })?;

        let client = self.client.clone();
        let host = self.host.clone();
        let printer_id = self.printer_id.clone();
        let interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let update = fetch_status(&client, &host, &printer_id).await;
                if sink.send(update).is_err() {
                    debug!(%printer_id, "status sink closed, stopping poll loop");
                    break;
                }
            }
        });

        *guard = Some(handle);
        info!(printer_id = %self.printer_id, interval_secs = self.poll_interval.as_secs(), "Prusa polling started");
        Ok(())
    }

    async fn stop_monitoring(&self) {
        if let Some(handle) = self.monitor_task.lock().await.take() {
            handle.abort();
            info!(printer_id = %self.printer_id, "Prusa polling stopped");
        }
    }
}

impl PrusaDriver {
    async fn job_command(&self, body: serde_json::Value, verb: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(not_connected(&self.printer_id));
        }
        info!(printer_id = %self.printer_id, verb, "sending job command");
        let response = self
            .client
            .post(self.api_url("/job"))
            .json(&body)
            .send()
            .await
            .map_err(|e| PrinternizerError::CommandFailed {
                printer_id: self.printer_id.clone(),
                reason: format!("{verb}: {e}"),
            })?;

        // PrusaLink answers 204 for accepted job commands.
        if response.status().as_u16() == 204 {
            Ok(())
        } else {
            Err(PrinternizerError::CommandFailed {
                printer_id: self.printer_id.clone(),
                reason: format!("{verb} returned HTTP {}", response.status().as_u16()),
            })
        }
    }
}

/// Poll `/api/printer` and `/api/job`, producing a normalized snapshot.
/// Shared by `get_status` and the polling task; never fails.
async fn fetch_status(client: &reqwest::Client, host: &str, printer_id: &str) -> StatusUpdate {
    let status_payload: serde_json::Value =
        match client.get(format!("{host}/api/printer")).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json().await {
                    Ok(json) => json,
                    Err(e) => {
                        error!(%printer_id, error = %e, "invalid JSON in Prusa status response");
                        return StatusUpdate::error(
                            printer_id,
                            format!("Invalid response format: {e}"),
                        );
                    }
                }
            }
            Ok(response) => {
                return StatusUpdate::error(
                    printer_id,
                    format!("Status check failed: HTTP {}", response.status().as_u16()),
                )
            }
            Err(e) => {
                error!(%printer_id, error = %e, "cannot reach Prusa printer for status");
                return StatusUpdate::error(printer_id, format!("Connection failed: {e}"));
            }
        };

    // Job data is best-effort; a failed job request degrades the snapshot,
    // it does not fail it.
    let job_payload: serde_json::Value = match client.get(format!("{host}/api/job")).send().await {
        Ok(response) if response.status().is_success() => {
            response.json().await.unwrap_or_default()
        }
        Ok(_) | Err(_) => serde_json::Value::Null,
    };

    parse_status(printer_id, &status_payload, &job_payload)
}

/// Normalize the two PrusaLink payloads into a `StatusUpdate`.
pub(crate) fn parse_status(
    printer_id: &str,
    status_payload: &serde_json::Value,
    job_payload: &serde_json::Value,
) -> StatusUpdate {
    let vendor_state = status_payload
        .pointer("/state/text")
        .and_then(|v| v.as_str())
        .unwrap_or("Unknown");

    let mut update = StatusUpdate::new(printer_id, map_prusa_state(vendor_state));
    update.message = Some(format!("Prusa status: {vendor_state}"));

    update.temperature_bed = status_payload
        .pointer("/temperature/bed/actual")
        .and_then(|v| v.as_f64());
    update.temperature_bed_target = status_payload
        .pointer("/temperature/bed/target")
        .and_then(|v| v.as_f64());
    update.temperature_nozzle = status_payload
        .pointer("/temperature/tool0/actual")
        .and_then(|v| v.as_f64());
    update.temperature_nozzle_target = status_payload
        .pointer("/temperature/tool0/target")
        .and_then(|v| v.as_f64());

    if !job_payload.is_null() {
        // PrusaLink reports the filename at the top level; the legacy shape
        // nests it under job.file.
        let current_job = job_payload
            .get("display_name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .or_else(|| {
                job_payload
                    .pointer("/job/file/display_name")
                    .and_then(|v| v.as_str())
            })
            .or_else(|| {
                job_payload
                    .pointer("/job/file/name")
                    .and_then(|v| v.as_str())
            })
            .filter(|s| !s.is_empty());
        update.current_job = current_job.map(|s| s.to_string());

        if let Some(progress) = parse_progress(job_payload.get("progress")) {
            // parse_progress already yields a percent; only clamp here.
            update.progress = Some(progress.clamp(0.0, 100.0));
        }

        let remaining_secs = job_payload
            .get("time_remaining")
            .and_then(|v| v.as_i64())
            .filter(|v| *v > 0)
            .or_else(|| {
                job_payload
                    .pointer("/progress/printTimeLeft")
                    .and_then(|v| v.as_i64())
                    .filter(|v| *v > 0)
            });
        if let Some(secs) = remaining_secs {
            update.remaining_minutes = Some((secs / 60) as u32);
        }

        let elapsed_secs = job_payload
            .get("time_printing")
            .and_then(|v| v.as_i64())
            .filter(|v| *v > 0)
            .or_else(|| {
                job_payload
                    .pointer("/progress/printTime")
                    .and_then(|v| v.as_i64())
                    .filter(|v| *v > 0)
            });
        if let Some(secs) = elapsed_secs {
            update.derive_start_time(secs);
        }
    }

    update.raw = Some(serde_json::json!({
        "printer": status_payload,
        "job": job_payload,
    }));
    update.timestamp = Utc::now();
    update
}

/// Both accepted progress shapes: `{completion: 0..1}` and a bare percent.
pub(crate) fn parse_progress(value: Option<&serde_json::Value>) -> Option<f64> {
    match value? {
        serde_json::Value::Object(map) => {
            let completion = map.get("completion")?.as_f64()?;
            Some(if completion <= 1.0 {
                completion * 100.0
            } else {
                completion
            })
        }
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

pub(crate) fn map_prusa_state(vendor_state: &str) -> PrinterState {
    let lower = vendor_state.to_lowercase();
    if lower.contains("operational") || lower.contains("ready") || lower.contains("idle") {
        PrinterState::Online
    } else if lower.contains("printing") {
        PrinterState::Printing
    } else if lower.contains("paused") {
        PrinterState::Paused
    } else if lower.contains("error") || lower.contains("offline") {
        PrinterState::Error
    } else {
        PrinterState::Unknown
    }
}

/// Flatten PrusaLink's nested folder structure into raw file entries,
/// prefixing display names with their folder (`[USB] name`, `folder/name`).
pub(crate) fn flatten_file_tree(payload: &serde_json::Value) -> Vec<serde_json::Value> {
    let mut out = Vec::new();
    if let Some(files) = payload.get("files").and_then(|v| v.as_array()) {
        flatten_items(files, "", &mut out);
    }
    if payload
        .pointer("/sdcard/ready")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        if let Some(files) = payload.pointer("/sdcard/files").and_then(|v| v.as_array()) {
            flatten_items(files, "[SD] ", &mut out);
        }
    }
    out
}

fn flatten_items(items: &[serde_json::Value], prefix: &str, out: &mut Vec<serde_json::Value>) {
    for item in items {
        let item_type = item.get("type").and_then(|v| v.as_str()).unwrap_or("");
        if item_type == "folder" {
            if let Some(children) = item.get("children").and_then(|v| v.as_array()) {
                let folder = item
                    .get("display")
                    .or_else(|| item.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let child_prefix = if prefix.is_empty() {
                    format!("[{folder}] ")
                } else {
                    format!("{prefix}{folder}/")
                };
                flatten_items(children, &child_prefix, out);
            }
            continue;
        }

        let name = item.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let display = item
            .get("display")
            .and_then(|v| v.as_str())
            .unwrap_or(name);
        let printable = name
            .to_lowercase()
            .ends_with_any(&[".gcode", ".bgcode", ".stl", ".3mf"])
            || display
                .to_lowercase()
                .ends_with_any(&[".gcode", ".bgcode", ".stl", ".3mf"])
            || item.get("refs").is_some();
        if !printable {
            continue;
        }

        let mut raw = item.clone();
        if let Some(obj) = raw.as_object_mut() {
            obj.insert(
                "display".to_string(),
                serde_json::Value::String(format!("{prefix}{display}")),
            );
        }
        out.push(raw);
    }
}

trait EndsWithAny {
    fn ends_with_any(&self, suffixes: &[&str]) -> bool;
}

impl EndsWithAny for String {
    fn ends_with_any(&self, suffixes: &[&str]) -> bool {
        suffixes.iter().any(|s| self.ends_with(s))
    }
}

fn raw_to_remote_file(raw: &serde_json::Value) -> Option<RemoteFile> {
    let display = raw
        .get("display")
        .or_else(|| raw.get("name"))
        .and_then(|v| v.as_str())?;
    Some(RemoteFile {
        filename: display.to_string(),
        size: raw.get("size").and_then(|v| v.as_u64()),
        modified: raw
            .get("date")
            .and_then(|v| v.as_i64())
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0)),
        path: raw
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(display)
            .to_string(),
    })
}

/// Split a `refs.download` value like `/usb/FILE.BGC` into
/// `("usb", "FILE.BGC")`.
pub(crate) fn parse_download_ref(download_ref: &str) -> Option<(String, String)> {
    let trimmed = download_ref.trim_start_matches('/');
    let (storage, path) = trimmed.split_once('/')?;
    if storage.is_empty() || path.is_empty() {
        return None;
    }
    Some((storage.to_string(), path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mapping_table() {
        assert_eq!(map_prusa_state("Operational"), PrinterState::Online);
        assert_eq!(map_prusa_state("Ready"), PrinterState::Online);
        assert_eq!(map_prusa_state("Printing"), PrinterState::Printing);
        assert_eq!(map_prusa_state("Paused"), PrinterState::Paused);
        assert_eq!(map_prusa_state("Error"), PrinterState::Error);
        assert_eq!(map_prusa_state("Offline"), PrinterState::Error);
        assert_eq!(map_prusa_state("Gibberish"), PrinterState::Unknown);
    }

    #[test]
    fn progress_dict_and_number_both_yield_percent() {
        assert_eq!(
            parse_progress(Some(&serde_json::json!({"completion": 0.5}))),
            Some(50.0)
        );
        assert_eq!(parse_progress(Some(&serde_json::json!(50))), Some(50.0));
        assert_eq!(
            parse_progress(Some(&serde_json::json!({"completion": 73.0}))),
            Some(73.0)
        );
        assert_eq!(parse_progress(Some(&serde_json::json!("half"))), None);
        assert_eq!(parse_progress(None), None);
    }

    #[test]
    fn parse_status_prusalink_shape() {
        let status = serde_json::json!({
            "state": {"text": "Printing"},
            "temperature": {
                "bed": {"actual": 60.2, "target": 60.0},
                "tool0": {"actual": 215.1, "target": 215.0}
            }
        });
        let job = serde_json::json!({
            "display_name": "Phone Stand v2.3mf",
            "progress": {"completion": 0.42},
            "time_printing": 600,
            "time_remaining": 1800
        });

        let update = parse_status("prusa_01", &status, &job);
        assert_eq!(update.state, PrinterState::Printing);
        assert_eq!(update.progress, Some(42.0));
        assert_eq!(update.current_job.as_deref(), Some("Phone Stand v2.3mf"));
        assert_eq!(update.remaining_minutes, Some(30));
        assert_eq!(update.elapsed_minutes, Some(10));
        assert_eq!(update.temperature_bed, Some(60.2));
        assert_eq!(update.temperature_nozzle_target, Some(215.0));
        // Derived from elapsed: roughly ten minutes ago.
        let start = update.print_start_time.expect("derived start time");
        let delta = (Utc::now() - start).num_seconds() - 600;
        assert!(delta.abs() < 5, "start time should be ~elapsed ago");
    }

    #[test]
    fn parse_status_octoprint_fallback_shape() {
        let status = serde_json::json!({"state": {"text": "Printing"}});
        let job = serde_json::json!({
            "job": {"file": {"name": "part.gcode"}},
            "progress": {"completion": 0.9, "printTime": 1200, "printTimeLeft": 120}
        });

        let update = parse_status("prusa_01", &status, &job);
        assert_eq!(update.current_job.as_deref(), Some("part.gcode"));
        assert_eq!(update.progress, Some(90.0));
        assert_eq!(update.remaining_minutes, Some(2));
        assert_eq!(update.elapsed_minutes, Some(20));
    }

    #[test]
    fn parse_status_without_job_leaves_fields_absent() {
        let status = serde_json::json!({"state": {"text": "Operational"}});
        let update = parse_status("prusa_01", &status, &serde_json::Value::Null);
        assert_eq!(update.state, PrinterState::Online);
        assert!(update.current_job.is_none());
        assert!(update.progress.is_none());
        assert!(update.remaining_minutes.is_none());
        assert!(update.temperature_bed.is_none());
    }

    #[test]
    fn download_ref_parsing() {
        assert_eq!(
            parse_download_ref("/usb/FILE.BGC"),
            Some(("usb".into(), "FILE.BGC".into()))
        );
        assert_eq!(
            parse_download_ref("local/sub/part.gcode"),
            Some(("local".into(), "sub/part.gcode".into()))
        );
        assert_eq!(parse_download_ref("/justonepart"), None);
        assert_eq!(parse_download_ref(""), None);
    }

    #[test]
    fn file_tree_flattening_recurses_and_prefixes() {
        let payload = serde_json::json!({
            "files": [
                {
                    "type": "folder",
                    "display": "USB",
                    "children": [
                        {"name": "model.bgcode", "display": "Model.bgcode",
                         "refs": {"download": "/usb/MODEL.BGC"}, "size": 1024},
                        {"type": "folder", "name": "sub", "children": [
                            {"name": "inner.gcode"}
                        ]}
                    ]
                },
                {"name": "notes.txt"}
            ]
        });
        let files = flatten_file_tree(&payload);
        let names: Vec<_> = files
            .iter()
            .map(|f| f["display"].as_str().unwrap_or("").to_string())
            .collect();
        assert_eq!(names, vec!["[USB] Model.bgcode", "[USB] sub/inner.gcode"]);
    }

    #[test]
    fn sd_card_files_included_when_ready() {
        let payload = serde_json::json!({
            "files": [],
            "sdcard": {"ready": true, "files": [{"name": "sd.gcode"}]}
        });
        let files = flatten_file_tree(&payload);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0]["display"], "[SD] sd.gcode");
    }
}
