// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Bambu Lab driver. The vendor protocol is push-based: the printer publishes
// partial status reports over MQTT (TLS with a self-signed certificate,
// username "bblp", password = LAN access code). Reports are deep-merged into
// an accumulated state because most pushes carry only the fields that
// changed.
//
// The LAN file channel: print projects are announced in `project_file`
// payloads carrying a URL; binaries are fetched over HTTP from that URL.
// Thumbnails come from the downloaded 3MF payload itself.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use rustls::client::danger::{ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::ServerName;
use rustls::Error as TlsError;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use printernizer_core::config::PrinterConfig;
use printernizer_core::error::{PrinternizerError, Result};
use printernizer_core::types::{PrinterKind, PrinterState, RemoteFile, StatusUpdate};

use crate::{looks_like_json, not_connected, DriverSettings, PrinterDriver, StatusSink};

const BAMBU_MQTT_PORT: u16 = 8883;
const BAMBU_MQTT_USER: &str = "bblp";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Accepts any server certificate. Bambu printers present self-signed
/// certificates that cannot be validated against a public root.
#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer,
        _intermediates: &[rustls::pki_types::CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, TlsError> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, TlsError> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

struct Shared {
    printer_id: String,
    connected: AtomicBool,
    /// Whether status changes are forwarded to the sink.
    monitoring: AtomicBool,
    /// Deep-merged vendor state across partial reports.
    accumulated: StdMutex<serde_json::Value>,
    /// Files the printer has announced over MQTT, keyed by filename.
    file_index: StdMutex<HashMap<String, RemoteFile>>,
    sink: StdMutex<Option<StatusSink>>,
    last_status: StdMutex<Option<StatusUpdate>>,
}

pub struct BambuDriver {
    name: String,
    ip_address: String,
    access_code: String,
    serial_number: String,
    webcam_url: Option<String>,
    connect_timeout: Duration,
    http: reqwest::Client,
    shared: Arc<Shared>,
    mqtt: StdMutex<Option<AsyncClient>>,
    event_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BambuDriver {
    pub fn new(config: &PrinterConfig, settings: &DriverSettings) -> Result<Self> {
        let access_code = config.access_code.clone().ok_or_else(|| {
            PrinternizerError::ConfigurationInvalid(format!(
                "Bambu Lab printer {} requires ip_address and access_code",
                config.id
            ))
        })?;
        let serial_number = config.serial_number.clone().unwrap_or_default();

        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.connect_timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| PrinternizerError::ConnectionFailed {
                printer_id: config.id.clone(),
                reason: format!("HTTP client build failed: {e}"),
            })?;

        Ok(Self {
            name: config.name.clone(),
            ip_address: config.ip_address.clone(),
            access_code,
            serial_number,
            webcam_url: config.webcam_url.clone(),
            connect_timeout: settings.connect_timeout,
            http,
            shared: Arc::new(Shared {
                printer_id: config.id.clone(),
                connected: AtomicBool::new(false),
                monitoring: AtomicBool::new(false),
                accumulated: StdMutex::new(serde_json::Value::Object(Default::default())),
                file_index: StdMutex::new(HashMap::new()),
                sink: StdMutex::new(None),
                last_status: StdMutex::new(None),
            }),
            mqtt: StdMutex::new(None),
            event_task: Mutex::new(None),
        })
    }

    fn request_topic(&self) -> String {
        format!("device/{}/request", self.serial_number)
    }

    async fn publish_print_command(&self, command: &str) -> Result<()> {
        let client = self
            .mqtt
            .lock()
            .expect("mqtt lock poisoned")
            .clone()
            .ok_or_else(|| not_connected(&self.shared.printer_id))?;

        let payload = serde_json::json!({
            "print": {
                "command": command,
                "sequence_id": Utc::now().timestamp_millis().to_string(),
            }
        });
        client
            .publish(
                self.request_topic(),
                QoS::AtMostOnce,
                false,
                payload.to_string().into_bytes(),
            )
            .await
            .map_err(|e| PrinternizerError::CommandFailed {
                printer_id: self.shared.printer_id.clone(),
                reason: format!("{command}: MQTT publish failed: {e}"),
            })?;
        info!(printer_id = %self.shared.printer_id, command, "sent print command");
        Ok(())
    }
}

#[async_trait]
impl PrinterDriver for BambuDriver {
    fn printer_id(&self) -> &str {
        &self.shared.printer_id
    }

    fn kind(&self) -> PrinterKind {
        PrinterKind::BambuLab
    }

    #[instrument(skip(self), fields(printer_id = %self.shared.printer_id))]
    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            debug!("already connected");
            return Ok(());
        }

        info!(name = %self.name, ip = %self.ip_address, "connecting to Bambu printer");

        let client_id = format!(
            "printernizer_{}_{}",
            self.shared.printer_id,
            uuid::Uuid::new_v4()
        );
        let mut options = MqttOptions::new(client_id, &self.ip_address, BAMBU_MQTT_PORT);
        options
            .set_credentials(BAMBU_MQTT_USER, &self.access_code)
            .set_keep_alive(Duration::from_secs(60));

        // TLS with certificate validation bypassed — the printer's
        // certificate is self-signed.
        let tls_config = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|e| PrinternizerError::ConnectionFailed {
            printer_id: self.shared.printer_id.clone(),
            reason: format!("TLS config: {e}"),
        })?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_no_client_auth();
        options.set_transport(Transport::Tls(TlsConfiguration::Rustls(Arc::new(
            tls_config,
        ))));

        let (client, mut event_loop) = AsyncClient::new(options, 10);
        *self.mqtt.lock().expect("mqtt lock poisoned") = Some(client.clone());

        let shared = Arc::clone(&self.shared);
        let serial = self.serial_number.clone();
        let report_topic = format!("device/{serial}/report");

        let handle = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(printer_id = %shared.printer_id, "MQTT connected");
                        if let Err(e) = client.subscribe(&report_topic, QoS::AtMostOnce).await {
                            error!(printer_id = %shared.printer_id, error = %e, "report subscription failed");
                        }
                        // Ask for one full report so the accumulated state
                        // starts complete; afterwards partial pushes suffice.
                        let request = serde_json::json!({
                            "pushing": {
                                "command": "pushall",
                                "sequence_id": Utc::now().timestamp_millis().to_string(),
                            }
                        });
                        let topic = format!("device/{serial}/request");
                        if let Err(e) = client
                            .publish(topic, QoS::AtMostOnce, false, request.to_string().into_bytes())
                            .await
                        {
                            error!(printer_id = %shared.printer_id, error = %e, "pushall request failed");
                        }
                        shared.connected.store(true, Ordering::SeqCst);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match serde_json::from_slice::<serde_json::Value>(&publish.payload) {
                            Ok(payload) => handle_report(&shared, payload),
                            Err(e) => {
                                warn!(printer_id = %shared.printer_id, error = %e, "unparseable MQTT payload");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if shared.connected.swap(false, Ordering::SeqCst) {
                            error!(printer_id = %shared.printer_id, error = %e, "MQTT connection lost");
                            push_status(
                                &shared,
                                StatusUpdate::new(&shared.printer_id, PrinterState::Offline),
                            );
                        }
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });
        *self.event_task.lock().await = Some(handle);

        // Wait for the first ConnAck, bounded by the connect timeout.
        let deadline = tokio::time::Instant::now() + self.connect_timeout;
        while tokio::time::Instant::now() < deadline {
            if self.is_connected() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.disconnect().await?;
        Err(PrinternizerError::ConnectionFailed {
            printer_id: self.shared.printer_id.clone(),
            reason: format!("no MQTT connection within {:?}", self.connect_timeout),
        })
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(handle) = self.event_task.lock().await.take() {
            handle.abort();
        }
        *self.mqtt.lock().expect("mqtt lock poisoned") = None;
        self.shared.connected.store(false, Ordering::SeqCst);
        info!(printer_id = %self.shared.printer_id, "disconnected from Bambu printer");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn get_status(&self) -> StatusUpdate {
        if !self.is_connected() {
            return StatusUpdate::error(&self.shared.printer_id, "Not connected");
        }
        if let Some(status) = self
            .shared
            .last_status
            .lock()
            .expect("status lock poisoned")
            .clone()
        {
            return status;
        }
        // Connected but nothing pushed yet.
        StatusUpdate::new(&self.shared.printer_id, PrinterState::Online)
    }

    async fn list_files(&self) -> Result<Vec<RemoteFile>> {
        if !self.is_connected() {
            return Err(not_connected(&self.shared.printer_id));
        }
        let index = self
            .shared
            .file_index
            .lock()
            .expect("file index lock poisoned");
        Ok(index.values().cloned().collect())
    }

    #[instrument(skip(self, local_path), fields(printer_id = %self.shared.printer_id, filename))]
    async fn download_file(&self, filename: &str, local_path: &Path) -> Result<()> {
        if !self.is_connected() {
            return Err(not_connected(&self.shared.printer_id));
        }

        let entry = {
            let index = self
                .shared
                .file_index
                .lock()
                .expect("file index lock poisoned");
            index.get(filename).cloned()
        }
        .ok_or_else(|| {
            PrinternizerError::DownloadFailed(format!(
                "file {filename} not announced by printer"
            ))
        })?;

        if !entry.path.starts_with("http://") && !entry.path.starts_with("https://") {
            return Err(PrinternizerError::DownloadFailed(format!(
                "no fetchable URL for {filename} (announced as {})",
                entry.path
            )));
        }

        info!(url = %entry.path, "downloading announced file");
        let response = self.http.get(&entry.path).send().await.map_err(|e| {
            PrinternizerError::DownloadFailed(format!("download request: {e}"))
        })?;
        if !response.status().is_success() {
            return Err(PrinternizerError::DownloadFailed(format!(
                "download returned HTTP {}",
                response.status().as_u16()
            )));
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
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                PrinternizerError::DownloadFailed(format!("download stream: {e}"))
            })?;
            if first {
                first = false;
                if looks_like_json(&chunk) {
                    return Err(PrinternizerError::DownloadFailed(
                        "downloaded JSON metadata instead of binary file".into(),
                    ));
                }
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        guard.disarm();
        info!(path = %local_path.display(), "downloaded file from Bambu printer");
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.publish_print_command("pause").await
    }

    async fn resume(&self) -> Result<()> {
        self.publish_print_command("resume").await
    }

    async fn stop(&self) -> Result<()> {
        self.publish_print_command("stop").await
    }

    fn has_camera(&self) -> bool {
        self.webcam_url.is_some()
    }

    fn camera_stream_url(&self) -> Option<String> {
        self.webcam_url.clone()
    }

    async fn take_snapshot(&self) -> Result<Option<Vec<u8>>> {
        let Some(url) = &self.webcam_url else {
            return Ok(None);
        };
        let response = self.http.get(url).send().await.map_err(|e| {
            PrinternizerError::ConnectionFailed {
                printer_id: self.shared.printer_id.clone(),
                reason: format!("snapshot request: {e}"),
            }
        })?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let bytes = response.bytes().await.map_err(|e| {
            PrinternizerError::ConnectionFailed {
                printer_id: self.shared.printer_id.clone(),
                reason: format!("snapshot read: {e}"),
            }
        })?;
        Ok(Some(bytes.to_vec()))
    }

    fn set_status_sink(&self, sink: StatusSink) {
        *self.shared.sink.lock().expect("sink lock poisoned") = Some(sink);
    }

    async fn start_monitoring(&self) -> Result<()> {
        // The MQTT subscription is already producing reports; monitoring
        // just gates whether they are forwarded.
        self.shared.monitoring.store(true, Ordering::SeqCst);
        info!(printer_id = %self.shared.printer_id, "Bambu monitoring started");
        Ok(())
    }

    async fn stop_monitoring(&self) {
        self.shared.monitoring.store(false, Ordering::SeqCst);
        info!(printer_id = %self.shared.printer_id, "Bambu monitoring stopped");
    }
}

/// Merge a report into the accumulated state, refresh the file index, and
/// forward the resulting snapshot.
fn handle_report(shared: &Arc<Shared>, payload: serde_json::Value) {
    index_announced_files(shared, &payload);

    let merged = {
        let mut accumulated = shared
            .accumulated
            .lock()
            .expect("accumulated lock poisoned");
        let merged = deep_merge(accumulated.clone(), payload);
        *accumulated = merged.clone();
        merged
    };

    let status = parse_report(&shared.printer_id, &merged);
    push_status(shared, status);
}

fn push_status(shared: &Arc<Shared>, status: StatusUpdate) {
    *shared
        .last_status
        .lock()
        .expect("status lock poisoned") = Some(status.clone());

    if shared.monitoring.load(Ordering::SeqCst) {
        let sink = shared.sink.lock().expect("sink lock poisoned").clone();
        if let Some(sink) = sink {
            if sink.send(status).is_err() {
                debug!(printer_id = %shared.printer_id, "status sink closed");
            }
        }
    }
}

/// Record files the printer announces. `project_file` commands carry the
/// project URL; `gcode_file` names the cache entry being printed.
fn index_announced_files(shared: &Arc<Shared>, payload: &serde_json::Value) {
    let Some(print) = payload.get("print") else {
        return;
    };
    let mut index = shared
        .file_index
        .lock()
        .expect("file index lock poisoned");

    if print.get("command").and_then(|v| v.as_str()) == Some("project_file") {
        let url = print.get("url").and_then(|v| v.as_str()).unwrap_or("");
        let name = print
            .get("subtask_name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .or_else(|| filename_from_url(url));
        if let Some(name) = name {
            index.insert(
                name.clone(),
                RemoteFile {
                    filename: name,
                    size: None,
                    modified: Some(Utc::now()),
                    path: url.to_string(),
                },
            );
        }
    }

    if let Some(gcode_file) = print
        .get("gcode_file")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
    {
        index
            .entry(gcode_file.to_string())
            .or_insert_with(|| RemoteFile {
                filename: gcode_file.to_string(),
                size: None,
                modified: Some(Utc::now()),
                path: gcode_file.to_string(),
            });
    }
}

fn filename_from_url(url: &str) -> Option<String> {
    let trimmed = url.split(['?', '#']).next()?;
    let name = trimmed.rsplit('/').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Deep-merge a partial report into the accumulated state.
///
/// Three fields get special treatment: an empty `subtask_name`, a zero
/// `mc_percent` mid-print, and a zero `mc_remaining_time` never overwrite a
/// meaningful existing value — partial pushes routinely omit or zero them.
pub(crate) fn deep_merge(
    mut base: serde_json::Value,
    new: serde_json::Value,
) -> serde_json::Value {
    match (&mut base, new) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(new_map)) => {
            for (key, value) in new_map {
                match base_map.get_mut(&key) {
                    Some(existing) => {
                        if key == "subtask_name"
                            && value.as_str().unwrap_or("").is_empty()
                            && !existing.as_str().unwrap_or("").is_empty()
                        {
                            continue;
                        }
                        if key == "mc_percent" && value.as_f64().unwrap_or(0.0) == 0.0 {
                            let current = existing.as_f64().unwrap_or(0.0);
                            if current > 0.0 && current < 100.0 {
                                continue;
                            }
                        }
                        if key == "mc_remaining_time"
                            && value.as_i64().unwrap_or(0) == 0
                            && existing.as_i64().unwrap_or(0) > 0
                        {
                            continue;
                        }
                        *existing = deep_merge(existing.clone(), value);
                    }
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
            base
        }
        (_, new_value) => new_value,
    }
}

/// Normalize accumulated Bambu state into a `StatusUpdate`.
pub(crate) fn parse_report(printer_id: &str, state: &serde_json::Value) -> StatusUpdate {
    let Some(print) = state.get("print") else {
        return StatusUpdate::new(printer_id, PrinterState::Unknown);
    };

    let gcode_state = print.get("gcode_state").and_then(|v| v.as_str());
    let print_error = print.get("print_error").and_then(|v| v.as_i64()).unwrap_or(0);
    let mc_percent = print.get("mc_percent").and_then(|v| v.as_f64());
    let mc_remaining = print
        .get("mc_remaining_time")
        .and_then(|v| v.as_i64())
        .filter(|v| *v > 0);

    let normalized = if print_error > 0 {
        PrinterState::Error
    } else {
        match gcode_state {
            Some("RUNNING") | Some("PRINTING") | Some("PREPARE") | Some("WORKING")
            | Some("SLICING") => PrinterState::Printing,
            Some("PAUSE") | Some("PAUSED") => PrinterState::Paused,
            Some("FAILED") | Some("ERROR") => PrinterState::Error,
            Some("FINISH") | Some("FINISHED") | Some("IDLE") => PrinterState::Online,
            Some(_) => PrinterState::Unknown,
            None => PrinterState::Unknown,
        }
    };

    let mut update = StatusUpdate::new(printer_id, normalized);
    if print_error > 0 {
        update.message = Some(format!("print_error={print_error}"));
    } else if let Some(state_str) = gcode_state {
        update.message = Some(format!("Bambu status: {state_str}"));
    }

    update.temperature_bed = print.get("bed_temper").and_then(|v| v.as_f64());
    update.temperature_bed_target = print.get("bed_target_temper").and_then(|v| v.as_f64());
    update.temperature_nozzle = print.get("nozzle_temper").and_then(|v| v.as_f64());
    update.temperature_nozzle_target =
        print.get("nozzle_target_temper").and_then(|v| v.as_f64());

    if let Some(percent) = mc_percent {
        update.progress = Some(percent.clamp(0.0, 100.0));
    }
    if let Some(remaining) = mc_remaining {
        update.remaining_minutes = Some(remaining as u32);
    }

    // The current job filename: gcode_file carries the cache path, the
    // subtask name is the display fallback.
    update.current_job = print
        .get("gcode_file")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            print
                .get("subtask_name")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty() && *s != "Unknown")
        })
        .map(|s| s.to_string());

    // The printer does not report elapsed time directly; reconstruct it from
    // progress and remaining so the start time survives reconnects.
    if update.state == PrinterState::Printing {
        if let (Some(percent), Some(remaining)) = (mc_percent, mc_remaining) {
            if percent > 0.0 && percent < 100.0 {
                let total_minutes = remaining as f64 / (1.0 - percent / 100.0);
                let elapsed_minutes = total_minutes - remaining as f64;
                if elapsed_minutes > 0.0 {
                    update.derive_start_time((elapsed_minutes * 60.0) as i64);
                }
            }
        }
    }

    update.raw = Some(state.clone());
    update.timestamp = Utc::now();
    update
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(print: serde_json::Value) -> serde_json::Value {
        serde_json::json!({"print": print})
    }

    #[test]
    fn gcode_state_mapping() {
        for (state, expected) in [
            ("RUNNING", PrinterState::Printing),
            ("PREPARE", PrinterState::Printing),
            ("PAUSE", PrinterState::Paused),
            ("FAILED", PrinterState::Error),
            ("FINISH", PrinterState::Online),
            ("IDLE", PrinterState::Online),
            ("WARBLE", PrinterState::Unknown),
        ] {
            let update = parse_report("p1", &report(serde_json::json!({"gcode_state": state})));
            assert_eq!(update.state, expected, "gcode_state {state}");
        }
    }

    #[test]
    fn print_error_wins_over_gcode_state() {
        let update = parse_report(
            "p1",
            &report(serde_json::json!({"gcode_state": "RUNNING", "print_error": 1203})),
        );
        assert_eq!(update.state, PrinterState::Error);
        assert!(update.message.expect("message").contains("1203"));
    }

    #[test]
    fn report_fields_normalized() {
        let update = parse_report(
            "p1",
            &report(serde_json::json!({
                "gcode_state": "RUNNING",
                "mc_percent": 42.0,
                "mc_remaining_time": 58,
                "bed_temper": 55.0,
                "nozzle_temper": 220.0,
                "nozzle_target_temper": 220.0,
                "gcode_file": "cache/Benchy.3mf",
                "subtask_name": "Benchy"
            })),
        );
        assert_eq!(update.state, PrinterState::Printing);
        assert_eq!(update.progress, Some(42.0));
        assert_eq!(update.remaining_minutes, Some(58));
        assert_eq!(update.current_job.as_deref(), Some("cache/Benchy.3mf"));
        assert_eq!(update.temperature_nozzle, Some(220.0));
        // elapsed = total - remaining = 58/(1-0.42) - 58 ≈ 42 minutes
        let elapsed = update.elapsed_minutes.expect("elapsed");
        assert!((41..=43).contains(&elapsed), "elapsed was {elapsed}");
        assert!(update.print_start_time.is_some());
    }

    #[test]
    fn absent_fields_stay_none() {
        let update = parse_report("p1", &report(serde_json::json!({"gcode_state": "IDLE"})));
        assert!(update.progress.is_none());
        assert!(update.temperature_bed.is_none());
        assert!(update.remaining_minutes.is_none());
        assert!(update.current_job.is_none());
    }

    #[test]
    fn deep_merge_preserves_progress_fields() {
        let base = serde_json::json!({"print": {
            "subtask_name": "Benchy",
            "mc_percent": 40.0,
            "mc_remaining_time": 30,
            "nozzle_temper": 220.0
        }});
        let partial = serde_json::json!({"print": {
            "subtask_name": "",
            "mc_percent": 0.0,
            "mc_remaining_time": 0,
            "nozzle_temper": 221.0
        }});
        let merged = deep_merge(base, partial);
        let print = &merged["print"];
        assert_eq!(print["subtask_name"], "Benchy");
        assert_eq!(print["mc_percent"], 40.0);
        assert_eq!(print["mc_remaining_time"], 30);
        assert_eq!(print["nozzle_temper"], 221.0);
    }

    #[test]
    fn deep_merge_allows_finished_progress() {
        let base = serde_json::json!({"print": {"mc_percent": 100.0}});
        let partial = serde_json::json!({"print": {"mc_percent": 0.0}});
        let merged = deep_merge(base, partial);
        // 100% is a completed print; resetting to zero is a new print.
        assert_eq!(merged["print"]["mc_percent"], 0.0);
    }

    #[test]
    fn deep_merge_adds_new_keys() {
        let base = serde_json::json!({"print": {"a": 1}});
        let partial = serde_json::json!({"print": {"b": 2}, "info": {"v": "1.0"}});
        let merged = deep_merge(base, partial);
        assert_eq!(merged["print"]["a"], 1);
        assert_eq!(merged["print"]["b"], 2);
        assert_eq!(merged["info"]["v"], "1.0");
    }

    #[test]
    fn url_filename_extraction() {
        assert_eq!(
            filename_from_url("http://192.168.1.5/files/Benchy.3mf?x=1"),
            Some("Benchy.3mf".into())
        );
        assert_eq!(filename_from_url("http://host/"), None);
        assert_eq!(filename_from_url(""), None);
    }
}
