// SPDX-License-Identifier: AGPL-3.0-or-later
//
// End-to-end fleet scenarios over a scripted driver: startup print
// detection, restart dedup, filename reconciliation, path-traversal
// refusal, and printer deletion guarded by active jobs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use printernizer_core::bus::{topics, EventBus};
use printernizer_core::config::PrinterConfig;
use printernizer_core::error::{PrinternizerError, Result};
use printernizer_core::types::{
    Job, JobId, JobStatus, PrinterKind, PrinterState, RemoteFile, StatusUpdate,
};
use printernizer_drivers::{DriverSettings, PrinterDriver, StatusSink};
use printernizer_files::DownloadManager;
use printernizer_fleet::{AutoJobEngine, ConnectionManager, Monitor};
use printernizer_store::{SharedStore, Store};

/// A fully scripted driver: fixed status, fixed file list, canned download
/// content, and a record of every download attempt.
struct ScriptedDriver {
    id: String,
    kind: PrinterKind,
    connected: AtomicBool,
    status: Mutex<StatusUpdate>,
    files: Vec<RemoteFile>,
    /// Filenames the driver will serve, with their content.
    downloadable: HashMap<String, Vec<u8>>,
    download_attempts: Mutex<Vec<String>>,
    sink: Mutex<Option<StatusSink>>,
}

impl ScriptedDriver {
    fn new(id: &str, kind: PrinterKind, status: StatusUpdate) -> Self {
        Self {
            id: id.to_string(),
            kind,
            connected: AtomicBool::new(false),
            status: Mutex::new(status),
            files: Vec::new(),
            downloadable: HashMap::new(),
            download_attempts: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
        }
    }

    fn with_file(mut self, filename: &str, content: &[u8]) -> Self {
        self.files.push(RemoteFile {
            filename: filename.to_string(),
            size: Some(content.len() as u64),
            modified: None,
            path: filename.to_string(),
        });
        self.downloadable
            .insert(filename.to_string(), content.to_vec());
        self
    }

    fn attempts(&self) -> Vec<String> {
        self.download_attempts.lock().expect("attempts").clone()
    }
}

#[async_trait]
impl PrinterDriver for ScriptedDriver {
    fn printer_id(&self) -> &str {
        &self.id
    }
    fn kind(&self) -> PrinterKind {
        self.kind
    }
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }
    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
    async fn get_status(&self) -> StatusUpdate {
        self.status.lock().expect("status").clone()
    }
    async fn list_files(&self) -> Result<Vec<RemoteFile>> {
        Ok(self.files.clone())
    }
    async fn download_file(&self, filename: &str, local_path: &Path) -> Result<()> {
        self.download_attempts
            .lock()
            .expect("attempts")
            .push(filename.to_string());
        match self.downloadable.get(filename) {
            Some(content) => {
                if let Some(parent) = local_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(local_path, content)?;
                Ok(())
            }
            None => Err(PrinternizerError::DownloadFailed(format!(
                "file {filename} not found on printer"
            ))),
        }
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
    fn set_status_sink(&self, sink: StatusSink) {
        *self.sink.lock().expect("sink") = Some(sink);
    }
    async fn start_monitoring(&self) -> Result<()> {
        Ok(())
    }
    async fn stop_monitoring(&self) {}
}

struct Fleet {
    store: SharedStore,
    bus: EventBus,
    connections: Arc<ConnectionManager>,
    monitor: Arc<Monitor>,
    autojob: Arc<AutoJobEngine>,
    downloads: Arc<DownloadManager>,
    _downloads_dir: tempfile::TempDir,
}

fn bambu_config(id: &str) -> PrinterConfig {
    serde_json::from_value(serde_json::json!({
        "name": format!("Printer {id}"),
        "type": "bambu_lab",
        "ip_address": "192.168.1.100",
        "access_code": "12345678",
        "serial_number": "01S00A3B0300123",
    }))
    .map(|mut c: PrinterConfig| {
        c.id = id.to_string();
        c
    })
    .expect("config")
}

/// Wire a fleet around one scripted driver, sharing `store` so restarts can
/// be simulated.
fn fleet_with_driver(store: SharedStore, driver: Arc<ScriptedDriver>) -> Fleet {
    let bus = EventBus::new();
    let downloads_dir = tempfile::tempdir().expect("downloads dir");

    let scripted = Arc::clone(&driver);
    let connections = ConnectionManager::with_driver_factory(
        store.clone(),
        bus.clone(),
        DriverSettings::default(),
        Arc::new(move |_config, _settings| Ok(scripted.clone() as Arc<dyn PrinterDriver>)),
    );
    let mut configs = HashMap::new();
    configs.insert(driver.id.clone(), bambu_config(&driver.id));
    connections.initialize(configs).expect("initialize");

    let provider: Arc<dyn printernizer_drivers::DriverProvider> = connections.clone();
    let downloads = Arc::new(DownloadManager::new(
        store.clone(),
        bus.clone(),
        provider.clone(),
        downloads_dir.path(),
    ));
    let autojob = Arc::new(AutoJobEngine::new(store.clone(), bus.clone(), true));
    let monitor = Monitor::new(
        store.clone(),
        bus.clone(),
        provider,
        downloads.clone(),
        autojob.clone(),
    );

    Fleet {
        store,
        bus,
        connections,
        monitor,
        autojob,
        downloads,
        _downloads_dir: downloads_dir,
    }
}

fn printing_status(printer_id: &str, filename: &str, start: DateTime<Utc>) -> StatusUpdate {
    let mut status = StatusUpdate::new(printer_id, PrinterState::Printing);
    status.current_job = Some(filename.to_string());
    status.progress = Some(42.0);
    status.print_start_time = Some(start);
    status
}

async fn recv_with_timeout(
    receiver: &mut tokio::sync::mpsc::UnboundedReceiver<printernizer_core::bus::Event>,
) -> printernizer_core::bus::Event {
    tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("event within deadline")
        .expect("bus open")
}

#[tokio::test]
async fn cold_start_with_print_in_progress_creates_startup_job() {
    let start = DateTime::parse_from_rfc3339("2025-01-10T14:00:00Z")
        .expect("timestamp")
        .with_timezone(&Utc);
    let store = Store::open_in_memory().expect("store").into_shared();
    let driver = Arc::new(ScriptedDriver::new(
        "bambu_001",
        PrinterKind::BambuLab,
        printing_status("bambu_001", "Benchy.3mf", start),
    ));
    let fleet = fleet_with_driver(store, driver);
    let mut created = fleet.bus.subscribe(topics::JOB_AUTO_CREATED);

    fleet
        .connections
        .connect_and_monitor("bambu_001", &fleet.monitor, &fleet.autojob)
        .await;

    let jobs = fleet
        .store
        .lock()
        .expect("store")
        .list_jobs("bambu_001", None, 10)
        .expect("list");
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.job_name, "Benchy");
    assert_eq!(job.filename, "Benchy.3mf");
    assert_eq!(job.start_time, Some(start));
    let info = job.customer_info.as_ref().expect("customer info");
    assert!(info.auto_created);
    assert!(info.discovered_on_startup);

    // Exactly one job_auto_created event.
    let event = recv_with_timeout(&mut created).await;
    assert_eq!(event.payload["printer_id"], "bambu_001");
    assert!(created.try_recv().is_err());
}

#[tokio::test]
async fn restart_mid_print_does_not_create_second_job() {
    let start = DateTime::parse_from_rfc3339("2025-01-10T14:00:00Z")
        .expect("timestamp")
        .with_timezone(&Utc);
    let store = Store::open_in_memory().expect("store").into_shared();

    // First process lifetime.
    {
        let driver = Arc::new(ScriptedDriver::new(
            "bambu_001",
            PrinterKind::BambuLab,
            printing_status("bambu_001", "Benchy.3mf", start),
        ));
        let fleet = fleet_with_driver(store.clone(), driver);
        fleet
            .connections
            .connect_and_monitor("bambu_001", &fleet.monitor, &fleet.autojob)
            .await;
    }

    // "Restart": fresh services over the same store, same printer status.
    let driver = Arc::new(ScriptedDriver::new(
        "bambu_001",
        PrinterKind::BambuLab,
        printing_status("bambu_001", "Benchy.3mf", start),
    ));
    let fleet = fleet_with_driver(store.clone(), driver);
    let mut created = fleet.bus.subscribe(topics::JOB_AUTO_CREATED);
    fleet
        .connections
        .connect_and_monitor("bambu_001", &fleet.monitor, &fleet.autojob)
        .await;

    let jobs = store
        .lock()
        .expect("store")
        .list_jobs("bambu_001", None, 10)
        .expect("list");
    assert_eq!(jobs.len(), 1, "restart must not duplicate the job");
    assert!(created.try_recv().is_err(), "no event on the second pass");
}

#[tokio::test]
async fn filename_reconciliation_finds_underscore_variant() {
    let store = Store::open_in_memory().expect("store").into_shared();
    let driver = Arc::new(
        ScriptedDriver::new(
            "prusa_001",
            PrinterKind::PrusaCore,
            printing_status("prusa_001", "Phone Stand v2.3mf", Utc::now()),
        )
        .with_file("Phone_Stand_v2.3mf", b"3mf-binary-content"),
    );
    driver.connected.store(true, Ordering::SeqCst);
    let fleet = fleet_with_driver(store, Arc::clone(&driver));
    let mut complete = fleet.bus.subscribe(topics::FILE_DOWNLOAD_COMPLETE);

    let status = printing_status("prusa_001", "Phone Stand v2.3mf", Utc::now());
    fleet
        .monitor
        .handle_status(status.clone(), PrinterKind::PrusaCore)
        .await;

    // Exactly one completion, for the reconciled name.
    let event = recv_with_timeout(&mut complete).await;
    assert_eq!(event.payload["filename"], "Phone_Stand_v2.3mf");

    // First attempt used the reported name and failed; second succeeded.
    let attempts = driver.attempts();
    assert_eq!(
        attempts,
        vec!["Phone Stand v2.3mf".to_string(), "Phone_Stand_v2.3mf".to_string()]
    );

    // A repeat status update must not retry either name.
    fleet
        .monitor
        .handle_status(status, PrinterKind::PrusaCore)
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(driver.attempts().len(), 2, "no third attempt");
    assert!(complete.try_recv().is_err());
}

#[tokio::test]
async fn cache_prefixed_filename_resolves_against_plain_index_entry() {
    let store = Store::open_in_memory().expect("store").into_shared();
    let driver = Arc::new(
        ScriptedDriver::new(
            "bambu_001",
            PrinterKind::BambuLab,
            printing_status("bambu_001", "cache/Model.3mf", Utc::now()),
        )
        .with_file("Model.3mf", b"3mf-content"),
    );
    driver.connected.store(true, Ordering::SeqCst);
    let fleet = fleet_with_driver(store, Arc::clone(&driver));
    let mut complete = fleet.bus.subscribe(topics::FILE_DOWNLOAD_COMPLETE);

    fleet
        .monitor
        .handle_status(
            printing_status("bambu_001", "cache/Model.3mf", Utc::now()),
            PrinterKind::BambuLab,
        )
        .await;

    let event = recv_with_timeout(&mut complete).await;
    assert_eq!(event.payload["filename"], "Model.3mf");
    // The cache prefix was stripped before the first attempt, so the plain
    // name succeeded immediately.
    assert_eq!(driver.attempts(), vec!["Model.3mf".to_string()]);
}

#[tokio::test]
async fn download_complete_precedes_thumbnail_handoff() {
    let store = Store::open_in_memory().expect("store").into_shared();
    let driver = Arc::new(
        ScriptedDriver::new(
            "p1",
            PrinterKind::PrusaCore,
            StatusUpdate::new("p1", PrinterState::Online),
        )
        .with_file("part.gcode", b"G28\nG1 X10\n"),
    );
    driver.connected.store(true, Ordering::SeqCst);
    let fleet = fleet_with_driver(store, driver);

    // One subscriber over both topics observes the ordering contract.
    let mut complete = fleet.bus.subscribe(topics::FILE_DOWNLOAD_COMPLETE);
    let mut needs = fleet.bus.subscribe(topics::FILE_NEEDS_THUMBNAIL_PROCESSING);

    fleet
        .downloads
        .download_file("p1", "part.gcode", None)
        .await
        .expect("download");

    let complete_event = recv_with_timeout(&mut complete).await;
    let needs_event = recv_with_timeout(&mut needs).await;
    assert_eq!(complete_event.payload["file_id"], "p1_part.gcode");
    assert_eq!(needs_event.payload["file_id"], "p1_part.gcode");
    assert!(complete_event.timestamp <= needs_event.timestamp);
}

#[tokio::test]
async fn path_traversal_is_refused_and_reported() {
    let store = Store::open_in_memory().expect("store").into_shared();
    let driver = Arc::new(ScriptedDriver::new(
        "p1",
        PrinterKind::PrusaCore,
        StatusUpdate::new("p1", PrinterState::Online),
    ));
    driver.connected.store(true, Ordering::SeqCst);
    let fleet = fleet_with_driver(store, Arc::clone(&driver));
    let mut failed = fleet.bus.subscribe(topics::FILE_DOWNLOAD_FAILED);

    let err = fleet
        .downloads
        .download_file("p1", "../../etc/shadow", None)
        .await;
    assert!(matches!(err, Err(PrinternizerError::PathTraversal(_))));

    // The driver was never asked to download anything.
    assert!(driver.attempts().is_empty());

    let event = recv_with_timeout(&mut failed).await;
    assert_eq!(event.payload["error_kind"], "path_traversal");

    let state = fleet.downloads.download_status("p1_../../etc/shadow");
    assert_eq!(state["status"], "failed");
}

#[tokio::test]
async fn delete_printer_refuses_then_forces_keeping_jobs() {
    let store = Store::open_in_memory().expect("store").into_shared();
    let driver = Arc::new(ScriptedDriver::new(
        "p1",
        PrinterKind::PrusaCore,
        StatusUpdate::new("p1", PrinterState::Online),
    ));
    let fleet = fleet_with_driver(store.clone(), driver);

    let job = Job {
        id: JobId::new(),
        printer_id: "p1".into(),
        printer_kind: PrinterKind::PrusaCore,
        job_name: "Benchy".into(),
        filename: "Benchy.3mf".into(),
        status: JobStatus::Running,
        created_at: Utc::now(),
        start_time: None,
        progress: 10.0,
        file_id: None,
        customer_info: None,
    };
    assert!(store.lock().expect("store").insert_job(&job).expect("insert"));

    let err = fleet.connections.delete_printer("p1", false).await;
    assert!(matches!(
        err,
        Err(PrinternizerError::ActiveJobsPresent { count: 1, .. })
    ));

    fleet
        .connections
        .delete_printer("p1", true)
        .await
        .expect("forced delete");

    // Printer row and driver are gone; the job row is untouched.
    {
        let store = store.lock().expect("store");
        assert!(store.get_printer("p1").expect("query").is_none());
        let jobs = store.list_jobs("p1", None, 10).expect("list");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job.id);
    }
    use printernizer_drivers::DriverProvider;
    assert!(fleet.connections.driver("p1").is_none());
}

#[tokio::test]
async fn monitor_enriches_status_with_file_row_and_cleans_discovery() {
    let store = Store::open_in_memory().expect("store").into_shared();
    let driver = Arc::new(ScriptedDriver::new(
        "p1",
        PrinterKind::BambuLab,
        StatusUpdate::new("p1", PrinterState::Online),
    ));
    driver.connected.store(true, Ordering::SeqCst);
    let fleet = fleet_with_driver(store.clone(), driver);

    // A known file with a thumbnail already processed.
    {
        let record =
            printernizer_core::types::PrinterFileRecord::new_printer_file("p1", "Benchy.3mf");
        let store = store.lock().expect("store");
        store.upsert_file(&record).expect("upsert");
        store
            .set_file_thumbnail(
                &record.id,
                &printernizer_core::types::Thumbnail {
                    data: vec![1],
                    width: 200,
                    height: 200,
                    format: "png".into(),
                    source: printernizer_core::types::ThumbnailSource::Embedded,
                },
            )
            .expect("thumbnail");
    }

    let mut updates = fleet.bus.subscribe(topics::PRINTER_STATUS_UPDATE);
    fleet
        .monitor
        .handle_status(
            printing_status("p1", "Benchy.3mf", Utc::now()),
            PrinterKind::BambuLab,
        )
        .await;

    let event = recv_with_timeout(&mut updates).await;
    assert_eq!(event.payload["current_job_file_id"], "p1_Benchy.3mf");
    assert_eq!(event.payload["current_job_has_thumbnail"], true);
    assert_eq!(
        event.payload["current_job_thumbnail_url"],
        "/api/v1/files/p1_Benchy.3mf/thumbnail"
    );

    // The live map carries the enriched snapshot too.
    let live = fleet.monitor.live_status("p1").expect("live");
    assert_eq!(live.current_job_file_id.as_deref(), Some("p1_Benchy.3mf"));

    // Back to online: the discovery entry is dropped, so the next print of
    // the same file counts as new once the job is closed out.
    let mut done = StatusUpdate::new("p1", PrinterState::Online);
    done.current_job = Some("Benchy.3mf".into());
    fleet.monitor.handle_status(done, PrinterKind::BambuLab).await;
}

#[tokio::test]
async fn connection_test_does_not_touch_registry() {
    let store = Store::open_in_memory().expect("store").into_shared();
    let driver = Arc::new(ScriptedDriver::new(
        "p1",
        PrinterKind::PrusaCore,
        StatusUpdate::new("p1", PrinterState::Online),
    ));
    let fleet = fleet_with_driver(store, driver);

    let candidate = bambu_config("candidate");
    let result = fleet.connections.test_connection(&candidate).await;
    assert!(result.success);
    assert!(result.response_time_ms.is_some());

    // The candidate never entered the registry.
    use printernizer_drivers::DriverProvider;
    assert!(fleet.connections.driver("candidate").is_none());
    assert_eq!(fleet.connections.printer_ids(), vec!["p1".to_string()]);
}

#[tokio::test]
async fn health_check_reports_connection_counts() {
    let store = Store::open_in_memory().expect("store").into_shared();
    let driver = Arc::new(ScriptedDriver::new(
        "p1",
        PrinterKind::PrusaCore,
        StatusUpdate::new("p1", PrinterState::Online),
    ));
    let fleet = fleet_with_driver(store, Arc::clone(&driver));

    let before = fleet.connections.health_check().await;
    assert_eq!(before.total_printers, 1);
    assert_eq!(before.connected_printers, 0);

    fleet
        .connections
        .connect_printer("p1")
        .await
        .expect("connect");
    let after = fleet.connections.health_check().await;
    assert_eq!(after.connected_printers, 1);
    assert_eq!(after.healthy_printers, 1);
    assert!(after.printers["p1"].connected);
}
