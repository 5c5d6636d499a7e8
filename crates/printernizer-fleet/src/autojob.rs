// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Auto-job engine: whenever a printer is observed printing, ensure exactly
// one job row exists for that print. Robust against polling jitter, process
// restarts, mid-print reconnects, and racing status callbacks.
//
// Dedup rests on the printer-reported start time (stable across restarts),
// truncated to the minute; the first-seen time is only the fallback. The
// in-memory structures are an optimization — correctness comes from the
// store queries and the dedup index.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Duration, Timelike, Utc};
use tracing::{debug, error, info, instrument};

use printernizer_core::bus::{topics, EventBus};
use printernizer_core::error::Result;
use printernizer_core::types::{
    clean_filename, job_name_from_filename, CustomerInfo, Job, JobId, JobStatus, PrinterKind,
    PrinterState, StatusUpdate,
};
use printernizer_store::SharedStore;

/// ± window for matching historical jobs: absorbs clock drift, elapsed-time
/// computation drift, and restart skew.
const DEDUP_WINDOW: i64 = 5;
/// How many recent jobs the historical search covers.
const HISTORY_LOOKBACK: usize = 100;
const ACTIVE_LOOKBACK: usize = 50;

pub struct AutoJobEngine {
    store: SharedStore,
    bus: EventBus,
    enabled: AtomicBool,
    /// `(printer_id, filename)` → when this print was first observed.
    discoveries: StdMutex<HashMap<(String, String), DateTime<Utc>>>,
    /// Per-printer job keys already handled in this process.
    cache: StdMutex<HashMap<String, HashSet<String>>>,
    /// Serializes job creation across all printers. Contention is negligible
    /// next to printer I/O.
    creation_lock: tokio::sync::Mutex<()>,
}

impl AutoJobEngine {
    pub fn new(store: SharedStore, bus: EventBus, enabled: bool) -> Self {
        Self {
            store,
            bus,
            enabled: AtomicBool::new(enabled),
            discoveries: StdMutex::new(HashMap::new()),
            cache: StdMutex::new(HashMap::new()),
            creation_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Ensure a job row exists for the print described by `status`.
    /// `is_startup` marks prints the system discovered while connecting
    /// rather than witnessed starting.
    #[instrument(skip(self, status), fields(printer_id = %status.printer_id, is_startup))]
    pub async fn ensure_job(
        &self,
        status: &StatusUpdate,
        printer_kind: PrinterKind,
        is_startup: bool,
    ) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        if status.state != PrinterState::Printing {
            return Ok(());
        }
        let Some(filename) = status.current_job.as_deref() else {
            return Ok(());
        };

        let printer_id = status.printer_id.clone();
        let discovery_key = (printer_id.clone(), filename.to_string());
        let discovery_time = {
            let mut discoveries = self.discoveries.lock().expect("discoveries lock poisoned");
            match discoveries.get(&discovery_key) {
                Some(time) => *time,
                None => {
                    let now = Utc::now();
                    discoveries.insert(discovery_key, now);
                    info!(
                        filename,
                        print_start_time = ?status.print_start_time,
                        "discovered new print"
                    );
                    now
                }
            }
        };

        let reference_time = status.print_start_time.unwrap_or(discovery_time);
        let job_key = make_job_key(&printer_id, filename, reference_time);

        let _guard = self.creation_lock.lock().await;

        // Fast path: this process already handled the print.
        {
            let cache = self.cache.lock().expect("cache lock poisoned");
            if cache
                .get(&printer_id)
                .is_some_and(|keys| keys.contains(&job_key))
            {
                debug!(job_key, "job already created (cached)");
                return Ok(());
            }
        }

        // Any active job for this filename — manual or auto — suppresses
        // creation.
        if let Some(existing) = self.find_active_job(&printer_id, filename)? {
            info!(job_id = %existing.id, status = existing.status.as_str(), "active job already exists");
            self.remember(&printer_id, job_key);
            return Ok(());
        }

        // Historical search finds the same print across restarts.
        if let Some(existing) = self.find_existing_job(&printer_id, filename, reference_time)? {
            info!(
                job_id = %existing.id,
                existing_start = ?existing.start_time,
                "job already exists in store"
            );
            self.remember(&printer_id, job_key);
            return Ok(());
        }

        self.create_job(status, printer_kind, discovery_time, is_startup)
            .await?;
        self.remember(&printer_id, job_key);
        Ok(())
    }

    /// Drop the discovery entry when the print ends. The cache entry stays —
    /// it is a one-shot dedup for the print's lifetime.
    pub fn clear_discovery(&self, printer_id: &str, filename: &str) {
        self.discoveries
            .lock()
            .expect("discoveries lock poisoned")
            .remove(&(printer_id.to_string(), filename.to_string()));
    }

    // -- internal ------------------------------------------------------------

    fn remember(&self, printer_id: &str, job_key: String) {
        self.cache
            .lock()
            .expect("cache lock poisoned")
            .entry(printer_id.to_string())
            .or_default()
            .insert(job_key);
    }

    fn find_active_job(&self, printer_id: &str, filename: &str) -> Result<Option<Job>> {
        let wanted = clean_filename(filename);
        let store = self.store.lock().expect("store lock poisoned");
        for status in [JobStatus::Running, JobStatus::Pending, JobStatus::Paused] {
            let jobs = store.list_jobs(printer_id, Some(status), ACTIVE_LOOKBACK)?;
            for job in jobs {
                if clean_filename(&job.filename) == wanted {
                    return Ok(Some(job));
                }
            }
        }
        Ok(None)
    }

    fn find_existing_job(
        &self,
        printer_id: &str,
        filename: &str,
        reference_time: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let wanted = clean_filename(filename);
        let window_start = reference_time - Duration::minutes(DEDUP_WINDOW);
        let window_end = reference_time + Duration::minutes(DEDUP_WINDOW);

        let jobs = self
            .store
            .lock()
            .expect("store lock poisoned")
            .list_jobs(printer_id, None, HISTORY_LOOKBACK)?;

        for job in jobs {
            if clean_filename(&job.filename) != wanted {
                continue;
            }
            // start_time is preferred — it is stable across restarts.
            // created_at only matches when the printer never reported one.
            let candidate = job.start_time.unwrap_or(job.created_at);
            if candidate >= window_start && candidate <= window_end {
                debug!(
                    job_id = %job.id,
                    matched_on = if job.start_time.is_some() { "start_time" } else { "created_at" },
                    "found existing job in window"
                );
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn create_job(
        &self,
        status: &StatusUpdate,
        printer_kind: PrinterKind,
        discovery_time: DateTime<Utc>,
        is_startup: bool,
    ) -> Result<()> {
        let filename = status.current_job.clone().unwrap_or_default();
        let job = Job {
            id: JobId::new(),
            printer_id: status.printer_id.clone(),
            printer_kind,
            job_name: job_name_from_filename(&filename),
            filename: filename.clone(),
            status: JobStatus::Running,
            created_at: discovery_time,
            start_time: status.print_start_time,
            progress: status.progress.unwrap_or(0.0),
            file_id: status.current_job_file_id.clone(),
            customer_info: Some(CustomerInfo {
                auto_created: true,
                discovered_on_startup: is_startup,
                printer_start_time: status.print_start_time,
                discovery_time: Some(discovery_time),
            }),
        };

        let inserted = self
            .store
            .lock()
            .expect("store lock poisoned")
            .insert_job(&job);

        match inserted {
            Ok(true) => {
                info!(
                    job_id = %job.id,
                    filename = %filename,
                    is_startup,
                    "auto-created job"
                );
                self.bus.publish(
                    topics::JOB_AUTO_CREATED,
                    serde_json::json!({
                        "job_id": job.id.to_string(),
                        "printer_id": status.printer_id,
                        "filename": filename,
                        "discovery_time": discovery_time.to_rfc3339(),
                    }),
                );
                Ok(())
            }
            // The dedup index fired: another path created the row first.
            Ok(false) => {
                info!(filename = %filename, "duplicate job prevented by store");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to auto-create job");
                Err(e)
            }
        }
    }
}

/// Dedup key: printer, cache-stripped filename, and the reference time
/// truncated to the minute (absorbs 30-second polling jitter).
fn make_job_key(printer_id: &str, filename: &str, reference_time: DateTime<Utc>) -> String {
    let minute = reference_time
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(reference_time);
    format!(
        "{printer_id}:{}:{}",
        clean_filename(filename),
        minute.to_rfc3339()
    )
}
