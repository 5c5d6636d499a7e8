// SPDX-License-Identifier: AGPL-3.0-or-later
//
// The monitor consumes driver status updates. For every snapshot it
// persists the printer's state, enriches the snapshot with the resolved
// file row, publishes it, and triggers auto-download and auto-job creation.
//
// Filename reconciliation lives here, not in the drivers: matching the
// reported name against a listing needs the combination of both, and the
// listing may be served from cache.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use tracing::{debug, error, info, instrument, warn};

use printernizer_core::bus::{topics, EventBus};
use printernizer_core::types::{
    clean_filename, is_print_file, PrinterState, RemoteFile, StatusUpdate,
};
use printernizer_drivers::{DriverProvider, PrinterDriver};
use printernizer_files::DownloadManager;
use printernizer_store::SharedStore;

use crate::autojob::AutoJobEngine;

const SHUTDOWN_DEADLINE: std::time::Duration = std::time::Duration::from_secs(5);
/// Prefix length for truncation matching.
const PREFIX_MATCH_LEN: usize = 20;
/// Length difference that suggests printer-side truncation.
const TRUNCATION_MIN_DIFF: usize = 5;

pub struct Monitor {
    store: SharedStore,
    bus: EventBus,
    drivers: Arc<dyn DriverProvider>,
    downloads: Arc<DownloadManager>,
    autojob: Arc<AutoJobEngine>,
    /// Most recent status per printer. Written only by that printer's
    /// monitor path; readers take clones.
    live: StdMutex<HashMap<String, StatusUpdate>>,
    /// Per-printer filenames (and variants) already attempted for
    /// auto-download. Never retried within this process.
    attempts: StdMutex<HashMap<String, HashSet<String>>>,
    tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Self-handle for the tasks this monitor spawns.
    weak: std::sync::Weak<Monitor>,
}

impl Monitor {
    pub fn new(
        store: SharedStore,
        bus: EventBus,
        drivers: Arc<dyn DriverProvider>,
        downloads: Arc<DownloadManager>,
        autojob: Arc<AutoJobEngine>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            bus,
            drivers,
            downloads,
            autojob,
            live: StdMutex::new(HashMap::new()),
            attempts: StdMutex::new(HashMap::new()),
            tasks: StdMutex::new(Vec::new()),
            weak: weak.clone(),
        })
    }

    /// Register this monitor as the driver's status sink and start the
    /// per-printer consumer task. Status for one printer never blocks
    /// another's.
    pub fn attach(&self, driver: &Arc<dyn PrinterDriver>) {
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        driver.set_status_sink(sender);

        let Some(monitor) = self.weak.upgrade() else {
            return;
        };
        let kind = driver.kind();
        let printer_id = driver.printer_id().to_string();
        let handle = tokio::spawn(async move {
            while let Some(status) = receiver.recv().await {
                monitor.handle_status(status, kind).await;
            }
            debug!(%printer_id, "status channel closed");
        });
        self.tasks.lock().expect("tasks lock poisoned").push(handle);
    }

    /// Process one status update end to end.
    #[instrument(skip(self, status), fields(printer_id = %status.printer_id, state = status.state.as_str()))]
    pub async fn handle_status(
        &self,
        mut status: StatusUpdate,
        printer_kind: printernizer_core::types::PrinterKind,
    ) {
        // Persist first. A store failure is logged and the update is still
        // broadcast — availability beats durability for live status.
        {
            let store = self.store.lock().expect("store lock poisoned");
            if let Err(e) =
                store.update_printer_status(&status.printer_id, status.state, status.timestamp)
            {
                error!(error = %e, "failed to persist status update");
            }
        }

        // Resolve the current job to a stored file. The row is re-read on
        // every update so `current_job_has_thumbnail` only turns true after
        // thumbnail processing actually finished.
        self.enrich_with_file(&mut status);

        {
            let mut live = self.live.lock().expect("live lock poisoned");
            live.insert(status.printer_id.clone(), status.clone());
        }

        self.bus.publish(
            topics::PRINTER_STATUS_UPDATE,
            serde_json::json!({
                "printer_id": status.printer_id,
                "status": status.state.as_str(),
                "message": status.message,
                "temperature_bed": status.temperature_bed,
                "temperature_nozzle": status.temperature_nozzle,
                "progress": status.progress,
                "current_job": status.current_job,
                "current_job_file_id": status.current_job_file_id,
                "current_job_has_thumbnail": status.current_job_has_thumbnail,
                "current_job_thumbnail_url": status.current_job_thumbnail_url,
                "remaining_time_minutes": status.remaining_minutes,
                "elapsed_time_minutes": status.elapsed_minutes,
                "print_start_time": status.print_start_time.map(|t| t.to_rfc3339()),
                "timestamp": status.timestamp.to_rfc3339(),
            }),
        );

        self.check_auto_download(&status);

        if let Err(e) = self.autojob.ensure_job(&status, printer_kind, false).await {
            error!(error = %e, "auto-job creation failed");
        }

        // A printer back at online/error means the print is over — drop its
        // discovery entry so the next print is recognized as new.
        if matches!(status.state, PrinterState::Online | PrinterState::Error) {
            if let Some(job) = &status.current_job {
                self.autojob.clear_discovery(&status.printer_id, job);
            }
        }
    }

    /// Point-in-time copy of a printer's live status.
    pub fn live_status(&self, printer_id: &str) -> Option<StatusUpdate> {
        self.live
            .lock()
            .expect("live lock poisoned")
            .get(printer_id)
            .cloned()
    }

    pub fn all_live_statuses(&self) -> HashMap<String, StatusUpdate> {
        self.live.lock().expect("live lock poisoned").clone()
    }

    /// Drain consumer and download tasks under a deadline, then cancel.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
            tasks.drain(..).collect()
        };
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "draining monitor tasks");
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_DEADLINE, join_all).await.is_err() {
            warn!("monitor tasks timed out, cancelling");
            for abort in aborts {
                abort.abort();
            }
        }
    }

    // -- internal ------------------------------------------------------------

    fn enrich_with_file(&self, status: &mut StatusUpdate) {
        let Some(reported) = status.current_job.clone() else {
            return;
        };
        let store = self.store.lock().expect("store lock poisoned");
        let row = store
            .find_file_by_name(&status.printer_id, &reported)
            .ok()
            .flatten()
            .or_else(|| {
                store
                    .find_file_by_name(&status.printer_id, clean_filename(&reported))
                    .ok()
                    .flatten()
            });
        if let Some(row) = row {
            let has_thumbnail = row.has_thumbnail();
            status.current_job_file_id = Some(row.id.clone());
            status.current_job_has_thumbnail = Some(has_thumbnail);
            status.current_job_thumbnail_url =
                has_thumbnail.then(|| format!("/api/v1/files/{}/thumbnail", row.id));
        }
    }

    /// Kick off an auto-download when the printing file is unknown or known
    /// without a thumbnail. Runs in a tracked background task so a slow
    /// printer never holds up status handling.
    fn check_auto_download(&self, status: &StatusUpdate) {
        if status.state != PrinterState::Printing {
            return;
        }
        let Some(reported) = status.current_job.as_deref() else {
            return;
        };
        let needs_file = status.current_job_file_id.is_none()
            || status.current_job_has_thumbnail == Some(false);
        if !needs_file {
            return;
        }

        let filename = clean_filename(reported).to_string();
        if !is_print_file(&filename) {
            return;
        }

        {
            let mut attempts = self.attempts.lock().expect("attempts lock poisoned");
            let printer_attempts = attempts.entry(status.printer_id.clone()).or_default();
            if printer_attempts.contains(&filename) {
                return;
            }
            printer_attempts.insert(filename.clone());
        }

        let Some(monitor) = self.weak.upgrade() else {
            return;
        };
        let printer_id = status.printer_id.clone();
        let handle = tokio::spawn(async move {
            monitor.attempt_download(&printer_id, &filename).await;
        });
        self.tasks.lock().expect("tasks lock poisoned").push(handle);
    }

    /// Try the reported name, then the reconciliation variants, each at most
    /// once. The first success ends the search.
    async fn attempt_download(&self, printer_id: &str, filename: &str) {
        info!(printer_id, filename, "auto-downloading active print file");
        let mut attempted: Vec<(String, String)> = Vec::new();

        match self
            .downloads
            .download_file(printer_id, filename, None)
            .await
        {
            Ok(_) => {
                info!(printer_id, filename, "auto-download completed");
                return;
            }
            Err(e) => attempted.push((filename.to_string(), e.to_string())),
        }

        // The verbatim name failed; list the printer's files so variants can
        // be matched against reality.
        let listing: Vec<RemoteFile> = match self.drivers.driver(printer_id) {
            Some(driver) if driver.is_connected() => {
                driver.list_files().await.unwrap_or_default()
            }
            _ => Vec::new(),
        };

        for variant in reconciliation_variants(filename, &listing) {
            let already = {
                let mut attempts = self.attempts.lock().expect("attempts lock poisoned");
                let printer_attempts = attempts.entry(printer_id.to_string()).or_default();
                !printer_attempts.insert(variant.clone())
            };
            if already {
                continue;
            }

            match self.downloads.download_file(printer_id, &variant, None).await {
                Ok(_) => {
                    info!(
                        printer_id,
                        original = filename,
                        variant = %variant,
                        "auto-download completed via variant"
                    );
                    return;
                }
                Err(e) => attempted.push((variant, e.to_string())),
            }
        }

        warn!(
            printer_id,
            filename,
            attempts = ?attempted,
            "auto-download failed for every variant"
        );
    }
}

/// Candidate filenames for a reported name that failed verbatim, in the
/// order they should be tried:
///
/// 1. case-insensitive matches from the printer's listing
/// 2. the name without its `cache/` prefix
/// 3. `(`, `)`, `,` removed and whitespace collapsed
/// 4. spaces replaced with underscores
/// 5. listing entries whose lowercase 20-char prefix matches while lengths
///    differ by more than 5 (printer-side truncation)
pub(crate) fn reconciliation_variants(reported: &str, listing: &[RemoteFile]) -> Vec<String> {
    let mut variants: Vec<String> = Vec::new();
    let mut push = |candidate: String| {
        if candidate != reported && !candidate.is_empty() && !variants.contains(&candidate) {
            variants.push(candidate);
        }
    };

    let reported_lower = reported.to_lowercase();
    for file in listing {
        if file.filename.to_lowercase() == reported_lower && file.filename != reported {
            push(file.filename.clone());
        }
    }

    push(clean_filename(reported).to_string());

    let simple: String = reported
        .chars()
        .filter(|c| !matches!(c, '(' | ')' | ','))
        .collect();
    let simple = collapse_whitespace(&simple);
    push(simple.clone());

    push(simple.replace(' ', "_"));

    push(collapse_whitespace(reported));

    let prefix: String = reported_lower.chars().take(PREFIX_MATCH_LEN).collect();
    for file in listing {
        let lower = file.filename.to_lowercase();
        if lower.starts_with(&prefix)
            && file.filename.len().abs_diff(reported.len()) > TRUNCATION_MIN_DIFF
        {
            push(file.filename.clone());
        }
    }

    variants
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}
