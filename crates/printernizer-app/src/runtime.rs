// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Service wiring. Builds the store, bus, drivers, pipeline, and fleet
// services from configuration and owns the startup/shutdown order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use printernizer_core::bus::EventBus;
use printernizer_core::config::{PrinterConfig, Settings};
use printernizer_core::error::Result;
use printernizer_drivers::DriverSettings;
use printernizer_files::{DownloadManager, FileDiscoveryService, ThumbnailService, UploadService};
use printernizer_fleet::{AutoJobEngine, ConnectionManager, Monitor};
use printernizer_store::{SharedStore, Store};

pub struct FleetRuntime {
    pub settings: Settings,
    pub store: SharedStore,
    pub bus: EventBus,
    pub connections: Arc<ConnectionManager>,
    pub monitor: Arc<Monitor>,
    pub autojob: Arc<AutoJobEngine>,
    pub downloads: Arc<DownloadManager>,
    pub discovery: Arc<FileDiscoveryService>,
    pub thumbnails: Arc<ThumbnailService>,
    pub uploads: Arc<UploadService>,
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl FleetRuntime {
    /// Build every service. Nothing connects yet — `start` does that.
    pub fn build(settings: Settings, printers: HashMap<String, PrinterConfig>) -> Result<Self> {
        let store = Store::open(&settings.database_path)?.into_shared();
        let bus = EventBus::new();

        let driver_settings = DriverSettings {
            connect_timeout: Duration::from_secs(settings.connection_timeout_secs),
            request_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(settings.monitoring_interval_secs),
        };

        let connections = ConnectionManager::new(store.clone(), bus.clone(), driver_settings);
        connections.initialize(printers)?;
        let provider: Arc<dyn printernizer_drivers::DriverProvider> = connections.clone();

        let downloads = Arc::new(DownloadManager::new(
            store.clone(),
            bus.clone(),
            provider.clone(),
            &settings.downloads_path,
        ));
        let discovery = Arc::new(FileDiscoveryService::new(
            store.clone(),
            bus.clone(),
            provider.clone(),
        ));
        let thumbnails = ThumbnailService::new(store.clone(), bus.clone(), provider.clone());
        let uploads = Arc::new(UploadService::new(
            store.clone(),
            bus.clone(),
            format!("{}/library", settings.downloads_path),
            settings.upload_enabled,
            settings.max_upload_size_mb,
        ));

        let autojob = Arc::new(AutoJobEngine::new(
            store.clone(),
            bus.clone(),
            settings.job_creation_auto_create,
        ));
        let monitor = Monitor::new(
            store.clone(),
            bus.clone(),
            provider,
            downloads.clone(),
            autojob.clone(),
        );

        Ok(Self {
            settings,
            store,
            bus,
            connections,
            monitor,
            autojob,
            downloads,
            discovery,
            thumbnails,
            uploads,
            background: Vec::new(),
        })
    }

    /// Start the fleet: thumbnail subscriber, parallel printer connection
    /// fan-out, and the periodic discovery loop. Returns immediately — the
    /// connection tasks run in the background.
    pub fn start(&mut self) {
        self.background.push(self.thumbnails.spawn_subscriber());

        let connect_tasks = self.connections.connect_all(&self.monitor, &self.autojob);
        self.background.extend(connect_tasks);

        if self.settings.discovery_enabled {
            self.background.push(self.spawn_discovery_loop());
        }

        self.background.push(self.spawn_download_cleanup_loop());

        info!("fleet runtime started");
    }

    /// Hourly sweep of terminal download-state entries older than a day.
    fn spawn_download_cleanup_loop(&self) -> tokio::task::JoinHandle<()> {
        let downloads = self.downloads.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60 * 60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                downloads.cleanup_download_status(24);
            }
        })
    }

    fn spawn_discovery_loop(&self) -> tokio::task::JoinHandle<()> {
        let discovery = self.discovery.clone();
        let connections = self.connections.clone();
        let run_on_startup = self.settings.discovery_run_on_startup;
        let startup_delay = Duration::from_secs(self.settings.discovery_startup_delay_secs);
        // Discovery reuses the monitoring cadence scaled up: file listings
        // change far slower than status.
        let interval = Duration::from_secs(self.settings.monitoring_interval_secs.max(30) * 10);

        tokio::spawn(async move {
            if run_on_startup {
                tokio::time::sleep(startup_delay).await;
                run_discovery_pass(&discovery, &connections).await;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                run_discovery_pass(&discovery, &connections).await;
            }
        })
    }

    /// Ordered shutdown: discovery loop and connect tasks first, then the
    /// monitor and pipeline drain their work, then every driver disconnects.
    pub async fn shutdown(mut self) {
        info!("fleet runtime shutting down");
        for handle in self.background.drain(..) {
            handle.abort();
        }
        self.monitor.shutdown().await;
        self.thumbnails.shutdown().await;
        self.connections.shutdown().await;
        info!("fleet runtime shutdown complete");
    }
}

async fn run_discovery_pass(
    discovery: &Arc<FileDiscoveryService>,
    connections: &Arc<ConnectionManager>,
) {
    for printer_id in connections.printer_ids() {
        if let Err(e) = discovery.sync_printer_files(&printer_id).await {
            warn!(printer_id = %printer_id, error = %e, "periodic file sync failed");
        }
    }
}
