// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Connection manager: exclusive owner of driver instances. Creates one
// driver per active configuration, connects and reconnects them, and hands
// out read access through the `DriverProvider` capability interface that the
// monitor and file pipeline consume.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use printernizer_core::bus::{topics, EventBus};
use printernizer_core::config::PrinterConfig;
use printernizer_core::error::{PrinternizerError, Result};
use printernizer_core::types::{PrinterState, StatusUpdate};
use printernizer_drivers::{create_driver, DriverProvider, DriverSettings, PrinterDriver};
use printernizer_store::SharedStore;

use crate::autojob::AutoJobEngine;
use crate::monitor::Monitor;

/// Result of probing a candidate configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    pub message: String,
    pub response_time_ms: Option<u64>,
}

/// Per-printer entry in the health report.
#[derive(Debug, Clone, Serialize)]
pub struct PrinterHealth {
    pub connected: bool,
    pub healthy: bool,
    pub name: String,
    pub ip_address: String,
    pub last_seen: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub total_printers: usize,
    pub connected_printers: usize,
    pub healthy_printers: usize,
    pub printers: HashMap<String, PrinterHealth>,
}

/// How drivers are instantiated. Injectable so tests can substitute
/// scripted drivers for real protocol clients.
pub type DriverFactory = Arc<
    dyn Fn(&PrinterConfig, &DriverSettings) -> Result<Arc<dyn PrinterDriver>> + Send + Sync,
>;

pub struct ConnectionManager {
    store: SharedStore,
    bus: EventBus,
    driver_settings: DriverSettings,
    driver_factory: DriverFactory,
    /// Registry changes are rare; readers take snapshots.
    drivers: RwLock<HashMap<String, Arc<dyn PrinterDriver>>>,
    configs: RwLock<HashMap<String, PrinterConfig>>,
    /// Self-handle for the connection tasks this manager spawns.
    weak: std::sync::Weak<ConnectionManager>,
}

impl DriverProvider for ConnectionManager {
    fn driver(&self, printer_id: &str) -> Option<Arc<dyn PrinterDriver>> {
        self.drivers
            .read()
            .expect("registry lock poisoned")
            .get(printer_id)
            .cloned()
    }
}

impl ConnectionManager {
    pub fn new(store: SharedStore, bus: EventBus, driver_settings: DriverSettings) -> Arc<Self> {
        Self::with_driver_factory(
            store,
            bus,
            driver_settings,
            Arc::new(|config, settings| create_driver(config, settings)),
        )
    }

    pub fn with_driver_factory(
        store: SharedStore,
        bus: EventBus,
        driver_settings: DriverSettings,
        driver_factory: DriverFactory,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            bus,
            driver_settings,
            driver_factory,
            drivers: RwLock::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
            weak: weak.clone(),
        })
    }

    /// Create a driver for every active configuration and sync the printer
    /// rows. Inactive configurations are stored but get no driver.
    #[instrument(skip_all, fields(count = configs.len()))]
    pub fn initialize(&self, configs: HashMap<String, PrinterConfig>) -> Result<()> {
        for (printer_id, config) in &configs {
            {
                let store = self.store.lock().expect("store lock poisoned");
                store.upsert_printer(config)?;
            }
            if !config.is_active {
                debug!(printer_id, "printer inactive, no driver created");
                continue;
            }
            match (self.driver_factory)(config, &self.driver_settings) {
                Ok(driver) => {
                    self.drivers
                        .write()
                        .expect("registry lock poisoned")
                        .insert(printer_id.clone(), driver);
                    info!(printer_id, kind = config.kind.as_str(), "driver created");
                }
                Err(e) => {
                    error!(printer_id, error = %e, "driver creation failed");
                }
            }
        }
        let mut stored = self.configs.write().expect("config lock poisoned");
        *stored = configs;
        info!(
            drivers = self.drivers.read().expect("registry lock poisoned").len(),
            "connection manager initialized"
        );
        Ok(())
    }

    /// Ids of all registered drivers.
    pub fn printer_ids(&self) -> Vec<String> {
        self.drivers
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Connect one printer. Idempotent; updates `last_seen` and publishes
    /// `printer_connected` on success.
    pub async fn connect_printer(&self, printer_id: &str) -> Result<()> {
        let driver = self
            .driver(printer_id)
            .ok_or_else(|| PrinternizerError::PrinterNotFound(printer_id.to_string()))?;

        driver.connect().await?;
        {
            let store = self.store.lock().expect("store lock poisoned");
            store.update_printer_status(printer_id, PrinterState::Online, Utc::now())?;
        }
        self.bus.publish(
            topics::PRINTER_CONNECTED,
            serde_json::json!({
                "printer_id": printer_id,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );
        info!(printer_id, "printer connected");
        Ok(())
    }

    pub async fn disconnect_printer(&self, printer_id: &str) -> Result<()> {
        let driver = self
            .driver(printer_id)
            .ok_or_else(|| PrinternizerError::PrinterNotFound(printer_id.to_string()))?;

        driver.stop_monitoring().await;
        self.bus.publish(
            topics::PRINTER_MONITORING_STOPPED,
            serde_json::json!({
                "printer_id": printer_id,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );
        driver.disconnect().await?;
        self.bus.publish(
            topics::PRINTER_DISCONNECTED,
            serde_json::json!({
                "printer_id": printer_id,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );
        info!(printer_id, "printer disconnected");
        Ok(())
    }

    /// Apply an updated configuration: validate, replace the driver, and
    /// reconnect through the usual combined path. The old driver is
    /// disconnected first so no two drivers ever speak for one printer.
    pub async fn update_printer(
        &self,
        config: PrinterConfig,
        monitor: &Arc<Monitor>,
        autojob: &Arc<AutoJobEngine>,
    ) -> Result<()> {
        config.validate()?;
        let printer_id = config.id.clone();

        if let Some(old) = self.driver(&printer_id) {
            old.stop_monitoring().await;
            if let Err(e) = old.disconnect().await {
                warn!(error = %e, "disconnect of replaced driver failed");
            }
        }

        {
            let store = self.store.lock().expect("store lock poisoned");
            store.upsert_printer(&config)?;
        }

        if config.is_active {
            let driver = (self.driver_factory)(&config, &self.driver_settings)?;
            self.drivers
                .write()
                .expect("registry lock poisoned")
                .insert(printer_id.clone(), driver);
        } else {
            self.drivers
                .write()
                .expect("registry lock poisoned")
                .remove(&printer_id);
        }
        self.configs
            .write()
            .expect("config lock poisoned")
            .insert(printer_id.clone(), config.clone());

        info!(printer = %config.safe_json(), "printer configuration updated");
        if config.is_active {
            self.connect_and_monitor(&printer_id, monitor, autojob).await;
        }
        Ok(())
    }

    /// The combined startup path: connect with progress events, detect a
    /// print already in progress, attach the monitor, start monitoring.
    #[instrument(skip(self, monitor, autojob), fields(printer_id))]
    pub async fn connect_and_monitor(
        &self,
        printer_id: &str,
        monitor: &Arc<Monitor>,
        autojob: &Arc<AutoJobEngine>,
    ) {
        let started = Instant::now();
        self.publish_progress(printer_id, "connecting", "Initiating connection...");

        let Some(driver) = self.driver(printer_id) else {
            self.publish_progress(printer_id, "error", "No driver registered");
            return;
        };

        if !driver.is_connected() {
            match driver.connect().await {
                Ok(()) => {
                    let elapsed = started.elapsed();
                    {
                        let store = self.store.lock().expect("store lock poisoned");
                        if let Err(e) = store.update_printer_status(
                            printer_id,
                            PrinterState::Online,
                            Utc::now(),
                        ) {
                            error!(error = %e, "failed to record connection");
                        }
                    }
                    info!(duration_ms = elapsed.as_millis() as u64, "printer connection successful");
                    self.publish_progress(
                        printer_id,
                        "connected",
                        &format!("Connected in {:.1}s", elapsed.as_secs_f64()),
                    );

                    // A print may already be running — recreate its job with
                    // the startup flag so provenance is recorded.
                    let status = driver.get_status().await;
                    if status.state == PrinterState::Printing && status.current_job.is_some() {
                        info!(
                            filename = status.current_job.as_deref().unwrap_or(""),
                            progress = status.progress,
                            "detected print in progress on startup"
                        );
                        if let Err(e) = autojob.ensure_job(&status, driver.kind(), true).await {
                            warn!(error = %e, "startup job creation failed");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "printer connection failed");
                    self.publish_progress(printer_id, "failed", "Connection failed");
                    return;
                }
            }
        }

        monitor.attach(&driver);
        if let Err(e) = driver.start_monitoring().await {
            error!(error = %e, "failed to start monitoring");
            self.publish_progress(printer_id, "error", &format!("Error: {e}"));
            return;
        }

        self.bus.publish(
            topics::PRINTER_MONITORING_STARTED,
            serde_json::json!({
                "printer_id": printer_id,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );
        self.publish_progress(printer_id, "monitoring", "Monitoring active");
        info!(
            total_ms = started.elapsed().as_millis() as u64,
            "connection and monitoring setup complete"
        );
    }

    /// Launch `connect_and_monitor` for every registered printer in
    /// parallel. Callers do not await the returned handles before serving
    /// traffic.
    pub fn connect_all(
        &self,
        monitor: &Arc<Monitor>,
        autojob: &Arc<AutoJobEngine>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let ids = self.printer_ids();
        info!(count = ids.len(), "connecting all printers");
        let Some(manager) = self.weak.upgrade() else {
            return Vec::new();
        };
        ids.into_iter()
            .map(|printer_id| {
                let manager = Arc::clone(&manager);
                let monitor = Arc::clone(monitor);
                let autojob = Arc::clone(autojob);
                tokio::spawn(async move {
                    manager
                        .connect_and_monitor(&printer_id, &monitor, &autojob)
                        .await;
                })
            })
            .collect()
    }

    /// Probe a candidate configuration with a throwaway driver. Never
    /// touches the registry.
    pub async fn test_connection(&self, config: &PrinterConfig) -> ConnectionTestResult {
        let driver = match (self.driver_factory)(config, &self.driver_settings) {
            Ok(driver) => driver,
            Err(e) => {
                return ConnectionTestResult {
                    success: false,
                    message: e.to_string(),
                    response_time_ms: None,
                }
            }
        };

        let started = Instant::now();
        let result = driver.connect().await;
        let elapsed = started.elapsed().as_millis() as u64;
        let _ = driver.disconnect().await;

        match result {
            Ok(()) => ConnectionTestResult {
                success: true,
                message: "Connection successful".into(),
                response_time_ms: Some(elapsed),
            },
            Err(e) => ConnectionTestResult {
                success: false,
                message: e.to_string(),
                response_time_ms: None,
            },
        }
    }

    /// Aggregate connection health across the fleet.
    pub async fn health_check(&self) -> HealthReport {
        let drivers: Vec<(String, Arc<dyn PrinterDriver>)> = {
            let registry = self.drivers.read().expect("registry lock poisoned");
            registry
                .iter()
                .map(|(id, driver)| (id.clone(), Arc::clone(driver)))
                .collect()
        };

        let mut report = HealthReport {
            total_printers: drivers.len(),
            connected_printers: 0,
            healthy_printers: 0,
            printers: HashMap::new(),
        };

        for (printer_id, driver) in drivers {
            let connected = driver.is_connected();
            let status: Option<StatusUpdate> = if connected {
                Some(driver.get_status().await)
            } else {
                None
            };
            let healthy = connected
                && status
                    .as_ref()
                    .is_some_and(|s| s.state != PrinterState::Error);

            if connected {
                report.connected_printers += 1;
            }
            if healthy {
                report.healthy_printers += 1;
            }

            let (name, ip_address) = {
                let configs = self.configs.read().expect("config lock poisoned");
                configs
                    .get(&printer_id)
                    .map(|c| (c.name.clone(), c.ip_address.clone()))
                    .unwrap_or_default()
            };

            report.printers.insert(
                printer_id,
                PrinterHealth {
                    connected,
                    healthy,
                    name,
                    ip_address,
                    last_seen: status.map(|s| s.timestamp.to_rfc3339()),
                },
            );
        }

        report
    }

    /// Remove a printer. Refused while active jobs exist unless forced;
    /// existing job rows are never touched.
    pub async fn delete_printer(&self, printer_id: &str, force: bool) -> Result<()> {
        let active = {
            let store = self.store.lock().expect("store lock poisoned");
            store.count_active_jobs(printer_id)?
        };
        if active > 0 && !force {
            return Err(PrinternizerError::ActiveJobsPresent {
                printer_id: printer_id.to_string(),
                count: active,
            });
        }

        if let Some(driver) = self.driver(printer_id) {
            driver.stop_monitoring().await;
            if let Err(e) = driver.disconnect().await {
                warn!(error = %e, "disconnect during delete failed");
            }
        }
        self.drivers
            .write()
            .expect("registry lock poisoned")
            .remove(printer_id);
        self.configs
            .write()
            .expect("config lock poisoned")
            .remove(printer_id);
        {
            let store = self.store.lock().expect("store lock poisoned");
            store.delete_printer(printer_id)?;
        }

        self.bus.publish(
            topics::PRINTER_DISCONNECTED,
            serde_json::json!({
                "printer_id": printer_id,
                "deleted": true,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );
        info!(printer_id, force, "printer deleted");
        Ok(())
    }

    /// Disconnect every driver. Errors are logged, never re-raised.
    pub async fn shutdown(&self) {
        info!("shutting down printer connections");
        let drivers: Vec<(String, Arc<dyn PrinterDriver>)> = {
            let registry = self.drivers.read().expect("registry lock poisoned");
            registry
                .iter()
                .map(|(id, driver)| (id.clone(), Arc::clone(driver)))
                .collect()
        };
        for (printer_id, driver) in drivers {
            driver.stop_monitoring().await;
            if let Err(e) = driver.disconnect().await {
                error!(printer_id, error = %e, "error disconnecting printer");
            }
        }
        self.drivers
            .write()
            .expect("registry lock poisoned")
            .clear();
        info!("connection manager shutdown complete");
    }

    fn publish_progress(&self, printer_id: &str, status: &str, message: &str) {
        self.bus.publish(
            topics::PRINTER_CONNECTION_PROGRESS,
            serde_json::json!({
                "printer_id": printer_id,
                "status": status,
                "message": message,
            }),
        );
    }
}
