// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Printer driver layer. A driver is the normalization boundary: it speaks
// one vendor protocol and exposes the uniform capability surface below.
// Everything above the driver deals only in normalized types.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use printernizer_core::config::PrinterConfig;
use printernizer_core::error::{PrinternizerError, Result};
use printernizer_core::types::{PrinterKind, RemoteFile, StatusUpdate};

pub mod bambu;
pub mod prusa;

pub use bambu::BambuDriver;
pub use prusa::PrusaDriver;

/// Requested thumbnail size for drivers that can serve them (Prusa).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailSize {
    /// `refs.icon`
    Small,
    /// `refs.thumbnail`
    Large,
}

/// Single-slot status sink. The monitor registers one sender per driver; the
/// driver pushes every status change into it. A multicast would be
/// unnecessary complication — the monitor is the only subscriber.
pub type StatusSink = mpsc::UnboundedSender<StatusUpdate>;

/// The uniform capability surface every driver implements.
#[async_trait]
pub trait PrinterDriver: Send + Sync {
    fn printer_id(&self) -> &str;

    fn kind(&self) -> PrinterKind;

    /// Establish the vendor connection. Idempotent when already connected.
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Current status snapshot. Never fails — on error it returns a status
    /// with `state = error` and a message.
    async fn get_status(&self) -> StatusUpdate;

    async fn list_files(&self) -> Result<Vec<RemoteFile>>;

    /// Fetch a file's binary content to `local_path`. Must refuse payloads
    /// that are JSON metadata rather than a binary stream.
    async fn download_file(&self, filename: &str, local_path: &Path) -> Result<()>;

    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;

    fn has_camera(&self) -> bool;

    fn camera_stream_url(&self) -> Option<String>;

    async fn take_snapshot(&self) -> Result<Option<Vec<u8>>>;

    /// Vendor-side thumbnail fetch. Only Prusa implements this; the default
    /// reports no capability.
    async fn download_thumbnail(
        &self,
        _filename: &str,
        _size: ThumbnailSize,
    ) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Register the status sink invoked on every status change.
    fn set_status_sink(&self, sink: StatusSink);

    /// Start whatever internal mechanism (polling task or event
    /// subscription) produces status callbacks.
    async fn start_monitoring(&self) -> Result<()>;

    async fn stop_monitoring(&self);
}

/// Capability provider consumed by the monitor and the file pipeline.
/// The connection manager implements it; nothing else may create or destroy
/// a driver.
pub trait DriverProvider: Send + Sync {
    fn driver(&self, printer_id: &str) -> Option<Arc<dyn PrinterDriver>>;
}

/// Tunables handed to drivers at construction.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub connect_timeout: std::time::Duration,
    pub request_timeout: std::time::Duration,
    pub poll_interval: std::time::Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            connect_timeout: std::time::Duration::from_secs(10),
            request_timeout: std::time::Duration::from_secs(60),
            poll_interval: std::time::Duration::from_secs(30),
        }
    }
}

/// Instantiate the driver matching a printer's vendor kind. The config must
/// already be validated.
pub fn create_driver(
    config: &PrinterConfig,
    settings: &DriverSettings,
) -> Result<Arc<dyn PrinterDriver>> {
    config.validate()?;
    match config.kind {
        PrinterKind::BambuLab => Ok(Arc::new(BambuDriver::new(config, settings)?)),
        PrinterKind::PrusaCore => Ok(Arc::new(PrusaDriver::new(config, settings)?)),
    }
}

/// Shared content sniff: a download endpoint that answers with JSON metadata
/// instead of a binary stream must be rejected.
pub(crate) fn looks_like_json(first_bytes: &[u8]) -> bool {
    matches!(
        first_bytes.iter().copied().find(|b| !b.is_ascii_whitespace()),
        Some(b'{') | Some(b'[')
    )
}

pub(crate) fn not_connected(printer_id: &str) -> PrinternizerError {
    PrinternizerError::ConnectionFailed {
        printer_id: printer_id.to_string(),
        reason: "not connected".into(),
    }
}

/// Removes a partially-written download unless disarmed. Covers both error
/// returns and task cancellation mid-stream.
pub(crate) struct PartialFileGuard<'a> {
    path: &'a Path,
    armed: bool,
}

impl<'a> PartialFileGuard<'a> {
    pub(crate) fn new(path: &'a Path) -> Self {
        Self { path, armed: true }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFileGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(self.path);
        }
    }
}
