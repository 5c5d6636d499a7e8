// SPDX-License-Identifier: AGPL-3.0-or-later
//
// The file pipeline: discovery from printers, downloads with progress and
// path validation, thumbnail extraction/generation, enhanced metadata, and
// uploads. Stages hand off to each other over the event bus.

pub mod discovery;
pub mod download;
pub mod metadata;
pub mod preview;
pub mod thumbnails;
pub mod upload;

pub use discovery::{FileDiscoveryService, SyncResult};
pub use download::{DownloadManager, DownloadOutcome};
pub use metadata::{EnhancedMetadata, MetadataExtractor};
pub use preview::PreviewRenderer;
pub use thumbnails::{ProcessingLogEntry, ProcessingStatus, ThumbnailService};
pub use upload::{UploadBatchResult, UploadFile, UploadResult, UploadService};
