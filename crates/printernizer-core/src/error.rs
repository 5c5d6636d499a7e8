// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Unified error types for Printernizer.

use thiserror::Error;

/// Top-level error type for all fleet-core operations.
#[derive(Debug, Error)]
pub enum PrinternizerError {
    // -- Configuration --
    #[error("invalid printer configuration: {0}")]
    ConfigurationInvalid(String),

    // -- Printer lifecycle --
    #[error("printer not found: {0}")]
    PrinterNotFound(String),

    #[error("connection to printer {printer_id} failed: {reason}")]
    ConnectionFailed { printer_id: String, reason: String },

    #[error("printer {printer_id} rejected command: {reason}")]
    CommandFailed { printer_id: String, reason: String },

    // -- Files --
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file download failed: {0}")]
    DownloadFailed(String),

    #[error("file processing failed: {0}")]
    ProcessingFailed(String),

    #[error("path escapes downloads root: {0}")]
    PathTraversal(String),

    #[error("duplicate file: {0}")]
    DuplicateFile(String),

    // -- Jobs --
    #[error("printer {printer_id} has {count} active job(s)")]
    ActiveJobsPresent { printer_id: String, count: usize },

    // -- Storage / persistence --
    #[error("database error: {0}")]
    Database(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PrinternizerError>;
