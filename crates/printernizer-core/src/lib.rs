// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Core types, errors, and configuration for the Printernizer fleet
// coordinator. Everything in this crate is protocol- and storage-agnostic.

pub mod bus;
pub mod config;
pub mod error;
pub mod types;

pub use config::{PrinterConfig, Settings};
pub use error::{PrinternizerError, Result};
