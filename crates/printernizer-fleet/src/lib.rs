// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Fleet coordination: the connection manager owns drivers, the monitor owns
// live status, the auto-job engine turns observed prints into job records.
// Everything communicates over the shared event bus.

pub mod autojob;
pub mod connection;
pub mod monitor;

pub use autojob::AutoJobEngine;
pub use connection::{
    ConnectionManager, ConnectionTestResult, DriverFactory, HealthReport, PrinterHealth,
};
pub use monitor::Monitor;
