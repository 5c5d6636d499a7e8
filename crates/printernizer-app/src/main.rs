// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Printernizer — real-time fleet coordinator for networked 3D printers.
//
// Entry point. Initializes logging, loads configuration (a validation
// failure terminates the process non-zero), builds the fleet runtime, and
// runs until interrupted.

mod runtime;

use std::path::Path;

use printernizer_core::config::{load_printer_configs, Settings};

use runtime::FleetRuntime;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Printernizer starting");

    let settings = Settings::from_env();
    let printers = match load_printer_configs(Path::new(&settings.printer_config_path)) {
        Ok(printers) => printers,
        Err(e) => {
            tracing::error!(error = %e, "printer configuration invalid");
            std::process::exit(1);
        }
    };

    for config in printers.values() {
        tracing::info!(printer = %config.safe_json(), "configured printer");
    }

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    runtime.block_on(async move {
        let mut fleet = match FleetRuntime::build(settings, printers) {
            Ok(fleet) => fleet,
            Err(e) => {
                tracing::error!(error = %e, "fleet startup failed");
                std::process::exit(1);
            }
        };

        fleet.start();

        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("interrupt received"),
            Err(e) => tracing::error!(error = %e, "signal listener failed"),
        }

        fleet.shutdown().await;
    });

    tracing::info!("Printernizer stopped");
}
