// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Fleet configuration: process settings from the environment, plus the
// printer registry loaded from a JSON file layered under per-printer
// environment variables (environment wins).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PrinternizerError, Result};
use crate::types::PrinterKind;

/// Replacement token for secrets in any serialization that can leave the
/// process (logs, events).
pub const SECRET_MASK: &str = "***";

/// Process-level settings, read once from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Driver polling cadence in seconds.
    pub monitoring_interval_secs: u64,
    /// Connect timeout for outbound printer connections, seconds.
    pub connection_timeout_secs: u64,
    /// Root directory for downloaded printer files.
    pub downloads_path: String,
    /// SQLite database location.
    pub database_path: String,
    /// Printer registry JSON file location.
    pub printer_config_path: String,
    pub discovery_enabled: bool,
    pub discovery_timeout_secs: u64,
    pub discovery_run_on_startup: bool,
    pub discovery_startup_delay_secs: u64,
    /// Auto-create job records when a print is observed.
    pub job_creation_auto_create: bool,
    pub upload_enabled: bool,
    pub max_upload_size_mb: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            monitoring_interval_secs: 30,
            connection_timeout_secs: 10,
            downloads_path: "./data/downloads".into(),
            database_path: "./data/printernizer.db".into(),
            printer_config_path: "./data/printers.json".into(),
            discovery_enabled: true,
            discovery_timeout_secs: 30,
            discovery_run_on_startup: true,
            discovery_startup_delay_secs: 10,
            job_creation_auto_create: true,
            upload_enabled: true,
            max_upload_size_mb: 100,
        }
    }
}

impl Settings {
    /// Read settings from the environment, falling back to defaults for
    /// anything unset or unparseable (unparseable values are logged).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            monitoring_interval_secs: env_u64("MONITORING_INTERVAL", defaults.monitoring_interval_secs),
            connection_timeout_secs: env_u64("CONNECTION_TIMEOUT", defaults.connection_timeout_secs),
            downloads_path: env_string("DOWNLOADS_PATH", &defaults.downloads_path),
            database_path: env_string("DATABASE_PATH", &defaults.database_path),
            printer_config_path: env_string("PRINTER_CONFIG_PATH", &defaults.printer_config_path),
            discovery_enabled: env_bool("DISCOVERY_ENABLED", defaults.discovery_enabled),
            discovery_timeout_secs: env_u64("DISCOVERY_TIMEOUT_SECONDS", defaults.discovery_timeout_secs),
            discovery_run_on_startup: env_bool("DISCOVERY_RUN_ON_STARTUP", defaults.discovery_run_on_startup),
            discovery_startup_delay_secs: env_u64(
                "DISCOVERY_STARTUP_DELAY_SECONDS",
                defaults.discovery_startup_delay_secs,
            ),
            job_creation_auto_create: env_bool("JOB_CREATION_AUTO_CREATE", defaults.job_creation_auto_create),
            upload_enabled: env_bool("UPLOAD_ENABLED", defaults.upload_enabled),
            max_upload_size_mb: env_u64("MAX_UPLOAD_SIZE_MB", defaults.max_upload_size_mb),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparseable numeric setting, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => parse_bool(&raw),
        Err(_) => default,
    }
}

/// Boolean grammar accepted in the environment: `true|1|yes|on`.
pub fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Configuration for a single printer, validated against its vendor kind.
#[derive(Debug, Clone, Deserialize)]
pub struct PrinterConfig {
    #[serde(skip, default)]
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PrinterKind,
    pub ip_address: String,
    /// Prusa credential.
    pub api_key: Option<String>,
    /// Bambu credentials.
    pub access_code: Option<String>,
    pub serial_number: Option<String>,
    pub webcam_url: Option<String>,
    pub location: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl PrinterConfig {
    /// Enforce the per-kind required credential set.
    pub fn validate(&self) -> Result<()> {
        if self.ip_address.trim().is_empty() {
            return Err(PrinternizerError::ConfigurationInvalid(format!(
                "printer {} requires ip_address",
                self.id
            )));
        }
        match self.kind {
            PrinterKind::BambuLab => {
                if self.access_code.as_deref().unwrap_or("").is_empty() {
                    return Err(PrinternizerError::ConfigurationInvalid(format!(
                        "Bambu Lab printer {} requires ip_address and access_code",
                        self.id
                    )));
                }
            }
            PrinterKind::PrusaCore => {
                if self.api_key.as_deref().unwrap_or("").is_empty() {
                    return Err(PrinternizerError::ConfigurationInvalid(format!(
                        "Prusa Core printer {} requires ip_address and api_key",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serialization safe for logs and event payloads: credential fields are
    /// replaced with a fixed mask token. This is the only way a config leaves
    /// the process — `Serialize` is deliberately not derived.
    pub fn safe_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "type": self.kind.as_str(),
            "ip_address": self.ip_address,
            "api_key": self.api_key.as_ref().map(|_| SECRET_MASK),
            "access_code": self.access_code.as_ref().map(|_| SECRET_MASK),
            "serial_number": self.serial_number,
            "webcam_url": self.webcam_url,
            "location": self.location,
            "is_active": self.is_active,
        })
    }
}

/// On-disk shape of the printer registry file.
#[derive(Debug, Default, Deserialize)]
struct PrintersFile {
    #[serde(default)]
    #[allow(dead_code)]
    version: Option<u32>,
    #[serde(default)]
    #[allow(dead_code)]
    updated_at: Option<String>,
    #[serde(default)]
    printers: HashMap<String, PrinterConfig>,
}

/// Load printer configurations: JSON file first, then
/// `PRINTERNIZER_PRINTER_<ID>_<FIELD>` environment variables layered on top
/// (environment wins). Every resulting config is validated; any failure is
/// fatal to the load.
pub fn load_printer_configs(path: &Path) -> Result<HashMap<String, PrinterConfig>> {
    load_printer_configs_with_env(path, std::env::vars())
}

/// Testable variant taking the environment as an iterator.
pub fn load_printer_configs_with_env(
    path: &Path,
    env: impl Iterator<Item = (String, String)>,
) -> Result<HashMap<String, PrinterConfig>> {
    let mut printers = HashMap::new();

    if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        let file: PrintersFile = serde_json::from_str(&raw)?;
        for (id, mut config) in file.printers {
            config.id = id.clone();
            printers.insert(id, config);
        }
        info!(path = %path.display(), count = printers.len(), "loaded printer registry file");
    } else {
        info!(path = %path.display(), "no printer registry file, using environment only");
    }

    apply_env_overrides(&mut printers, env)?;

    for config in printers.values() {
        config.validate()?;
    }

    Ok(printers)
}

/// Raw field assignments collected from the environment before they are
/// merged into full configs.
#[derive(Default)]
struct EnvPrinter {
    name: Option<String>,
    kind: Option<String>,
    ip_address: Option<String>,
    api_key: Option<String>,
    access_code: Option<String>,
    serial_number: Option<String>,
    is_active: Option<bool>,
}

fn apply_env_overrides(
    printers: &mut HashMap<String, PrinterConfig>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<()> {
    const PREFIX: &str = "PRINTERNIZER_PRINTER_";
    // Fields are matched by suffix because printer ids themselves may contain
    // underscores (PRINTERNIZER_PRINTER_BAMBU_A1_01_IP_ADDRESS).
    const FIELDS: &[&str] = &[
        "_IP_ADDRESS",
        "_API_KEY",
        "_ACCESS_CODE",
        "_SERIAL_NUMBER",
        "_ACTIVE",
        "_NAME",
        "_TYPE",
    ];

    let mut overrides: HashMap<String, EnvPrinter> = HashMap::new();

    for (key, value) in env {
        let Some(rest) = key.strip_prefix(PREFIX) else {
            continue;
        };
        let Some(field) = FIELDS.iter().find(|f| rest.ends_with(**f)) else {
            warn!(key = %key, "unrecognized printer environment variable");
            continue;
        };
        let id = rest[..rest.len() - field.len()].to_ascii_lowercase();
        if id.is_empty() {
            continue;
        }
        let entry = overrides.entry(id).or_default();
        match *field {
            "_IP_ADDRESS" => entry.ip_address = Some(value),
            "_API_KEY" => entry.api_key = Some(value),
            "_ACCESS_CODE" => entry.access_code = Some(value),
            "_SERIAL_NUMBER" => entry.serial_number = Some(value),
            "_ACTIVE" => entry.is_active = Some(parse_bool(&value)),
            "_NAME" => entry.name = Some(value),
            "_TYPE" => entry.kind = Some(value),
            _ => unreachable!(),
        }
    }

    for (id, fields) in overrides {
        match printers.get_mut(&id) {
            Some(existing) => {
                if let Some(v) = fields.name {
                    existing.name = v;
                }
                if let Some(v) = fields.ip_address {
                    existing.ip_address = v;
                }
                if let Some(v) = fields.api_key {
                    existing.api_key = Some(v);
                }
                if let Some(v) = fields.access_code {
                    existing.access_code = Some(v);
                }
                if let Some(v) = fields.serial_number {
                    existing.serial_number = Some(v);
                }
                if let Some(v) = fields.is_active {
                    existing.is_active = v;
                }
                if let Some(v) = fields.kind {
                    existing.kind = PrinterKind::from_str(&v).ok_or_else(|| {
                        PrinternizerError::ConfigurationInvalid(format!(
                            "printer {id}: unknown type {v}"
                        ))
                    })?;
                }
            }
            None => {
                let kind_str = fields.kind.clone().unwrap_or_default();
                let kind = PrinterKind::from_str(&kind_str).ok_or_else(|| {
                    PrinternizerError::ConfigurationInvalid(format!(
                        "printer {id} from environment requires a known type, got {kind_str:?}"
                    ))
                })?;
                printers.insert(
                    id.clone(),
                    PrinterConfig {
                        id: id.clone(),
                        name: fields.name.unwrap_or_else(|| id.clone()),
                        kind,
                        ip_address: fields.ip_address.unwrap_or_default(),
                        api_key: fields.api_key,
                        access_code: fields.access_code,
                        serial_number: fields.serial_number,
                        webcam_url: None,
                        location: None,
                        is_active: fields.is_active.unwrap_or(true),
                    },
                );
                info!(printer_id = %id, "loaded printer from environment");
            }
        }
    }

    Ok(())
}
