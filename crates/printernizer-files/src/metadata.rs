// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Enhanced metadata extraction. Reads slicer output (G-code header comments,
// 3MF config streams) and produces six optional groups: physical properties,
// print settings, material requirements, cost breakdown, quality metrics,
// and compatibility info. Unknown scalars stay None, never zero.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use printernizer_core::bus::{topics, EventBus};
use printernizer_core::error::{PrinternizerError, Result};
use printernizer_core::types::FileKind;
use printernizer_store::{EnhancedMetadataColumns, SharedStore};

/// Assumed filament price when the slicer did not write a cost estimate.
const MATERIAL_COST_PER_GRAM_EUR: f64 = 0.025;
/// Printer draw assumed for energy estimates, kW.
const PRINTER_POWER_KW: f64 = 0.35;
const ENERGY_COST_PER_KWH_EUR: f64 = 0.30;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhysicalProperties {
    pub width_mm: Option<f64>,
    pub depth_mm: Option<f64>,
    pub height_mm: Option<f64>,
    pub volume_cm3: Option<f64>,
    pub surface_area_cm2: Option<f64>,
    pub object_count: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrintSettings {
    pub layer_height_mm: Option<f64>,
    pub first_layer_height_mm: Option<f64>,
    pub nozzle_diameter_mm: Option<f64>,
    pub wall_count: Option<u32>,
    pub infill_percent: Option<f64>,
    pub supports_used: Option<bool>,
    pub nozzle_temperature: Option<f64>,
    pub bed_temperature: Option<f64>,
    pub print_speed_mm_s: Option<f64>,
    pub total_layer_count: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaterialRequirements {
    pub filament_weight_grams: Option<f64>,
    pub filament_length_meters: Option<f64>,
    pub material_types: Vec<String>,
    pub multi_material: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub material_cost_eur: Option<f64>,
    pub energy_cost_eur: Option<f64>,
    pub total_cost_eur: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// 1-10, derived from layer count and material mix.
    pub complexity_score: Option<u8>,
    pub difficulty_level: Option<String>,
    pub success_probability_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompatibilityInfo {
    pub compatible_printers: Vec<String>,
    pub slicer_name: Option<String>,
    pub slicer_version: Option<String>,
    pub bed_type: Option<String>,
}

/// The full extraction result. Every group is optional — a group is present
/// only when at least one of its fields could be derived.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnhancedMetadata {
    pub physical_properties: Option<PhysicalProperties>,
    pub print_settings: Option<PrintSettings>,
    pub material_requirements: Option<MaterialRequirements>,
    pub cost_breakdown: Option<CostBreakdown>,
    pub quality_metrics: Option<QualityMetrics>,
    pub compatibility_info: Option<CompatibilityInfo>,
    /// Estimated print duration, when the slicer wrote one.
    pub estimated_print_time_minutes: Option<u32>,
}

impl EnhancedMetadata {
    pub fn to_columns(&self) -> Result<EnhancedMetadataColumns> {
        fn encode<T: Serialize>(value: &Option<T>) -> Result<Option<serde_json::Value>> {
            value
                .as_ref()
                .map(|v| serde_json::to_value(v).map_err(PrinternizerError::from))
                .transpose()
        }
        Ok(EnhancedMetadataColumns {
            physical_properties: encode(&self.physical_properties)?,
            print_settings: encode(&self.print_settings)?,
            material_requirements: encode(&self.material_requirements)?,
            cost_breakdown: encode(&self.cost_breakdown)?,
            quality_metrics: encode(&self.quality_metrics)?,
            compatibility_info: encode(&self.compatibility_info)?,
        })
    }
}

#[derive(Debug, Default)]
pub struct MetadataExtractor;

impl MetadataExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract enhanced metadata from a 3MF or G-code file on disk.
    #[instrument(skip(self), fields(path = %path.as_ref().display()))]
    pub fn extract(&self, path: impl AsRef<Path>, kind: FileKind) -> Result<EnhancedMetadata> {
        let path = path.as_ref();
        match kind {
            FileKind::Gcode => {
                let text = std::fs::read_to_string(path)?;
                Ok(from_key_values(&parse_gcode_header_comments(&text)))
            }
            FileKind::ThreeMf => {
                let values = read_3mf_key_values(path)?;
                Ok(from_key_values(&values))
            }
            other => Err(PrinternizerError::ProcessingFailed(format!(
                "no metadata extractor for {} files",
                other.as_str()
            ))),
        }
    }

    /// Extract, persist to the file row's enhanced columns, and publish
    /// `file_metadata_extracted`.
    pub fn extract_and_store(
        &self,
        store: &SharedStore,
        bus: &EventBus,
        file_id: &str,
        path: impl AsRef<Path>,
        kind: FileKind,
    ) -> Result<EnhancedMetadata> {
        let metadata = self.extract(path, kind)?;
        let columns = metadata.to_columns()?;
        store
            .lock()
            .expect("store lock poisoned")
            .set_enhanced_metadata(file_id, &columns)?;

        bus.publish(
            topics::FILE_METADATA_EXTRACTED,
            serde_json::json!({
                "file_id": file_id,
                "has_physical_properties": metadata.physical_properties.is_some(),
                "has_print_settings": metadata.print_settings.is_some(),
                "estimated_print_time_minutes": metadata.estimated_print_time_minutes,
            }),
        );
        info!(file_id, "enhanced metadata extracted");
        Ok(metadata)
    }
}

// ---------------------------------------------------------------------------
// Slicer output parsing
// ---------------------------------------------------------------------------

/// Collect `; key = value` / `; key: value` header comments. Both
/// PrusaSlicer (settings at the tail) and Bambu Studio (header block) write
/// this shape; first occurrence of a key wins.
pub(crate) fn parse_gcode_header_comments(text: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for line in text.lines() {
        let Some(comment) = line.trim().strip_prefix(';') else {
            continue;
        };
        let comment = comment.trim();
        // PrusaSlicer's banner line has no separator: "generated by X Y on…".
        if let Some(rest) = comment.strip_prefix("generated by ") {
            values
                .entry("generated_by".to_string())
                .or_insert_with(|| rest.trim().to_string());
            continue;
        }
        let Some((key, value)) = comment.split_once('=').or_else(|| comment.split_once(':'))
        else {
            continue;
        };
        let key = key.trim().to_lowercase().replace(' ', "_");
        let value = value.trim().to_string();
        // Base64 thumbnail lines end in '=' padding and would otherwise
        // parse as a key with an "=" value.
        if !key.is_empty() && !value.is_empty() && !value.starts_with('=') {
            values.entry(key).or_insert(value);
        }
    }
    values
}

/// Collect `key="..." value="..."` attribute pairs from a 3MF config stream
/// (`Metadata/slice_info.config` and friends).
pub(crate) fn parse_config_attributes(text: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    let mut rest = text;
    while let Some(key_start) = rest.find("key=\"") {
        rest = &rest[key_start + 5..];
        let Some(key_end) = rest.find('"') else { break };
        let key = rest[..key_end].to_lowercase().replace(' ', "_");
        rest = &rest[key_end + 1..];
        let Some(value_start) = rest.find("value=\"") else {
            continue;
        };
        rest = &rest[value_start + 7..];
        let Some(value_end) = rest.find('"') else { break };
        let value = rest[..value_end].to_string();
        rest = &rest[value_end + 1..];
        values.entry(key).or_insert(value);
    }
    values
}

fn read_3mf_key_values(path: &Path) -> Result<BTreeMap<String, String>> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| PrinternizerError::ProcessingFailed(format!("3MF open: {e}")))?;

    let mut values = BTreeMap::new();
    let names: Vec<String> = archive.file_names().map(String::from).collect();

    for name in &names {
        let lower = name.to_lowercase();
        let is_config = lower.ends_with(".config");
        let is_gcode = lower.ends_with(".gcode");
        if !is_config && !is_gcode {
            continue;
        }
        let mut entry = archive
            .by_name(name)
            .map_err(|e| PrinternizerError::ProcessingFailed(format!("3MF entry {name}: {e}")))?;
        let mut text = String::new();
        if entry.read_to_string(&mut text).is_err() {
            continue;
        }
        let parsed = if is_config {
            parse_config_attributes(&text)
        } else {
            parse_gcode_header_comments(&text)
        };
        for (key, value) in parsed {
            values.entry(key).or_insert(value);
        }
    }

    debug!(keys = values.len(), "collected 3MF config values");
    Ok(values)
}

fn get_f64(values: &BTreeMap<String, String>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| {
        values
            .get(*key)
            .and_then(|raw| raw.trim_end_matches(['%', 'm', 'g', 's']).trim().parse().ok())
    })
}

fn get_u32(values: &BTreeMap<String, String>, keys: &[&str]) -> Option<u32> {
    get_f64(values, keys).map(|v| v.round() as u32)
}

fn get_bool(values: &BTreeMap<String, String>, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|key| {
        values
            .get(*key)
            .map(|raw| matches!(raw.trim(), "1" | "true" | "True" | "yes"))
    })
}

/// Parse "2h 32m 15s" / "1d 2h 3m" style duration estimates to minutes.
pub(crate) fn parse_duration_minutes(raw: &str) -> Option<u32> {
    let mut minutes = 0f64;
    let mut matched = false;
    for token in raw.split_whitespace() {
        let (number, unit) = token.split_at(token.len().saturating_sub(1));
        let Ok(value) = number.parse::<f64>() else {
            continue;
        };
        matched = true;
        minutes += match unit {
            "d" => value * 24.0 * 60.0,
            "h" => value * 60.0,
            "m" => value,
            "s" => value / 60.0,
            _ => {
                matched = false;
                0.0
            }
        };
    }
    matched.then_some(minutes.round() as u32)
}

/// Build the metadata groups from a flat key/value map. Group presence
/// follows field presence: a group with nothing derivable is None.
fn from_key_values(values: &BTreeMap<String, String>) -> EnhancedMetadata {
    let mut metadata = EnhancedMetadata::default();

    let settings = PrintSettings {
        layer_height_mm: get_f64(values, &["layer_height"]),
        first_layer_height_mm: get_f64(values, &["first_layer_height", "initial_layer_height"]),
        nozzle_diameter_mm: get_f64(values, &["nozzle_diameter"]),
        wall_count: get_u32(values, &["wall_loops", "perimeters"]),
        infill_percent: get_f64(values, &["sparse_infill_density", "fill_density"]),
        supports_used: get_bool(values, &["support_used", "enable_support", "support_material"]),
        nozzle_temperature: get_f64(values, &["nozzle_temperature", "temperature"]),
        bed_temperature: get_f64(
            values,
            &["bed_temperature", "hot_plate_temp", "bed_temperature_initial_layer"],
        ),
        print_speed_mm_s: get_f64(values, &["outer_wall_speed", "perimeter_speed"]),
        total_layer_count: get_u32(values, &["total_layer_number", "total_layer_count", "layer_count"]),
    };
    if settings.layer_height_mm.is_some()
        || settings.total_layer_count.is_some()
        || settings.nozzle_temperature.is_some()
    {
        metadata.print_settings = Some(settings);
    }

    let weight = get_f64(
        values,
        &["total_filament_weight", "filament_used_g", "filament_used_[g]", "weight"],
    );
    let length_m = get_f64(values, &["filament_used_m", "filament_used_[m]"]).or_else(|| {
        // Bambu writes millimetres.
        get_f64(values, &["total_filament_length", "filament_used_mm"]).map(|mm| mm / 1000.0)
    });
    let material_types: Vec<String> = values
        .get("filament_type")
        .map(|raw| {
            raw.split(';')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if weight.is_some() || length_m.is_some() || !material_types.is_empty() {
        metadata.material_requirements = Some(MaterialRequirements {
            filament_weight_grams: weight,
            filament_length_meters: length_m,
            multi_material: Some(material_types.len() > 1),
            material_types,
        });
    }

    let physical = PhysicalProperties {
        width_mm: get_f64(values, &["max_x", "model_width"]),
        depth_mm: get_f64(values, &["max_y", "model_depth"]),
        height_mm: get_f64(values, &["max_z", "model_height", "object_height"]),
        // PLA ≈ 1.24 g/cm³; a weight-derived volume beats none at all.
        volume_cm3: weight.map(|g| g / 1.24),
        surface_area_cm2: None,
        object_count: get_u32(values, &["object_count", "total_object_count"]),
    };
    if physical.height_mm.is_some() || physical.volume_cm3.is_some() {
        metadata.physical_properties = Some(physical);
    }

    metadata.estimated_print_time_minutes = values
        .get("estimated_printing_time_(normal_mode)")
        .or_else(|| values.get("model_printing_time"))
        .or_else(|| values.get("estimated_printing_time"))
        .and_then(|raw| parse_duration_minutes(raw).or_else(|| raw.parse::<u32>().ok().map(|s| s / 60)));

    if weight.is_some() || metadata.estimated_print_time_minutes.is_some() {
        let material_cost = weight.map(|g| g * MATERIAL_COST_PER_GRAM_EUR);
        let energy_cost = metadata
            .estimated_print_time_minutes
            .map(|m| (m as f64 / 60.0) * PRINTER_POWER_KW * ENERGY_COST_PER_KWH_EUR);
        let total = match (material_cost, energy_cost) {
            (Some(m), Some(e)) => Some(m + e),
            (Some(m), None) => Some(m),
            (None, Some(e)) => Some(e),
            (None, None) => None,
        };
        metadata.cost_breakdown = Some(CostBreakdown {
            material_cost_eur: material_cost.map(round_cents),
            energy_cost_eur: energy_cost.map(round_cents),
            total_cost_eur: total.map(round_cents),
        });
    }

    if let Some(settings) = &metadata.print_settings {
        let layers = settings.total_layer_count.unwrap_or(0);
        let multi = metadata
            .material_requirements
            .as_ref()
            .and_then(|m| m.multi_material)
            .unwrap_or(false);
        let mut score = match layers {
            0..=100 => 2u8,
            101..=300 => 4,
            301..=600 => 6,
            _ => 8,
        };
        if multi {
            score = score.saturating_add(2);
        }
        let score = score.min(10);
        metadata.quality_metrics = Some(QualityMetrics {
            complexity_score: Some(score),
            difficulty_level: Some(
                match score {
                    0..=3 => "beginner",
                    4..=6 => "intermediate",
                    7..=8 => "advanced",
                    _ => "expert",
                }
                .to_string(),
            ),
            success_probability_percent: Some((100.0 - f64::from(score) * 4.0).max(50.0)),
        });
    }

    let slicer = values
        .get("generated_by")
        .or_else(|| values.get("generator"))
        .cloned();
    let printer_model = values
        .get("printer_model")
        .or_else(|| values.get("printer_settings_id"))
        .cloned();
    if slicer.is_some() || printer_model.is_some() {
        let (name, version) = match &slicer {
            Some(raw) => {
                let mut parts = raw.split_whitespace();
                (
                    parts.next().map(|s| s.to_string()),
                    parts.next().map(|s| s.to_string()),
                )
            }
            None => (None, None),
        };
        metadata.compatibility_info = Some(CompatibilityInfo {
            compatible_printers: printer_model.into_iter().collect(),
            slicer_name: name,
            slicer_version: version,
            bed_type: values.get("curr_bed_type").cloned(),
        });
    }

    metadata
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRUSA_GCODE: &str = "\
; generated by PrusaSlicer 2.7.0 on 2024-01-01
G28
; filament used [g] = 21.5
; filament used [m] = 7.2
; filament_type = PLA
; estimated printing time (normal mode) = 2h 30m 15s
; layer_height = 0.2
; first_layer_height = 0.25
; nozzle_diameter = 0.4
; perimeters = 3
; fill_density = 15%
; temperature = 215
; bed_temperature = 60
; printer_model = MK4
";

    #[test]
    fn header_comments_parse_both_separators() {
        let values = parse_gcode_header_comments("; a = 1\n; b: two\nG1 X0\n; = skipped\n");
        assert_eq!(values.get("a").map(String::as_str), Some("1"));
        assert_eq!(values.get("b").map(String::as_str), Some("two"));
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration_minutes("2h 30m 15s"), Some(150));
        assert_eq!(parse_duration_minutes("45m"), Some(45));
        assert_eq!(parse_duration_minutes("1d 1h"), Some(25 * 60));
        assert_eq!(parse_duration_minutes("soon"), None);
    }

    #[test]
    fn prusa_gcode_extraction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("part.gcode");
        std::fs::write(&path, PRUSA_GCODE).expect("write");

        let metadata = MetadataExtractor::new()
            .extract(&path, FileKind::Gcode)
            .expect("extract");

        let settings = metadata.print_settings.expect("settings");
        assert_eq!(settings.layer_height_mm, Some(0.2));
        assert_eq!(settings.wall_count, Some(3));
        assert_eq!(settings.infill_percent, Some(15.0));
        assert_eq!(settings.nozzle_temperature, Some(215.0));

        let material = metadata.material_requirements.expect("material");
        assert_eq!(material.filament_weight_grams, Some(21.5));
        assert_eq!(material.filament_length_meters, Some(7.2));
        assert_eq!(material.material_types, vec!["PLA"]);
        assert_eq!(material.multi_material, Some(false));

        assert_eq!(metadata.estimated_print_time_minutes, Some(150));

        let cost = metadata.cost_breakdown.expect("cost");
        assert_eq!(cost.material_cost_eur, Some(0.54));
        assert!(cost.total_cost_eur.expect("total") > 0.54);

        let compat = metadata.compatibility_info.expect("compat");
        assert_eq!(compat.slicer_name.as_deref(), Some("PrusaSlicer"));
        assert_eq!(compat.compatible_printers, vec!["MK4"]);
    }

    #[tokio::test]
    async fn extract_and_store_writes_columns_and_publishes() {
        use printernizer_core::types::PrinterFileRecord;
        use printernizer_store::Store;

        let store = Store::open_in_memory().expect("store").into_shared();
        let bus = EventBus::new();
        let mut events = bus.subscribe(topics::FILE_METADATA_EXTRACTED);

        let record = PrinterFileRecord::new_printer_file("p1", "part.gcode");
        store.lock().expect("store").upsert_file(&record).expect("seed");

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("part.gcode");
        std::fs::write(&path, PRUSA_GCODE).expect("write");

        MetadataExtractor::new()
            .extract_and_store(&store, &bus, &record.id, &path, FileKind::Gcode)
            .expect("extract and store");

        let columns = store
            .lock()
            .expect("store")
            .get_enhanced_metadata(&record.id)
            .expect("read back");
        assert!(columns.print_settings.is_some());
        assert!(columns.material_requirements.is_some());
        let settings = columns.print_settings.expect("settings");
        assert_eq!(settings["layer_height_mm"], serde_json::json!(0.2));

        let event = events.recv().await.expect("event");
        assert_eq!(event.payload["has_print_settings"], true);
    }

    #[test]
    fn unknown_fields_stay_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bare.gcode");
        std::fs::write(&path, "G28\nG1 X10\n").expect("write");

        let metadata = MetadataExtractor::new()
            .extract(&path, FileKind::Gcode)
            .expect("extract");
        assert!(metadata.print_settings.is_none());
        assert!(metadata.material_requirements.is_none());
        assert!(metadata.cost_breakdown.is_none());
        assert!(metadata.estimated_print_time_minutes.is_none());
    }

    #[test]
    fn config_attribute_scanning() {
        let xml = r#"<config><metadata key="layer_height" value="0.16"/>
            <metadata key="total_layer_number" value="321"/></config>"#;
        let values = parse_config_attributes(xml);
        assert_eq!(values.get("layer_height").map(String::as_str), Some("0.16"));
        assert_eq!(
            values.get("total_layer_number").map(String::as_str),
            Some("321")
        );
    }

    #[test]
    fn multi_material_detection() {
        let gcode = "; filament_type = PLA;PETG\n; filament used [g] = 40\n; layer_height = 0.2\n";
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mm.gcode");
        std::fs::write(&path, gcode).expect("write");

        let metadata = MetadataExtractor::new()
            .extract(&path, FileKind::Gcode)
            .expect("extract");
        let material = metadata.material_requirements.expect("material");
        assert_eq!(material.multi_material, Some(true));
        assert_eq!(material.material_types, vec!["PLA", "PETG"]);
    }

    #[test]
    fn quality_score_scales_with_layers() {
        let make = |layers: u32| {
            let gcode = format!("; layer_height = 0.2\n; total_layer_count = {layers}\n");
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("q.gcode");
            std::fs::write(&path, gcode).expect("write");
            MetadataExtractor::new()
                .extract(&path, FileKind::Gcode)
                .expect("extract")
                .quality_metrics
                .expect("metrics")
                .complexity_score
                .expect("score")
        };
        assert!(make(50) < make(400));
        assert!(make(400) < make(900));
    }
}
