//! Device configuration parsing, validation, and serialization
//!
//! A device description lists heterogeneous outputs (single pixels, linear
//! strips, sparse matrices). Validation turns it into a canonical form where
//! every output has a dense LED address space; anything inconsistent or
//! ambiguous rejects the whole load.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::info;

pub const SCHEMA_VERSION: u32 = 1;

pub const DEFAULT_DEVICE_NAME: &str = "TestMatrix";
pub const DEFAULT_UDP_PORT: u16 = 9999;
pub const DEFAULT_PIXEL_SIZE: u16 = 6;
const DEFAULT_MATRIX_WIDTH: u32 = 48;
const DEFAULT_MATRIX_HEIGHT: u32 = 27;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Config outputs must be a non-empty list")]
    NoOutputs,
    #[error("Output id cannot be empty")]
    EmptyOutputId,
    #[error("Duplicate output id: {0}")]
    DuplicateOutputId(String),
    #[error("Output '{id}' is missing output_type")]
    MissingOutputType { id: String },
    #[error("Unsupported output_type: {value:?}")]
    UnknownOutputType { value: String },
    #[error("Output '{id}' is Single but leds_count != 1")]
    SingleLedsCount { id: String },
    #[error("Output '{id}' is Linear but missing length")]
    MissingLength { id: String },
    #[error("Output '{id}' has invalid length={length}")]
    InvalidLength { id: String, length: i64 },
    #[error("Output '{id}' has conflicting length and leds_count")]
    ConflictingLength { id: String },
    #[error("Output '{id}' is Matrix but missing matrix block")]
    MissingMatrix { id: String },
    #[error("Output '{id}' has invalid matrix size {width}x{height}")]
    InvalidMatrixSize { id: String, width: i64, height: i64 },
    #[error("Output '{id}' matrix map length mismatch: expected {expected}, got {actual}")]
    MatrixMapLength {
        id: String,
        expected: usize,
        actual: usize,
    },
    #[error("Output '{id}' matrix indices must be non-negative integers or null")]
    NegativeMatrixIndex { id: String },
    #[error("Output '{id}' matrix has no LEDs")]
    EmptyMatrix { id: String },
    #[error("Output '{id}' matrix has duplicate index {index}")]
    DuplicateMatrixIndex { id: String, index: u32 },
    #[error("Output '{id}' matrix indices must cover 0..={max} without gaps (missing {missing})")]
    MatrixIndexGap { id: String, missing: u32, max: u32 },
    #[error("Output '{id}' leds_count mismatch: provided={provided}, derived={derived}")]
    LedsCountMismatch {
        id: String,
        provided: i64,
        derived: u32,
    },
}

/// Canonical output kind after validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputType {
    Single,
    Linear,
    Matrix,
}

impl OutputType {
    /// Parse an output type from its accepted spellings, case-insensitively.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "linear" | "strip" | "ledstrip" => Ok(Self::Linear),
            "matrix" | "grid" => Ok(Self::Matrix),
            _ => Err(ConfigError::UnknownOutputType {
                value: value.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "Single",
            Self::Linear => "Linear",
            Self::Matrix => "Matrix",
        }
    }
}

impl std::fmt::Display for OutputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sparse 2-D wiring of a matrix output
///
/// `map` has one entry per virtual cell, row-major; `None` marks a cell with
/// no physical LED behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixMap {
    pub width: u32,
    pub height: u32,
    pub map: Vec<Option<u32>>,
}

impl MatrixMap {
    /// Derive the LED count from the mapping and verify the non-null
    /// entries form a dense bijection onto `0..leds_count`.
    pub fn derive_leds_count(&self, output_id: &str) -> Result<u32, ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidMatrixSize {
                id: output_id.to_string(),
                width: i64::from(self.width),
                height: i64::from(self.height),
            });
        }

        let expected = self.width as usize * self.height as usize;
        if self.map.len() != expected {
            return Err(ConfigError::MatrixMapLength {
                id: output_id.to_string(),
                expected,
                actual: self.map.len(),
            });
        }

        let max_idx = self
            .map
            .iter()
            .flatten()
            .copied()
            .max()
            .ok_or_else(|| ConfigError::EmptyMatrix {
                id: output_id.to_string(),
            })?;
        let leds_count = max_idx + 1;

        let mut seen = vec![false; leds_count as usize];
        for &idx in self.map.iter().flatten() {
            if seen[idx as usize] {
                return Err(ConfigError::DuplicateMatrixIndex {
                    id: output_id.to_string(),
                    index: idx,
                });
            }
            seen[idx as usize] = true;
        }

        if let Some(missing) = seen.iter().position(|&s| !s) {
            return Err(ConfigError::MatrixIndexGap {
                id: output_id.to_string(),
                missing: missing as u32,
                max: max_idx,
            });
        }

        Ok(leds_count)
    }
}

/// One validated output of the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    /// Unique id within the config
    pub id: String,
    /// Human-readable name (falls back to the id)
    pub name: String,
    pub output_type: OutputType,
    pub leds_count: u32,
    /// Present iff `output_type` is Matrix
    pub matrix: Option<MatrixMap>,
}

/// Validated device description
///
/// Immutable once parsed. Output order is significant: it determines the
/// global LED offsets the runtime derives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub schema_version: u32,
    pub device_name: String,
    pub udp_port: u16,
    pub pixel_size: u16,
    pub outputs: Vec<OutputSpec>,
}

/// Raw wire/file form of a matrix block
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawMatrix {
    #[serde(default)]
    width: i64,
    #[serde(default)]
    height: i64,
    #[serde(default)]
    map: Vec<Option<i64>>,
}

/// Raw wire/file form of one output, before validation
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawOutput {
    #[serde(default)]
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default)]
    output_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    leds_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    matrix: Option<RawMatrix>,
}

/// Raw wire/file form of the whole config
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawDeviceConfig {
    #[serde(default = "default_schema_version")]
    schema_version: u32,
    #[serde(default = "default_device_name")]
    device_name: String,
    #[serde(default = "default_udp_port")]
    udp_port: u16,
    #[serde(default = "default_pixel_size")]
    pixel_size: u16,
    #[serde(default)]
    outputs: Vec<RawOutput>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

fn default_device_name() -> String {
    DEFAULT_DEVICE_NAME.to_string()
}

fn default_udp_port() -> u16 {
    DEFAULT_UDP_PORT
}

fn default_pixel_size() -> u16 {
    DEFAULT_PIXEL_SIZE
}

fn parse_matrix(output_id: &str, raw: &RawMatrix) -> Result<MatrixMap, ConfigError> {
    if raw.width <= 0 || raw.height <= 0 {
        return Err(ConfigError::InvalidMatrixSize {
            id: output_id.to_string(),
            width: raw.width,
            height: raw.height,
        });
    }

    let mut map = Vec::with_capacity(raw.map.len());
    for entry in &raw.map {
        match entry {
            None => map.push(None),
            Some(v) if *v >= 0 => map.push(Some(*v as u32)),
            Some(_) => {
                return Err(ConfigError::NegativeMatrixIndex {
                    id: output_id.to_string(),
                })
            }
        }
    }

    let matrix = MatrixMap {
        width: raw.width as u32,
        height: raw.height as u32,
        map,
    };
    matrix.derive_leds_count(output_id)?;
    Ok(matrix)
}

fn parse_output(raw: &RawOutput) -> Result<OutputSpec, ConfigError> {
    let id = raw.id.trim().to_string();
    if id.is_empty() {
        return Err(ConfigError::EmptyOutputId);
    }

    let name = raw
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(&id)
        .to_string();

    let type_str = raw
        .output_type
        .as_deref()
        .ok_or_else(|| ConfigError::MissingOutputType { id: id.clone() })?;
    let output_type = OutputType::parse(type_str)?;

    match output_type {
        OutputType::Single => {
            let leds_count = raw.leds_count.unwrap_or(1);
            if leds_count != 1 {
                return Err(ConfigError::SingleLedsCount { id });
            }
            Ok(OutputSpec {
                id,
                name,
                output_type,
                leds_count: 1,
                matrix: None,
            })
        }
        OutputType::Linear => {
            let length = match (raw.length, raw.leds_count) {
                (None, None) => return Err(ConfigError::MissingLength { id }),
                (Some(l), Some(c)) if l != c => {
                    return Err(ConfigError::ConflictingLength { id })
                }
                (Some(l), _) => l,
                (None, Some(c)) => c,
            };
            if length <= 0 {
                return Err(ConfigError::InvalidLength { id, length });
            }
            Ok(OutputSpec {
                id,
                name,
                output_type,
                leds_count: length as u32,
                matrix: None,
            })
        }
        OutputType::Matrix => {
            let raw_matrix = raw
                .matrix
                .as_ref()
                .ok_or_else(|| ConfigError::MissingMatrix { id: id.clone() })?;
            let matrix = parse_matrix(&id, raw_matrix)?;
            let derived = matrix.derive_leds_count(&id)?;
            if let Some(hinted) = raw.leds_count {
                if hinted != i64::from(derived) {
                    return Err(ConfigError::LedsCountMismatch {
                        id,
                        provided: hinted,
                        derived,
                    });
                }
            }
            Ok(OutputSpec {
                id,
                name,
                output_type,
                leds_count: derived,
                matrix: Some(matrix),
            })
        }
    }
}

impl OutputSpec {
    fn to_raw(&self) -> RawOutput {
        let mut raw = RawOutput {
            id: self.id.clone(),
            name: Some(self.name.clone()),
            output_type: Some(self.output_type.as_str().to_string()),
            leds_count: Some(i64::from(self.leds_count)),
            length: None,
            matrix: None,
        };
        match self.output_type {
            OutputType::Single => {}
            OutputType::Linear => {
                raw.length = Some(i64::from(self.leds_count));
            }
            OutputType::Matrix => {
                // Validation guarantees the matrix block is present.
                if let Some(m) = &self.matrix {
                    raw.matrix = Some(RawMatrix {
                        width: i64::from(m.width),
                        height: i64::from(m.height),
                        map: m.map.iter().map(|o| o.map(i64::from)).collect(),
                    });
                }
            }
        }
        raw
    }
}

impl DeviceConfig {
    /// Parse and validate a config from its JSON text
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let raw: RawDeviceConfig = serde_json::from_str(text)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawDeviceConfig) -> Result<Self, ConfigError> {
        if raw.outputs.is_empty() {
            return Err(ConfigError::NoOutputs);
        }

        let device_name = {
            let trimmed = raw.device_name.trim();
            if trimmed.is_empty() {
                DEFAULT_DEVICE_NAME.to_string()
            } else {
                trimmed.to_string()
            }
        };

        let mut outputs: Vec<OutputSpec> = Vec::with_capacity(raw.outputs.len());
        for raw_out in &raw.outputs {
            let out = parse_output(raw_out)?;
            if outputs.iter().any(|o| o.id == out.id) {
                return Err(ConfigError::DuplicateOutputId(out.id));
            }
            outputs.push(out);
        }

        Ok(Self {
            schema_version: raw.schema_version,
            device_name,
            udp_port: raw.udp_port,
            pixel_size: raw.pixel_size,
            outputs,
        })
    }

    fn to_raw(&self) -> RawDeviceConfig {
        RawDeviceConfig {
            schema_version: self.schema_version,
            device_name: self.device_name.clone(),
            udp_port: self.udp_port,
            pixel_size: self.pixel_size,
            outputs: self.outputs.iter().map(OutputSpec::to_raw).collect(),
        }
    }

    /// Serialize to compact JSON, the form sent over the wire.
    ///
    /// Symmetric with [`DeviceConfig::from_json`]: re-parsing the result
    /// yields an equal config.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.to_raw()).expect("config serialization cannot fail")
    }

    /// Serialize to pretty JSON for config files
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(&self.to_raw()).expect("config serialization cannot fail")
    }

    /// Compact JSON payload bytes for the config query reply
    pub fn config_payload(&self) -> Vec<u8> {
        self.to_json().into_bytes()
    }

    /// Total LED count across all outputs
    pub fn total_leds(&self) -> usize {
        self.outputs.iter().map(|o| o.leds_count as usize).sum()
    }

    /// Built-in config: one fully-mapped 48x27 matrix
    pub fn default_config() -> Self {
        let width = DEFAULT_MATRIX_WIDTH;
        let height = DEFAULT_MATRIX_HEIGHT;
        let matrix = MatrixMap {
            width,
            height,
            map: (0..width * height).map(Some).collect(),
        };
        Self {
            schema_version: SCHEMA_VERSION,
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            udp_port: DEFAULT_UDP_PORT,
            pixel_size: DEFAULT_PIXEL_SIZE,
            outputs: vec![OutputSpec {
                id: "matrix".to_string(),
                name: "LED Matrix".to_string(),
                output_type: OutputType::Matrix,
                leds_count: width * height,
                matrix: Some(matrix),
            }],
        }
    }
}

/// Load a device config from a JSON file, or the built-in default when no
/// path is given or the file does not exist.
pub fn load_config(path: Option<&Path>) -> Result<DeviceConfig, ConfigError> {
    match path {
        Some(path) if path.exists() => {
            let content = std::fs::read_to_string(path)?;
            let config = DeviceConfig::from_json(&content)?;
            info!(path = %path.display(), outputs = config.outputs.len(), "Loaded device config");
            Ok(config)
        }
        Some(path) => {
            info!(path = %path.display(), "Config file not found, using default config");
            Ok(DeviceConfig::default_config())
        }
        None => Ok(DeviceConfig::default_config()),
    }
}

/// Save a device config as pretty JSON
pub fn save_config(path: &Path, config: &DeviceConfig) -> Result<(), ConfigError> {
    std::fs::write(path, config.to_json_pretty())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_json(id: &str, length: i64) -> String {
        format!(r#"{{"id":"{id}","output_type":"linear","length":{length}}}"#)
    }

    fn config_json(outputs: &[String]) -> String {
        format!(
            r#"{{"schema_version":1,"device_name":"Bench","udp_port":9999,"pixel_size":6,"outputs":[{}]}}"#,
            outputs.join(",")
        )
    }

    #[test]
    fn test_output_type_spellings() {
        assert_eq!(OutputType::parse("single").unwrap(), OutputType::Single);
        assert_eq!(OutputType::parse("Strip").unwrap(), OutputType::Linear);
        assert_eq!(OutputType::parse("LEDSTRIP").unwrap(), OutputType::Linear);
        assert_eq!(OutputType::parse("grid").unwrap(), OutputType::Matrix);
        assert_eq!(OutputType::parse(" Matrix ").unwrap(), OutputType::Matrix);
        assert!(OutputType::parse("").is_err());
        assert!(OutputType::parse("ring").is_err());
    }

    #[test]
    fn test_matrix_derive_counts_non_null_entries() {
        let m = MatrixMap {
            width: 2,
            height: 2,
            map: vec![Some(0), None, Some(1), None],
        };
        assert_eq!(m.derive_leds_count("m").unwrap(), 2);
    }

    #[test]
    fn test_matrix_duplicate_index_rejected() {
        let m = MatrixMap {
            width: 2,
            height: 2,
            map: vec![Some(0), Some(0), Some(1), None],
        };
        match m.derive_leds_count("m") {
            Err(ConfigError::DuplicateMatrixIndex { index, .. }) => assert_eq!(index, 0),
            other => panic!("expected duplicate index error, got {other:?}"),
        }
    }

    #[test]
    fn test_matrix_gap_rejected() {
        let m = MatrixMap {
            width: 2,
            height: 2,
            map: vec![Some(1), None, None, None],
        };
        match m.derive_leds_count("m") {
            Err(ConfigError::MatrixIndexGap { missing, .. }) => assert_eq!(missing, 0),
            other => panic!("expected gap error, got {other:?}"),
        }
    }

    #[test]
    fn test_matrix_all_null_rejected() {
        let m = MatrixMap {
            width: 1,
            height: 2,
            map: vec![None, None],
        };
        assert!(matches!(
            m.derive_leds_count("m"),
            Err(ConfigError::EmptyMatrix { .. })
        ));
    }

    #[test]
    fn test_matrix_map_length_mismatch() {
        let m = MatrixMap {
            width: 2,
            height: 2,
            map: vec![Some(0)],
        };
        assert!(matches!(
            m.derive_leds_count("m"),
            Err(ConfigError::MatrixMapLength {
                expected: 4,
                actual: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_single_forces_one_led() {
        let json = config_json(&[
            r#"{"id":"s","output_type":"single","leds_count":2}"#.to_string()
        ]);
        assert!(matches!(
            DeviceConfig::from_json(&json),
            Err(ConfigError::SingleLedsCount { .. })
        ));
    }

    #[test]
    fn test_linear_accepts_length_or_leds_count() {
        let a = config_json(&[linear_json("a", 5)]);
        let b = config_json(&[r#"{"id":"a","output_type":"linear","leds_count":5}"#.to_string()]);
        assert_eq!(
            DeviceConfig::from_json(&a).unwrap().outputs[0].leds_count,
            5
        );
        assert_eq!(
            DeviceConfig::from_json(&b).unwrap().outputs[0].leds_count,
            5
        );
    }

    #[test]
    fn test_linear_conflicting_fields_rejected() {
        let json = config_json(&[
            r#"{"id":"a","output_type":"linear","length":5,"leds_count":6}"#.to_string(),
        ]);
        assert!(matches!(
            DeviceConfig::from_json(&json),
            Err(ConfigError::ConflictingLength { .. })
        ));
    }

    #[test]
    fn test_linear_zero_length_rejected() {
        let json = config_json(&[linear_json("a", 0)]);
        assert!(matches!(
            DeviceConfig::from_json(&json),
            Err(ConfigError::InvalidLength { length: 0, .. })
        ));
    }

    #[test]
    fn test_matrix_hint_must_match_derived() {
        let json = config_json(&[r#"{"id":"m","output_type":"matrix","leds_count":3,
            "matrix":{"width":2,"height":1,"map":[0,1]}}"#
            .to_string()]);
        assert!(matches!(
            DeviceConfig::from_json(&json),
            Err(ConfigError::LedsCountMismatch {
                provided: 3,
                derived: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_duplicate_output_id_rejected() {
        let json = config_json(&[linear_json("a", 3), linear_json("a", 4)]);
        assert!(matches!(
            DeviceConfig::from_json(&json),
            Err(ConfigError::DuplicateOutputId(id)) if id == "a"
        ));
    }

    #[test]
    fn test_empty_outputs_rejected() {
        let json = r#"{"schema_version":1,"outputs":[]}"#;
        assert!(matches!(
            DeviceConfig::from_json(json),
            Err(ConfigError::NoOutputs)
        ));
    }

    #[test]
    fn test_name_falls_back_to_id() {
        let json = config_json(&[linear_json("strip-1", 3)]);
        let config = DeviceConfig::from_json(&json).unwrap();
        assert_eq!(config.outputs[0].name, "strip-1");
    }

    #[test]
    fn test_round_trip_law() {
        let json = config_json(&[
            r#"{"id":"px","output_type":"single"}"#.to_string(),
            linear_json("strip", 7),
            r#"{"id":"panel","name":"Panel","output_type":"matrix",
                "matrix":{"width":2,"height":2,"map":[0,null,1,null]}}"#
                .to_string(),
        ]);
        let parsed = DeviceConfig::from_json(&json).unwrap();
        let reparsed = DeviceConfig::from_json(&parsed.to_json()).unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn test_default_config_round_trips() {
        let config = DeviceConfig::default_config();
        assert_eq!(config.total_leds(), 48 * 27);
        let reparsed = DeviceConfig::from_json(&config.to_json()).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn test_example_mixed_outputs() {
        // Single + Linear(3) => 4 LEDs total.
        let json = config_json(&[
            r#"{"id":"a","output_type":"single"}"#.to_string(),
            linear_json("b", 3),
        ]);
        let config = DeviceConfig::from_json(&json).unwrap();
        assert_eq!(config.total_leds(), 4);
        assert_eq!(config.outputs[0].leds_count, 1);
        assert_eq!(config.outputs[1].leds_count, 3);
    }

    #[test]
    fn test_load_missing_file_uses_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config, DeviceConfig::default_config());
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        let config = DeviceConfig::default_config();
        save_config(&path, &config).unwrap();
        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(config, loaded);
    }
}
