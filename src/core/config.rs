//! Configuration record for the resembl core.
//!
//! Mirrors the valknut-rs approach of one strongly-typed config struct
//! with serde defaults (see `valknut_rs::core::config::ValknutConfig`),
//! but scoped to exactly the keys §6 of the spec recognises. Unknown
//! keys are rejected rather than silently ignored — there is no
//! dynamic/dict-shaped config here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::errors::{ResemblError, Result};

/// Output rendering format. The core never renders output itself; this
/// only exists so the (out-of-scope) CLI layer can round-trip it through
/// `config get`/`config set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable table.
    Table,
    /// Newline-delimited or pretty JSON.
    Json,
    /// Comma-separated values.
    Csv,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Table
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = ResemblError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(ResemblError::BadInput(format!(
                "unrecognised format '{other}', expected table|json|csv"
            ))),
        }
    }
}

/// The enumerated configuration record. Every field corresponds to one
/// of the recognised config keys in spec §6; there is no catch-all map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ResemblConfig {
    /// Minimum Jaccard estimate a candidate must clear to be returned by `find`.
    pub lsh_threshold: f64,
    /// Number of MinHash permutations (signature width); must factor cleanly for banding.
    pub num_permutations: u32,
    /// Default number of results `find` returns.
    pub top_n: u32,
    /// Shingle (n-gram) size in tokens.
    pub ngram_size: u32,
    /// Weight given to Jaccard in the hybrid score, in `[0, 1]`.
    pub jaccard_weight: f64,
    /// Default output rendering format for the CLI layer.
    pub format: OutputFormat,
}

impl Default for ResemblConfig {
    fn default() -> Self {
        Self {
            lsh_threshold: 0.5,
            num_permutations: 128,
            top_n: 5,
            ngram_size: 3,
            jaccard_weight: 0.4,
            format: OutputFormat::Table,
        }
    }
}

impl ResemblConfig {
    /// Validate range/shape constraints independent of how the config was built.
    pub fn validate(&self) -> Result<()> {
        validate_unit_range("lsh_threshold", self.lsh_threshold)?;
        validate_unit_range("jaccard_weight", self.jaccard_weight)?;
        if self.num_permutations == 0 {
            return Err(ResemblError::BadInput(
                "num_permutations must be >= 1".into(),
            ));
        }
        if self.top_n == 0 {
            return Err(ResemblError::BadInput("top_n must be >= 1".into()));
        }
        if self.ngram_size == 0 {
            return Err(ResemblError::BadInput("ngram_size must be >= 1".into()));
        }
        Ok(())
    }

    /// Build a config by overlaying raw `key = value` pairs (as if already
    /// parsed out of whatever file format the external config loader
    /// uses) onto the defaults. Unrecognised keys are a hard error, per
    /// spec §6 ("Unrecognised keys are rejected").
    pub fn from_overrides(overrides: &BTreeMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in overrides {
            match key.as_str() {
                "lsh_threshold" => config.lsh_threshold = parse_f64(key, value)?,
                "num_permutations" => config.num_permutations = parse_u32(key, value)?,
                "top_n" => config.top_n = parse_u32(key, value)?,
                "ngram_size" => config.ngram_size = parse_u32(key, value)?,
                "jaccard_weight" => config.jaccard_weight = parse_f64(key, value)?,
                "format" => config.format = value.parse()?,
                other => {
                    return Err(ResemblError::BadInput(format!(
                        "unrecognised config key '{other}'"
                    )))
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Serialise back into `key = value` strings, e.g. for `config list`.
    pub fn as_overrides(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("lsh_threshold".into(), self.lsh_threshold.to_string());
        map.insert(
            "num_permutations".into(),
            self.num_permutations.to_string(),
        );
        map.insert("top_n".into(), self.top_n.to_string());
        map.insert("ngram_size".into(), self.ngram_size.to_string());
        map.insert("jaccard_weight".into(), self.jaccard_weight.to_string());
        map.insert(
            "format".into(),
            match self.format {
                OutputFormat::Table => "table",
                OutputFormat::Json => "json",
                OutputFormat::Csv => "csv",
            }
            .to_string(),
        );
        map
    }
}

fn validate_unit_range(field: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ResemblError::BadInput(format!(
            "{field} must be in [0, 1], got {value}"
        )));
    }
    Ok(())
}

fn parse_f64(field: &str, raw: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|e| ResemblError::BadInput(format!("invalid value for {field}: {e}")))
}

fn parse_u32(field: &str, raw: &str) -> Result<u32> {
    raw.parse::<u32>()
        .map_err(|e| ResemblError::BadInput(format!("invalid value for {field}: {e}")))
}
