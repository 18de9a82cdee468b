//! Model options: raw string settings and their typed view.

use crate::analysis::format::Backend;
use crate::compute::engine::RunSettings;
use crate::compute::safety::NumericPolicy;
use crate::error::{ModelError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub type OptionMap = IndexMap<String, String>;

/// Settings every store starts with. Fragments override them key by key.
pub const DEFAULT_OPTIONS: &[(&str, &str)] = &[
    ("t_start", "0"),
    ("t_end", "86400"),
    ("formatting_mode", "numpy"),
    ("expand_variables", "False"),
    ("expand_functions", "True"),
    ("interpolation", "linear"),
    ("solver", "BDF"),
    ("max_step", "3600"),
    ("atol", "1e-3"),
    ("rtol", "1e-6"),
    ("output_step", "3600"),
    ("t_eval", "None"),
    ("clip_large_nums", "True"),
    ("nans_to_zeros", "True"),
    ("warn_loading", "False"),
    ("warn_runtime", "False"),
    ("log_runtime_warnings", "True"),
];

/// Keys interpreted by `ModelOptions`. Everything else is passed through to
/// the integrator untouched.
const INTERPRETED: &[&str] = &[
    "t_start",
    "t_end",
    "formatting_mode",
    "expand_variables",
    "expand_functions",
    "interpolation",
    "clip_large_nums",
    "nans_to_zeros",
    "warn_loading",
    "warn_runtime",
    "log_runtime_warnings",
];

pub fn default_options() -> OptionMap {
    DEFAULT_OPTIONS
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// How input data is sampled between its time points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    /// Piecewise linear, clamped at both ends.
    #[default]
    Linear,
    /// Last value at or before the requested time.
    Left,
}

impl FromStr for Interpolation {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(Interpolation::Linear),
            "left" => Ok(Interpolation::Left),
            _ => Err(invalid("interpolation", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOptions {
    pub t_start: f64,
    pub t_end: f64,
    pub formatting_mode: Backend,
    pub expand_variables: bool,
    pub expand_functions: bool,
    pub interpolation: Interpolation,
    pub clip_large_nums: bool,
    pub nans_to_zeros: bool,
    pub warn_loading: bool,
    pub warn_runtime: bool,
    pub log_runtime_warnings: bool,
    /// Integrator settings (`solver`, `atol`, ...) kept as written.
    pub integrator: OptionMap,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            t_start: 0.0,
            t_end: 86400.0,
            formatting_mode: Backend::Numpy,
            expand_variables: false,
            expand_functions: true,
            interpolation: Interpolation::Linear,
            clip_large_nums: true,
            nans_to_zeros: true,
            warn_loading: false,
            warn_runtime: false,
            log_runtime_warnings: true,
            integrator: default_options()
                .into_iter()
                .filter(|(k, _)| !INTERPRETED.contains(&k.as_str()))
                .collect(),
        }
    }
}

impl ModelOptions {
    /// Parses a raw option map. Missing keys keep their defaults.
    pub fn from_map(map: &OptionMap) -> Result<Self> {
        let mut options = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "t_start" => options.t_start = parse_f64(key, value)?,
                "t_end" => options.t_end = parse_f64(key, value)?,
                "formatting_mode" => {
                    options.formatting_mode = value
                        .parse()
                        .map_err(|_| ModelError::UnrecognizedFormattingMode(value.clone()))?
                }
                "expand_variables" => options.expand_variables = parse_bool(key, value)?,
                "expand_functions" => options.expand_functions = parse_bool(key, value)?,
                "interpolation" => options.interpolation = value.parse()?,
                "clip_large_nums" => options.clip_large_nums = parse_bool(key, value)?,
                "nans_to_zeros" => options.nans_to_zeros = parse_bool(key, value)?,
                "warn_loading" => options.warn_loading = parse_bool(key, value)?,
                "warn_runtime" => options.warn_runtime = parse_bool(key, value)?,
                "log_runtime_warnings" => options.log_runtime_warnings = parse_bool(key, value)?,
                _ => {
                    options.integrator.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(options)
    }

    pub fn policy(&self) -> NumericPolicy {
        NumericPolicy {
            clip_large_nums: self.clip_large_nums,
            nans_to_zeros: self.nans_to_zeros,
            log_corrections: self.log_runtime_warnings,
        }
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            policy: self.policy(),
            interpolation: self.interpolation,
            warn: self.warn_runtime,
        }
    }
}

/// Reads a boolean setting leniently, for use before full option parsing.
pub(crate) fn flag(map: &OptionMap, key: &str) -> bool {
    map.get(key).map_or(false, |v| parse_bool(key, v).unwrap_or(false))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_f64(key: &str, value: &str) -> Result<f64> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> ModelError {
    ModelError::InvalidOption { key: key.to_string(), value: value.to_string() }
}
