//! Externally supplied time series.

use super::options::Interpolation;
use crate::error::{ModelError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Name of the time axis. Expressions may read it as a variable.
pub const TIME_COLUMN: &str = "Time";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputColumn {
    pub values: Vec<f64>,
    pub unit: Option<String>,
    pub description: Option<String>,
}

impl InputColumn {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values, unit: None, description: None }
    }
}

/// A strictly increasing time axis with named value columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawInputTable")]
pub struct InputTable {
    time: Vec<f64>,
    columns: IndexMap<String, InputColumn>,
}

/// Serialized form, checked by `TryFrom` before it becomes a table.
#[derive(Deserialize)]
struct RawInputTable {
    #[serde(default)]
    time: Vec<f64>,
    #[serde(default)]
    columns: IndexMap<String, InputColumn>,
}

impl TryFrom<RawInputTable> for InputTable {
    type Error = ModelError;

    fn try_from(raw: RawInputTable) -> Result<Self> {
        if raw.time.is_empty() && raw.columns.is_empty() {
            return Ok(Self::default());
        }
        let mut table = Self::new(raw.time)?;
        for (name, column) in raw.columns {
            table.insert(&name, column)?;
        }
        Ok(table)
    }
}

/// Where a sample time falls on the time axis.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Position {
    Row(usize),
    Between { lower: usize, fraction: f64 },
}

impl InputTable {
    pub fn new(time: Vec<f64>) -> Result<Self> {
        if time.is_empty() {
            return Err(ModelError::InvalidInputData("time axis is empty".into()));
        }
        if let Some(bad) = time.iter().find(|t| !t.is_finite()) {
            return Err(ModelError::InvalidInputData(format!("time value {} is not finite", bad)));
        }
        if let Some(w) = time.windows(2).find(|w| w[1] <= w[0]) {
            return Err(ModelError::InvalidInputData(format!(
                "time axis is not strictly increasing at {} -> {}",
                w[0], w[1]
            )));
        }
        Ok(Self { time, columns: IndexMap::new() })
    }

    pub fn with_column(mut self, name: &str, values: Vec<f64>) -> Result<Self> {
        self.insert(name, InputColumn::new(values))?;
        Ok(self)
    }

    pub fn with_described_column(mut self, name: &str, values: Vec<f64>, unit: &str, description: &str) -> Result<Self> {
        self.insert(
            name,
            InputColumn {
                values,
                unit: Some(unit.to_string()),
                description: Some(description.to_string()),
            },
        )?;
        Ok(self)
    }

    /// Adds or replaces a column. Returns true when a column was replaced.
    pub fn insert(&mut self, name: &str, column: InputColumn) -> Result<bool> {
        if name.eq_ignore_ascii_case(TIME_COLUMN) {
            return Err(ModelError::InvalidInputData(format!("'{}' is reserved for the time axis", name)));
        }
        if self.time.is_empty() {
            return Err(ModelError::InvalidInputData(format!("column '{}' added to a table without a time axis", name)));
        }
        if column.values.len() != self.time.len() {
            return Err(ModelError::InvalidInputData(format!(
                "column '{}' has {} value(s) for {} time point(s)",
                name,
                column.values.len(),
                self.time.len()
            )));
        }
        Ok(self.columns.insert(name.to_string(), column).is_some())
    }

    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn column(&self, name: &str) -> Option<&InputColumn> {
        self.columns.get(name)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &InputColumn)> {
        self.columns.iter()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Number of value columns.
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Number of time points.
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Merges `other` into this table and returns the names of replaced
    /// columns. Columns of `other` are resampled onto this table's time axis;
    /// a table without a time axis holds no columns and takes over `other`.
    pub fn merge(&mut self, other: InputTable, mode: Interpolation) -> Vec<String> {
        if self.is_empty() {
            *self = other;
            return Vec::new();
        }
        let positions: Vec<Position> = self.time.iter().map(|&t| other.locate(t, mode)).collect();
        let mut replaced = Vec::new();
        for (name, column) in other.columns {
            let values = positions.iter().map(|&p| read(&column.values, p)).collect();
            let resampled = InputColumn { values, ..column };
            if self.columns.insert(name.clone(), resampled).is_some() {
                replaced.push(name);
            }
        }
        replaced
    }

    /// Writes every column's value at time `t` into `out`, in column order.
    pub fn sample_into(&self, t: f64, mode: Interpolation, out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.columns.len());
        if self.time.is_empty() {
            return;
        }
        let position = self.locate(t, mode);
        for (slot, column) in out.iter_mut().zip(self.columns.values()) {
            *slot = read(&column.values, position);
        }
    }

    pub fn sample(&self, name: &str, t: f64, mode: Interpolation) -> Option<f64> {
        if self.time.is_empty() {
            return None;
        }
        let column = self.columns.get(name)?;
        Some(read(&column.values, self.locate(t, mode)))
    }

    fn locate(&self, t: f64, mode: Interpolation) -> Position {
        match mode {
            // Last row strictly before t
            Interpolation::Left => Position::Row(self.time.partition_point(|&x| x < t).saturating_sub(1)),
            Interpolation::Linear => {
                let n = self.time.len();
                // First index with time > t
                let upper = self.time.partition_point(|&x| x <= t);
                if upper == 0 {
                    return Position::Row(0);
                }
                if upper == n {
                    return Position::Row(n - 1);
                }
                let lower = upper - 1;
                let span = self.time[upper] - self.time[lower];
                let fraction = (t - self.time[lower]) / span;
                if fraction == 0.0 {
                    Position::Row(lower)
                } else {
                    Position::Between { lower, fraction }
                }
            }
        }
    }
}

#[inline]
fn read(values: &[f64], position: Position) -> f64 {
    match position {
        Position::Row(i) => values[i],
        Position::Between { lower, fraction } => values[lower] + fraction * (values[lower + 1] - values[lower]),
    }
}
