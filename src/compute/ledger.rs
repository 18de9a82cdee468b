use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Values recorded during a run: one row per distinct evaluation time with
/// the time, every state and every auxiliary.
///
/// Integrators revisit times (rejected steps, Jacobian probes); a repeated
/// time replaces its earlier row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trajectory {
    columns: Vec<String>,
    rows: Vec<Vec<f64>>,
    #[serde(skip)]
    row_index: HashMap<u64, usize>,
}

impl Trajectory {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            row_index: HashMap::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows in recording order.
    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn record(&mut self, t: f64, states: &[f64], auxiliaries: &[f64]) {
        let mut row = Vec::with_capacity(1 + states.len() + auxiliaries.len());
        row.push(t);
        row.extend_from_slice(states);
        row.extend_from_slice(auxiliaries);
        debug_assert_eq!(row.len(), self.columns.len());

        match self.row_index.get(&t.to_bits()) {
            Some(&i) => self.rows[i] = row,
            None => {
                self.row_index.insert(t.to_bits(), self.rows.len());
                self.rows.push(row);
            }
        }
    }

    /// Rows ordered by time.
    pub fn sorted_rows(&self) -> Vec<&[f64]> {
        let mut rows: Vec<&[f64]> = self.rows.iter().map(Vec::as_slice).collect();
        rows.sort_by(|a, b| a[0].total_cmp(&b[0]));
        rows
    }

    /// Values of one column ordered by time.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let index = self.columns.iter().position(|c| c == name)?;
        Some(self.sorted_rows().into_iter().map(|row| row[index]).collect())
    }

    /// Restores the time lookup after deserialization.
    pub fn rebuild_index(&mut self) {
        self.row_index = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| (row[0].to_bits(), i))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trajectory() -> Trajectory {
        Trajectory::new(vec!["Time".into(), "x".into(), "k".into()])
    }

    #[test]
    fn test_repeated_time_replaces_row() {
        let mut tr = trajectory();
        tr.record(0.0, &[1.0], &[0.5]);
        tr.record(2.0, &[3.0], &[0.5]);
        tr.record(1.0, &[2.0], &[0.5]);
        tr.record(2.0, &[4.0], &[0.7]);

        assert_eq!(tr.len(), 3);
        assert_eq!(tr.column("x").unwrap(), vec![1.0, 2.0, 4.0]);
        assert_eq!(tr.column("k").unwrap(), vec![0.5, 0.5, 0.7]);
        assert!(tr.column("missing").is_none());
    }

    #[test]
    fn test_index_survives_serde() {
        let mut tr = trajectory();
        tr.record(0.0, &[1.0], &[0.5]);
        let json = serde_json::to_string(&tr).unwrap();
        let mut restored: Trajectory = serde_json::from_str(&json).unwrap();
        restored.rebuild_index();
        restored.record(0.0, &[9.0], &[0.5]);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.rows()[0], vec![0.0, 9.0, 0.5]);
    }
}
