use super::fragment::Fragment;
use super::inputs::InputTable;
use super::options::{self, default_options, Interpolation, OptionMap};
use super::types::*;
use crate::display::audit::{AuditLog, LogCategory};
use crate::error::Result;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

/// Insertion-ordered name sets, one per variable kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KindIndex {
    pub constants: IndexSet<String>,
    pub inputs: IndexSet<String>,
    pub functions: IndexSet<String>,
    pub auxiliaries: IndexSet<String>,
    pub states: IndexSet<String>,
}

impl KindIndex {
    pub fn names(&self, kind: VariableKind) -> &IndexSet<String> {
        match kind {
            VariableKind::Constant => &self.constants,
            VariableKind::Input => &self.inputs,
            VariableKind::Function => &self.functions,
            VariableKind::Auxiliary => &self.auxiliaries,
            VariableKind::State => &self.states,
        }
    }

    fn names_mut(&mut self, kind: VariableKind) -> &mut IndexSet<String> {
        match kind {
            VariableKind::Constant => &mut self.constants,
            VariableKind::Input => &mut self.inputs,
            VariableKind::Function => &mut self.functions,
            VariableKind::Auxiliary => &mut self.auxiliaries,
            VariableKind::State => &mut self.states,
        }
    }

    fn reassign(&mut self, name: &str, from: Option<VariableKind>, to: VariableKind) {
        if let Some(old) = from {
            self.names_mut(old).shift_remove(name);
        }
        self.names_mut(to).insert(name.to_string());
    }
}

/// The merged view of every fragment and input table loaded so far.
///
/// Later merges override earlier ones field by field. Every overwrite of a
/// non-default value is recorded in the audit log as a replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableStore {
    variables: IndexMap<String, Variable>,
    kinds: KindIndex,
    initial_values: IndexMap<String, String>,
    options: OptionMap,
    input_data: InputTable,
}

impl Default for VariableStore {
    fn default() -> Self {
        Self {
            variables: IndexMap::new(),
            kinds: KindIndex::default(),
            initial_values: IndexMap::new(),
            options: default_options(),
            input_data: InputTable::default(),
        }
    }
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn variables(&self) -> &IndexMap<String, Variable> {
        &self.variables
    }

    pub fn kinds(&self) -> &KindIndex {
        &self.kinds
    }

    pub fn names_of(&self, kind: VariableKind) -> &IndexSet<String> {
        self.kinds.names(kind)
    }

    pub fn initial_values(&self) -> &IndexMap<String, String> {
        &self.initial_values
    }

    pub fn options(&self) -> &OptionMap {
        &self.options
    }

    pub fn input_data(&self) -> &InputTable {
        &self.input_data
    }

    /// True when the name's values come from input data.
    pub fn is_externally_supplied(&self, name: &str) -> bool {
        self.input_data.contains(name)
    }

    /// Merges one fragment. The fragment is fully validated first, so a
    /// failing merge leaves the store unchanged.
    pub fn merge(&mut self, fragment: &Fragment, origin: &str, log: &mut AuditLog) -> Result<()> {
        let entries = fragment.variables()?;
        let initial_values = fragment.initial_values()?;
        let fragment_options = fragment.options()?;

        // 1. Options first, so `warn_loading` set by this fragment applies to it
        for (key, value) in fragment_options {
            self.set_option(&key, &value, origin, log);
        }
        let warn = options::flag(&self.options, "warn_loading");

        // 2. Variables
        let count = entries.len();
        for entry in entries.into_values() {
            self.apply_entry(entry, origin, log, warn);
        }

        // 3. Initial values
        for (name, text) in initial_values {
            if let Some(old) = self.initial_values.get(&name) {
                if *old != text {
                    log.record(
                        LogCategory::Replacement,
                        format!("Replaced initial value of '{}': '{}' -> '{}' (from {})", name, old, text, origin),
                        warn,
                    );
                }
            }
            self.initial_values.insert(name, text);
        }

        log.record(LogCategory::Load, format!("Merged {} variable(s) from {}", count, origin), false);
        Ok(())
    }

    /// Sets one option, logging a change of an existing value.
    pub fn set_option(&mut self, key: &str, value: &str, origin: &str, log: &mut AuditLog) {
        let warn = options::flag(&self.options, "warn_loading");
        match self.options.get(key) {
            Some(old) if old == value => return,
            Some(old) => log.record(
                LogCategory::Option,
                format!("Option '{}' changed from '{}' to '{}' (from {})", key, old, value, origin),
                warn,
            ),
            None => log.record(
                LogCategory::Option,
                format!("Option '{}' set to '{}' (from {})", key, value, origin),
                false,
            ),
        }
        self.options.insert(key.to_string(), value.to_string());
    }

    /// Merges an input table. Every column becomes an input variable whose
    /// values are supplied externally from now on.
    pub fn merge_inputs(&mut self, table: InputTable, origin: &str, log: &mut AuditLog) -> Result<()> {
        let mode = self.options.get("interpolation").map(|s| s.parse::<Interpolation>()).transpose()?.unwrap_or_default();
        let warn = options::flag(&self.options, "warn_loading");

        for (name, column) in table.columns() {
            let existed = self.variables.contains_key(name.as_str());
            let var = self
                .variables
                .entry(name.clone())
                .or_insert_with(|| Variable::new(name.as_str(), VariableKind::Input));

            if existed && (var.kind != VariableKind::Input || !var.is_self_defined()) {
                log.record(
                    LogCategory::Replacement,
                    format!("Replaced variable '{}' ({}) by input values from {}", name, var.kind, origin),
                    warn,
                );
            }
            let previous = existed.then_some(var.kind);
            if previous != Some(VariableKind::Input) {
                self.kinds.reassign(name, previous, VariableKind::Input);
            }
            var.kind = VariableKind::Input;
            var.definition = name.clone();

            if let Some(unit) = &column.unit {
                update_field(name, "unit", &mut var.unit, Some(unit.clone()), UNDEFINED_UNIT, origin, log, warn);
            }
            if let Some(description) = &column.description {
                update_field(name, "description", &mut var.description, Some(description.clone()), "", origin, log, warn);
            }
        }

        let width = table.width();
        for name in self.input_data.merge(table, mode) {
            log.record(
                LogCategory::Replacement,
                format!("Replaced input data for '{}' (from {})", name, origin),
                warn,
            );
        }
        log.record(LogCategory::Load, format!("Merged {} input column(s) from {}", width, origin), false);
        Ok(())
    }

    fn apply_entry(&mut self, entry: VariableEntry, origin: &str, log: &mut AuditLog, warn: bool) {
        let name = entry.name;
        let supplied = self.input_data.contains(&name);
        let existed = self.variables.contains_key(&name);
        let var = self
            .variables
            .entry(name.clone())
            .or_insert_with(|| Variable::new(name.as_str(), entry.kind.unwrap_or(VariableKind::Auxiliary)));

        if !existed {
            self.kinds.reassign(&name, None, var.kind);
        }

        if supplied {
            let changes_kind = entry.kind.map_or(false, |k| k != VariableKind::Input);
            let changes_definition = entry.definition.as_deref().map_or(false, |d| d.trim() != name);
            if changes_kind || changes_definition {
                log.record(
                    LogCategory::Replacement,
                    format!("Ignored redefinition of '{}' from {}: values are supplied by input data", name, origin),
                    warn,
                );
            }
        } else {
            update_field(&name, "definition", &mut var.definition, entry.definition, &name, origin, log, warn);
            if let Some(kind) = entry.kind {
                if kind != var.kind {
                    if existed {
                        log.record(
                            LogCategory::Replacement,
                            format!("Changed type of '{}' from {} to {} (from {})", name, var.kind, kind, origin),
                            warn,
                        );
                    }
                    self.kinds.reassign(&name, Some(var.kind), kind);
                    var.kind = kind;
                }
            }
        }

        update_field(&name, "unit", &mut var.unit, entry.unit, UNDEFINED_UNIT, origin, log, warn);
        update_field(&name, "description", &mut var.description, entry.description, "", origin, log, warn);
        update_field(&name, "reference", &mut var.reference, entry.reference, "", origin, log, warn);
    }
}

/// Applies `new` to `current` unless it is the placeholder or unchanged.
/// Overwriting a non-placeholder value is logged as a replacement.
#[allow(clippy::too_many_arguments)]
fn update_field(
    name: &str,
    field: &str,
    current: &mut String,
    new: Option<String>,
    placeholder: &str,
    origin: &str,
    log: &mut AuditLog,
    warn: bool,
) {
    let Some(new) = new else { return };
    if new == placeholder || new == *current {
        return;
    }
    if *current != placeholder {
        log.record(
            LogCategory::Replacement,
            format!("Replaced {} of '{}': '{}' -> '{}' (from {})", field, name, current, new, origin),
            warn,
        );
    }
    *current = new;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merge(store: &mut VariableStore, log: &mut AuditLog, text: &str, origin: &str) -> Result<()> {
        store.merge(&Fragment::from_json_str(text).unwrap(), origin, log)
    }

    #[test]
    fn test_new_variables_get_defaults() {
        let mut store = VariableStore::new();
        let mut log = AuditLog::new();
        merge(&mut store, &mut log, r#"{"x": {"type": "aux"}, "k": {"definition": "2"}}"#, "base").unwrap();

        let x = store.get("x").unwrap();
        assert_eq!(x.definition, "x");
        assert_eq!(x.unit, UNDEFINED_UNIT);
        assert_eq!(x.description, "");
        assert_eq!(store.get("k").unwrap().kind, VariableKind::Auxiliary);
        assert_eq!(store.names_of(VariableKind::Auxiliary).len(), 2);
        assert_eq!(log.of_category(LogCategory::Replacement).count(), 0);
    }

    #[test]
    fn test_cross_fragment_override_logs_replacement() {
        let mut store = VariableStore::new();
        let mut log = AuditLog::new();
        merge(&mut store, &mut log, r#"{"c": {"type": "const", "definition": "5"}}"#, "base").unwrap();
        merge(&mut store, &mut log, r#"{"c": {"type": "const", "definition": "6"}}"#, "scenario").unwrap();

        assert_eq!(store.get("c").unwrap().definition, "6");
        let replacements: Vec<_> = log.of_category(LogCategory::Replacement).collect();
        assert_eq!(replacements.len(), 1);
        assert!(replacements[0].message.contains("'5' -> '6'"));
    }

    #[test]
    fn test_placeholder_values_do_not_override() {
        let mut store = VariableStore::new();
        let mut log = AuditLog::new();
        merge(&mut store, &mut log, r#"{"c": {"definition": "5", "unit": "W", "description": "gain"}}"#, "a").unwrap();
        merge(&mut store, &mut log, r#"{"c": {"definition": "c", "unit": "undefined", "description": ""}}"#, "b")
            .unwrap();

        let c = store.get("c").unwrap();
        assert_eq!((c.definition.as_str(), c.unit.as_str(), c.description.as_str()), ("5", "W", "gain"));
        assert!(log.of_category(LogCategory::Replacement).next().is_none());
    }

    #[test]
    fn test_duplicate_within_fragment_leaves_store_untouched() {
        let mut store = VariableStore::new();
        let mut log = AuditLog::new();
        merge(&mut store, &mut log, r#"{"c": {"definition": "1"}}"#, "base").unwrap();
        let before = store.clone();

        let err = merge(
            &mut store,
            &mut log,
            r#"{"a": {"c": {"definition": "5"}}, "b": {"c": {"definition": "6"}}, "options": {"t_end": "5"}}"#,
            "bad",
        )
        .unwrap_err();
        assert!(matches!(err, crate::error::ModelError::DuplicateDefinition { .. }));
        assert_eq!(store, before);
    }

    #[test]
    fn test_kind_change_moves_between_subsets() {
        let mut store = VariableStore::new();
        let mut log = AuditLog::new();
        merge(&mut store, &mut log, r#"{"t": {"type": "aux", "definition": "20"}}"#, "a").unwrap();
        merge(&mut store, &mut log, r#"{"t": {"type": "state", "definition": "0.1", "init": "20"}}"#, "b").unwrap();

        assert!(store.names_of(VariableKind::Auxiliary).is_empty());
        assert!(store.names_of(VariableKind::State).contains("t"));
        assert_eq!(store.initial_values()["t"], "20");
    }

    #[test]
    fn test_options_override_and_log() {
        let mut store = VariableStore::new();
        let mut log = AuditLog::new();
        merge(&mut store, &mut log, r#"{"options": {"t_end": "3600", "custom": "1"}}"#, "scenario").unwrap();

        assert_eq!(store.options()["t_end"], "3600");
        assert_eq!(store.options()["custom"], "1");
        assert_eq!(log.of_category(LogCategory::Option).count(), 2);
    }

    #[test]
    fn test_input_data_downgrades_and_locks_variable() {
        let mut store = VariableStore::new();
        let mut log = AuditLog::new();
        merge(&mut store, &mut log, r#"{"t_out": {"type": "state", "definition": "0", "init": "5"}}"#, "model").unwrap();

        let table = InputTable::new(vec![0.0, 60.0])
            .unwrap()
            .with_described_column("t_out", vec![5.0, 6.0], "C", "outdoor temperature")
            .unwrap();
        store.merge_inputs(table, "weather", &mut log).unwrap();

        let t_out = store.get("t_out").unwrap();
        assert_eq!(t_out.kind, VariableKind::Input);
        assert_eq!(t_out.definition, "t_out");
        assert_eq!(t_out.unit, "C");
        assert!(store.names_of(VariableKind::State).is_empty());
        assert!(store.names_of(VariableKind::Input).contains("t_out"));

        // A later fragment cannot turn it back into a state
        merge(&mut store, &mut log, r#"{"t_out": {"type": "state", "definition": "1"}}"#, "late").unwrap();
        assert_eq!(store.get("t_out").unwrap().kind, VariableKind::Input);
        assert!(log.entries().iter().any(|e| e.message.contains("Ignored redefinition of 't_out'")));
    }

    #[test]
    fn test_second_input_table_is_resampled() {
        let mut store = VariableStore::new();
        let mut log = AuditLog::new();
        let first = InputTable::new(vec![0.0, 10.0]).unwrap().with_column("a", vec![0.0, 1.0]).unwrap();
        let second = InputTable::new(vec![0.0, 20.0]).unwrap().with_column("a", vec![0.0, 2.0]).unwrap();
        store.merge_inputs(first, "one", &mut log).unwrap();
        store.merge_inputs(second, "two", &mut log).unwrap();

        assert_eq!(store.input_data().column("a").unwrap().values, vec![0.0, 1.0]);
        assert!(log.entries().iter().any(|e| e.message.contains("Replaced input data for 'a'")));
    }
}
