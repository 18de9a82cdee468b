use crate::compute::bytecode::Layout;
use crate::model::CompiledModel;
use crate::store::types::{VariableKind, UNDEFINED_UNIT};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write;

/// Renders the dependency tree of `name` with its formatted definitions and
/// the slots the program reads them from.
pub fn format_trace(model: &CompiledModel, name: &str) -> String {
    let mut tracer = Tracer {
        model,
        layout: &model.program().layout,
        visited_at_level: HashMap::new(),
        output: String::new(),
    };

    if model.variables().contains_key(name) {
        let _ = writeln!(tracer.output, "TRACE for variable '{}':", name);
        let _ = writeln!(tracer.output, "--------------------------------------------------");
        tracer.trace_variable(name, 1, "", true);
    } else {
        let _ = writeln!(tracer.output, "Error: unknown variable '{}'", name);
    }
    tracer.output
}

struct Tracer<'a> {
    model: &'a CompiledModel,
    layout: &'a Layout,
    visited_at_level: HashMap<String, usize>,
    output: String,
}

impl<'a> Tracer<'a> {
    fn trace_variable(&mut self, name: &str, level: usize, prefix: &str, is_root: bool) {
        if let Some(&first_seen) = self.visited_at_level.get(name) {
            let _ = writeln!(self.output, "{}{} -> (Ref to L{})", prefix, name, first_seen);
            return;
        }
        self.visited_at_level.insert(name.to_string(), level);

        let header = format!("[L{}] {}{}", level, name, self.describe(name));
        let supplied = self.layout.inputs.contains(name);
        let is_state = self.layout.states.contains(name);

        // States below the root and supplied inputs are leaves of the evaluation
        if supplied || (is_state && !is_root) {
            let _ = writeln!(self.output, "{}{} -> {}", prefix, header, self.slot(name));
            return;
        }

        let formatted = self.model.formatted();
        let definition = formatted.text(name).unwrap_or_else(|| "?".to_string());
        let target = if is_state { format!("d/dt {}", self.slot(name)) } else { self.slot(name) };
        let _ = writeln!(self.output, "{}{} {} = {}", prefix, header, target, definition);

        // Scheduling ignores basis names; the trace shows them as leaves
        let mut children: BTreeSet<String> = formatted.dependencies.get(name).cloned().unwrap_or_default();
        if let Some(expr) = formatted.expressions.get(name) {
            children.extend(
                expr.identifiers()
                    .filter(|id| self.layout.states.contains(*id) || self.layout.inputs.contains(*id))
                    .map(str::to_string),
            );
        }
        let children: Vec<String> = children.into_iter().collect();
        self.recurse_children(prefix, &children, level);
    }

    fn recurse_children(&mut self, prefix: &str, children: &[String], level: usize) {
        let stem = self.build_child_stem(prefix);
        for (i, child) in children.iter().enumerate() {
            let connector = if i == children.len() - 1 { "`--" } else { "|--" };
            let full_prefix = format!("{}{} ", stem, connector);
            self.trace_variable(child, level + 1, &full_prefix, false);
        }
    }

    fn describe(&self, name: &str) -> String {
        match self.model.variables().get(name) {
            Some(var) if var.unit != UNDEFINED_UNIT => format!(" ({}, {})", var.kind, var.unit),
            Some(var) => format!(" ({})", var.kind),
            None => String::new(),
        }
    }

    fn slot(&self, name: &str) -> String {
        if let Some(j) = self.layout.states.get_index_of(name) {
            format!("y[{}]", j)
        } else if let Some(k) = self.layout.auxiliaries.get_index_of(name) {
            format!("a[{}]", k)
        } else if let Some(m) = self.layout.inputs.get_index_of(name) {
            format!("d[{}]", m + 1)
        } else {
            match self.model.variables().get(name).map(|v| v.kind) {
                Some(VariableKind::Function) => "fn".to_string(),
                _ => "?".to_string(),
            }
        }
    }

    fn build_child_stem(&self, current_prefix: &str) -> String {
        current_prefix.replace("`-- ", "    ").replace("|-- ", "|   ")
    }
}
