//! Pipeline facade: merge fragments and input data, then compile them into an
//! immutable, shareable derivative function.

use crate::analysis::dependencies::DependencyMap;
use crate::analysis::expr::Expr;
use crate::analysis::format::{format, Formatted};
use crate::analysis::inline::{FunctionDef, FunctionTable};
use crate::analysis::telemetry::ProgramStats;
use crate::compute::bytecode::{Compiler, Layout, Program};
use crate::compute::engine::Evaluator;
use crate::display::audit::{AuditLog, LogCategory};
use crate::display::trace::format_trace;
use crate::error::{ModelError, Result};
use crate::store::fragment::Fragment;
use crate::store::inputs::InputTable;
use crate::store::options::ModelOptions;
use crate::store::registry::VariableStore;
use crate::store::types::{Variable, VariableKind};
use indexmap::{IndexMap, IndexSet};
use rayon::prelude::*;
use std::sync::Arc;

/// A model under construction.
#[derive(Debug, Clone, Default)]
pub struct Model {
    store: VariableStore,
    log: AuditLog,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one fragment; `origin` names it in the audit log.
    pub fn merge(&mut self, fragment: &Fragment, origin: &str) -> Result<()> {
        self.store.merge(fragment, origin, &mut self.log)
    }

    pub fn merge_json(&mut self, text: &str, origin: &str) -> Result<()> {
        let fragment = Fragment::from_json_str(text)?;
        self.merge(&fragment, origin)
    }

    pub fn merge_inputs(&mut self, table: InputTable, origin: &str) -> Result<()> {
        self.store.merge_inputs(table, origin, &mut self.log)
    }

    pub fn set_option(&mut self, key: &str, value: &str) {
        self.store.set_option(key, value, "caller", &mut self.log);
    }

    pub fn store(&self) -> &VariableStore {
        &self.store
    }

    pub fn log(&self) -> &AuditLog {
        &self.log
    }

    pub fn options(&self) -> Result<ModelOptions> {
        ModelOptions::from_map(self.store.options())
    }

    /// Declared functions, parsed from their signatures.
    pub fn function_table(&self) -> Result<FunctionTable> {
        let mut table = FunctionTable::new();
        for signature in self.store.names_of(VariableKind::Function) {
            if let Some(var) = self.store.get(signature) {
                table.insert(FunctionDef::parse(signature, &var.definition)?);
            }
        }
        Ok(table)
    }

    /// Runs inlining, dependency analysis, scheduling, formatting and code
    /// generation. The model itself is left unchanged.
    pub fn compile(&self) -> Result<CompiledModel> {
        let options = self.options()?;
        let functions = self.function_table()?;

        let mut all_exprs: IndexMap<String, Expr> = IndexMap::new();
        for (name, var) in self.store.variables() {
            if var.kind == VariableKind::Function {
                continue;
            }
            let expr = Expr::parse(&var.definition)?;
            all_exprs.insert(name.clone(), expr);
        }

        let states = self.store.names_of(VariableKind::State).clone();
        let inputs: IndexSet<String> = self.store.input_data().column_names().map(str::to_string).collect();
        let basis: IndexSet<String> = states.iter().chain(inputs.iter()).cloned().collect();

        let formatted = format(
            &all_exprs,
            &basis,
            &functions,
            options.formatting_mode,
            options.expand_functions,
            options.expand_variables,
        )?;

        let layout = Layout {
            states,
            auxiliaries: formatted.order.iter().cloned().collect(),
            inputs,
        };
        let program = Compiler::new(&formatted, layout).compile()?;
        let initial_state = self.initial_state(&program.layout)?;
        let stats = ProgramStats::analyze(&program);

        let mut log = self.log.clone();
        log.record(
            LogCategory::Compile,
            format!(
                "Compiled {} state(s), {} auxiliar(ies), {} input(s) for backend {}; {} op(s), stack depth {}",
                program.layout.states.len(),
                program.layout.auxiliaries.len(),
                program.layout.inputs.len(),
                options.formatting_mode,
                stats.total_ops,
                stats.max_stack_depth
            ),
            false,
        );
        for line in program.listing().lines() {
            log.record(LogCategory::Compile, line, false);
        }

        Ok(CompiledModel {
            formatted,
            program: Arc::new(program),
            initial_state,
            inputs: Arc::new(self.store.input_data().clone()),
            options,
            variables: self.store.variables().clone(),
            log,
            stats,
        })
    }

    fn initial_state(&self, layout: &Layout) -> Result<Vec<f64>> {
        let values = self.store.initial_values();
        layout
            .states
            .iter()
            .map(|name| {
                let text = values
                    .get(name)
                    .ok_or_else(|| ModelError::MissingInitialValue { name: name.clone() })?;
                text.trim().parse::<f64>().map_err(|_| ModelError::InvalidInitialValue {
                    name: name.clone(),
                    text: text.clone(),
                })
            })
            .collect()
    }
}

/// The compiled artifact. Immutable; share it across threads behind `Arc`.
#[derive(Debug, Clone)]
pub struct CompiledModel {
    formatted: Formatted,
    program: Arc<Program>,
    initial_state: Vec<f64>,
    inputs: Arc<InputTable>,
    options: ModelOptions,
    variables: IndexMap<String, Variable>,
    log: AuditLog,
    stats: ProgramStats,
}

impl CompiledModel {
    pub fn formatted(&self) -> &Formatted {
        &self.formatted
    }

    /// Formatted definition of one variable.
    pub fn expression(&self, name: &str) -> Option<String> {
        self.formatted.text(name)
    }

    pub fn dependencies(&self) -> &DependencyMap {
        &self.formatted.dependencies
    }

    pub fn solving_order(&self) -> &[String] {
        &self.formatted.order
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn state_names(&self) -> impl Iterator<Item = &str> {
        self.program.layout.states.iter().map(String::as_str)
    }

    pub fn initial_state(&self) -> &[f64] {
        &self.initial_state
    }

    pub fn inputs(&self) -> &InputTable {
        &self.inputs
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    pub fn variables(&self) -> &IndexMap<String, Variable> {
        &self.variables
    }

    pub fn log(&self) -> &AuditLog {
        &self.log
    }

    pub fn stats(&self) -> &ProgramStats {
        &self.stats
    }

    /// A fresh run context with the model's runtime settings.
    pub fn evaluator(&self) -> Result<Evaluator> {
        Evaluator::new(Arc::clone(&self.program), Arc::clone(&self.inputs), self.options.run_settings())
    }

    /// Derivatives at many `(t, y)` points, computed in parallel with one
    /// evaluator per worker.
    pub fn evaluate_batch(&self, points: &[(f64, Vec<f64>)]) -> Result<Vec<Vec<f64>>> {
        points
            .par_iter()
            .map_init(
                || self.evaluator(),
                |evaluator, (t, y)| match evaluator {
                    Ok(ev) => Ok(ev.derivative(*t, y)),
                    Err(e) => Err(e.clone()),
                },
            )
            .collect()
    }

    pub fn trace(&self, name: &str) -> String {
        format_trace(self, name)
    }
}
