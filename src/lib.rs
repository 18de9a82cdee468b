//! Compiles fragmented ODE model definitions into an ordered, executable
//! derivative function for an external integrator.
//!
//! `Model` collects fragments and input data; `Model::compile` runs the
//! pipeline (inline, dependencies, schedule, format, codegen) and returns a
//! `CompiledModel` whose `Evaluator` implements `OdeSystem`.

pub mod analysis;
pub mod compute;
pub mod display;
pub mod error;
pub mod model;
pub mod store;

pub use analysis::format::Backend;
pub use compute::engine::{Evaluator, OdeSystem, RunSettings};
pub use compute::safety::NumericPolicy;
pub use display::audit::{AuditLog, LogCategory, LogEntry};
pub use error::{ModelError, Result};
pub use model::{CompiledModel, Model};
pub use store::{Fragment, InputTable, ModelOptions, VariableStore};
