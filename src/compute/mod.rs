//! Derivative code generation and evaluation.
pub mod bytecode;
pub mod engine;
pub mod ledger;
pub mod parser;
pub mod safety;

pub use bytecode::{Compiler, Layout, Program};
pub use engine::{Evaluator, OdeSystem};
pub use ledger::Trajectory;
pub use safety::NumericPolicy;
