//! Error taxonomy for loading and compiling a model.
//!
//! Structural problems abort the merge or compile call that found them.
//! Numeric problems at evaluation time are never errors; they are corrected
//! according to the run's `NumericPolicy` and written to the audit log.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Duplicate definition for '{name}' in one fragment: '{first}' and '{second}'")]
    DuplicateDefinition { name: String, first: String, second: String },

    #[error("Function '{name}' expects {expected} argument(s) but got {actual} in '{expression}'")]
    ArgumentCountMismatch {
        name: String,
        expected: usize,
        actual: usize,
        expression: String,
    },

    #[error("No definition found for function '{name}' called in '{expression}'")]
    UnknownFunction { name: String, expression: String },

    #[error("Malformed expression '{expression}': {reason}")]
    MalformedExpression { expression: String, reason: String },

    #[error("Circular dependency detected: {}", path.join(" -> "))]
    CircularDependency { path: Vec<String> },

    #[error("Unrecognized formatting mode '{0}'")]
    UnrecognizedFormattingMode(String),

    #[error("Unsupported backend '{backend}': {reason}")]
    UnsupportedBackend { backend: String, reason: String },

    #[error("Invalid value '{value}' for option '{key}'")]
    InvalidOption { key: String, value: String },

    #[error("Malformed fragment: {0}")]
    MalformedFragment(String),

    #[error("Invalid function signature '{0}'")]
    InvalidFunctionSignature(String),

    #[error("Unknown variable '{name}' in '{expression}'")]
    UnknownVariable { name: String, expression: String },

    #[error("Variable '{name}' is declared as an input but no data was supplied for it")]
    MissingInput { name: String },

    #[error("State '{name}' has no initial value")]
    MissingInitialValue { name: String },

    #[error("Initial value '{text}' of state '{name}' is not a number")]
    InvalidInitialValue { name: String, text: String },

    #[error("Invalid input data: {0}")]
    InvalidInputData(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;

impl ModelError {
    pub(crate) fn malformed(expression: &str, reason: impl Into<String>) -> Self {
        ModelError::MalformedExpression {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}
