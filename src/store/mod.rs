//! Variable definitions merged from fragments and input data.
pub mod fragment;
pub mod inputs;
pub mod options;
pub mod registry;
pub mod types;

pub use fragment::Fragment;
pub use inputs::InputTable;
pub use options::ModelOptions;
pub use registry::VariableStore;
pub use types::{Variable, VariableKind};
