//! Expression analysis: tokens, inlining, dependencies, scheduling and
//! backend formatting.
pub mod builtins;
pub mod dependencies;
pub mod expr;
pub mod format;
pub mod inline;
pub mod telemetry;
pub mod topology;

pub use dependencies::{dependencies, dependency_map, DependencyMap};
pub use expr::Expr;
pub use format::{format, Backend, Formatted};
pub use inline::{inline, FunctionDef, FunctionTable};
pub use telemetry::ProgramStats;
pub use topology::schedule;
