pub mod audit;
pub mod trace;

pub use audit::AuditLog;
pub use trace::format_trace;
