pub mod compiler;
pub mod schema;
pub mod session;

// Re-export the records most callers need (e.g. `use crate::rules::CompiledStrategy`).
pub use compiler::{CompiledStrategy, EntrySignal, EvaluationContext, IndicatorSnapshot};
pub use schema::CanonicalRules;
