pub mod generate;
pub mod resolve;
pub mod sanitize;

pub use generate::{GenerationOptions, GenerationPhase, GenerationReport, generate};
pub use resolve::{ResolveReport, resolve_threads};
pub use sanitize::{SkipReason, sanitize};
