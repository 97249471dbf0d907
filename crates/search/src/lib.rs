pub mod executor;
pub mod filter;
pub mod index;

pub use executor::{SearchPage, count, find};
pub use filter::{Condition, Filter, TagMode, compile_all};
pub use index::{IndexOptions, IndexProgress, IndexReport, rebuild_index, search_index};
