//! Dataset handles: opening directories and zip archives, exporting,
//! upgrading old datasets and running all of it on a worker pool.

pub mod dataset;
pub mod migrate;
pub mod package;
pub mod tasks;

pub use dataset::Dataset;
pub use migrate::{UpgradeReport, upgrade_v1};
pub use package::{PackReport, extract_archive, unpack_target, write_archive};
pub use tasks::{Task, TaskPool};
