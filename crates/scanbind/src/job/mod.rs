//! Batch jobs: one job converts an ordered list of folders, one PDF each.

pub mod model;
mod orchestrator;
pub mod report;

pub use model::{ItemStatus, JobItemRecord, JobRecord, JobStatus, JobView};
pub use orchestrator::{JobOrchestrator, OutputDirs, MAX_PARALLELISM};
pub use report::{ItemReport, JobReport};
