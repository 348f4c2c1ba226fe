//! Progress reporting, cancellation and job history.

pub mod event;
pub mod session;
pub mod store;

pub use event::{CancellationToken, NullProgress, ProgressSink, ProgressUpdate};
pub use session::{new_job_id, now_millis, JobStatus, PrunePolicy};
pub use store::{JobRecord, JobStore};
