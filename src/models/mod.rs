mod descriptor;
mod stats;
mod summary;

pub use descriptor::{SessionDescriptor, MAX_DURATION_SECS};
pub use stats::{BackgroundLog, SessionStats};
pub use summary::{FinishReason, SessionSummary};
