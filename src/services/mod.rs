//! Services - the safe-zone tracking core
//!
//! This module contains the core logic:
//! - `geofence` - Pure enter/exit/position transition function
//! - `scheduler` - Adaptive tracking intensity (high -> balanced -> idle)
//! - `change_cache` - Change-detection cache and advisory inactivity monitor
//! - `retry_queue` - Persistent bounded queue with exponential backoff
//! - `submitter` - Async submission worker with queue fallback
//! - `session` - Imperative shell: rehydrate, transition, persist, execute

pub mod change_cache;
pub mod geofence;
pub mod retry_queue;
pub mod scheduler;
pub mod session;
pub mod submitter;

// Re-export commonly used types
pub use geofence::{transition, Effect, GeofenceEvent, GeofenceSettings, MachineState};
pub use retry_queue::{QueueSettings, RetryQueue};
pub use session::{read_status, SafeZoneSession, SessionContext, StartOutcome, ZoneStatus};
pub use submitter::{create_submission_worker, SubmissionWorker, SubmitCmd, Submitter};
