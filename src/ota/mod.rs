// Cloud OTA engine
//
// Update flow:
// 1. Fetch a job from the OTA service (manually or on the autofetch timer)
// 2. Download and flash the image on the apply task, persist the job id
// 3. Reboot into the new image
// 4. Validate it, then report success or roll back

pub mod apply;
pub mod autofetch;
pub mod engine;
pub mod error;
pub mod job;
pub mod reporter;
pub mod validation;

pub use apply::{ApplyContext, ApplyOutcome, FlashingHandler, OtaHandler};
pub use engine::{EngineStatus, FetchOutcome, OtaCallbacks, OtaEngine};
pub use error::OtaError;
pub use job::Job;
pub use reporter::JobStatus;
pub use validation::{Diagnostics, ValidationState};
