pub mod storage;
pub mod timer;

pub use storage::{JobIdStore, Storage};
pub use timer::{CancelToken, ThreadTimers, TimerHandle, TimerService};
