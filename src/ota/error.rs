use std::error::Error as StdError;
use std::fmt;

/// Errors surfaced by the OTA engine.
///
/// Platform adapters report failures as `anyhow::Error`; they are wrapped into
/// the matching variant at the seam so callers can match on the class.
#[derive(Debug)]
pub enum OtaError {
    /// `enable()` was called on an engine that is already enabled
    AlreadyEnabled,
    /// An operation that needs `enable()` ran before it
    NotEnabled,
    /// Configuration rejected by `OtaConfig::validate`
    InvalidConfig(String),
    /// Contract violation, e.g. `fetch()` while a job is in progress
    InvalidState(&'static str),
    /// No job id available, neither live nor persisted
    NotFound(&'static str),
    OutOfMemory,
    /// Payload is not valid JSON or has the wrong shape
    Parse(String),
    /// Job payload lacks a required field; it has been reported as rejected
    InvalidJob(&'static str),
    /// The OTA service answered with an error code other than "no update"
    Cloud { code: i64, description: String },
    /// Non-200 answer to a request
    Http { status: u16 },
    Transport(anyhow::Error),
    Storage(anyhow::Error),
    Partition(anyhow::Error),
    Timer(anyhow::Error),
    /// The apply task ended without producing an outcome
    Apply(String),
}

impl OtaError {
    pub fn code(&self) -> &'static str {
        match self {
            OtaError::AlreadyEnabled => "ALREADY_ENABLED",
            OtaError::NotEnabled => "NOT_ENABLED",
            OtaError::InvalidConfig(_) => "INVALID_ARG",
            OtaError::InvalidState(_) => "INVALID_STATE",
            OtaError::NotFound(_) => "NOT_FOUND",
            OtaError::OutOfMemory => "NO_MEM",
            OtaError::Parse(_) => "PARSE",
            OtaError::InvalidJob(_) => "INVALID_JOB",
            OtaError::Cloud { .. } => "CLOUD",
            OtaError::Http { .. } => "HTTP",
            OtaError::Transport(_) => "TRANSPORT",
            OtaError::Storage(_) => "STORAGE",
            OtaError::Partition(_) => "PARTITION",
            OtaError::Timer(_) => "TIMER",
            OtaError::Apply(_) => "APPLY",
        }
    }
}

impl fmt::Display for OtaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtaError::AlreadyEnabled => write!(f, "{}: OTA engine already enabled", self.code()),
            OtaError::NotEnabled => write!(f, "{}: OTA engine not enabled", self.code()),
            OtaError::InvalidConfig(msg) => write!(f, "{}: {}", self.code(), msg),
            OtaError::InvalidState(why) => write!(f, "{}: {}", self.code(), why),
            OtaError::NotFound(what) => write!(f, "{}: {}", self.code(), what),
            OtaError::OutOfMemory => write!(f, "{}: allocation failed", self.code()),
            OtaError::Parse(msg) => write!(f, "{}: {}", self.code(), msg),
            OtaError::InvalidJob(reason) => write!(f, "{}: {}", self.code(), reason),
            OtaError::Cloud { code, description } => {
                write!(f, "{}: error {} ({})", self.code(), code, description)
            }
            OtaError::Http { status } => write!(f, "{}: unexpected status {}", self.code(), status),
            OtaError::Transport(e)
            | OtaError::Storage(e)
            | OtaError::Partition(e)
            | OtaError::Timer(e) => write!(f, "{}: {:#}", self.code(), e),
            OtaError::Apply(msg) => write!(f, "{}: {}", self.code(), msg),
        }
    }
}

impl StdError for OtaError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            OtaError::Transport(e)
            | OtaError::Storage(e)
            | OtaError::Partition(e)
            | OtaError::Timer(e) => Some(&**e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code() {
        let err = OtaError::InvalidState("fetch already in progress");
        assert_eq!(err.to_string(), "INVALID_STATE: fetch already in progress");

        let err = OtaError::Cloud { code: 42, description: "bad node".into() };
        assert_eq!(err.to_string(), "CLOUD: error 42 (bad node)");
    }

    #[test]
    fn wrapped_errors_expose_source() {
        let err = OtaError::Transport(anyhow::anyhow!("connection reset"));
        assert!(err.source().is_some());
        assert!(err.to_string().contains("connection reset"));
        assert!(OtaError::OutOfMemory.source().is_none());
    }
}
