use serde_derive::{Deserialize, Serialize};

/// Outcome of a test or subtest.
///
/// `EXTERNAL-TIMEOUT` and `INTERNAL-ERROR` are produced by the harness itself. They drive
/// restart decisions but are never reported under those names; see [Status::sanitized].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "EXTERNAL-TIMEOUT")]
    ExternalTimeout,
    #[serde(rename = "CRASH")]
    Crash,
    #[serde(rename = "INTERNAL-ERROR")]
    InternalError,
    #[serde(rename = "PRECONDITION_FAILED")]
    PreconditionFailed,
    #[serde(rename = "NOTRUN")]
    Notrun,
    #[serde(rename = "SKIP")]
    Skip,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Pass => "PASS",
            Status::Fail => "FAIL",
            Status::Error => "ERROR",
            Status::Timeout => "TIMEOUT",
            Status::ExternalTimeout => "EXTERNAL-TIMEOUT",
            Status::Crash => "CRASH",
            Status::InternalError => "INTERNAL-ERROR",
            Status::PreconditionFailed => "PRECONDITION_FAILED",
            Status::Notrun => "NOTRUN",
            Status::Skip => "SKIP",
        }
    }

    /// The status as it may be shown to users.
    pub fn sanitized(self) -> Self {
        match self {
            Status::InternalError => Status::Error,
            Status::ExternalTimeout => Status::Timeout,
            status => status,
        }
    }

    /// Whether a test finishing with this status leaves the browser in a state that must not
    /// be reused.
    pub fn forces_restart(self) -> bool {
        matches!(
            self,
            Status::Crash | Status::ExternalTimeout | Status::InternalError
        )
    }

    pub fn is_pass(self) -> bool {
        matches!(self, Status::Ok | Status::Pass)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a test or subtest is expected to produce.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    pub status: Status,
    /// Alternate statuses tolerated without being flagged as unexpected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub known_intermittent: Vec<Status>,
}

impl Expectation {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            known_intermittent: vec![],
        }
    }

    pub fn with_intermittent(mut self, status: Status) -> Self {
        self.known_intermittent.push(status);
        self
    }

    /// Whether `actual` matches this expectation.
    pub fn admits(&self, actual: Status) -> bool {
        actual == self.status || self.known_intermittent.contains(&actual)
    }
}
