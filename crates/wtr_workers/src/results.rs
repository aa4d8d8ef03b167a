//! Results of running a test.

use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};
use wtr_queue::{Expectation, Status, Test};

/// Result of a test as a whole.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HarnessResult {
    pub status: Status,
    pub message: Option<String>,
    pub expected: Expectation,
    /// Free-form data from the executor, passed through to the logger.
    #[serde(default)]
    pub extra: Map<String, Value>,
    pub stack: Option<String>,
}

impl HarnessResult {
    /// A result for `test`, carrying the test's own expectation.
    pub fn for_test(test: &Test, status: Status) -> Self {
        Self {
            status,
            message: None,
            expected: test.expected.clone(),
            extra: Map::new(),
            stack: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn is_unexpected(&self) -> bool {
        !self.expected.admits(self.status)
    }
}

/// Result of one named subtest of a test.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SubtestResult {
    pub name: String,
    pub status: Status,
    pub message: Option<String>,
    pub expected: Expectation,
    pub stack: Option<String>,
}

impl SubtestResult {
    pub fn for_test(test: &Test, name: impl Into<String>, status: Status) -> Self {
        let name = name.into();
        Self {
            expected: test.subtest_expected(&name),
            name,
            status,
            message: None,
            stack: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_unexpected(&self) -> bool {
        !self.expected.admits(self.status)
    }
}

/// Everything an executor reports for one run of a test.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub harness: HarnessResult,
    pub subtests: Vec<SubtestResult>,
}

impl TestOutcome {
    pub fn new(harness: HarnessResult) -> Self {
        Self {
            harness,
            subtests: vec![],
        }
    }

    pub fn with_subtests(harness: HarnessResult, subtests: Vec<SubtestResult>) -> Self {
        Self { harness, subtests }
    }
}
