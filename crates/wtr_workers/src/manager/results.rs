//! Interpreting a finished test's results.

use wtr_queue::{Status, TestType};

use crate::results::{HarnessResult, SubtestResult};

/// What a crash check does to a reported status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashVerdict {
    /// No crash was found, or the status already says so.
    Unchanged,
    /// The status becomes `CRASH`.
    Reclassified,
    /// A crash was found but the status is left alone for this test type.
    Ignored,
}

/// Decides whether a test that the browser reports as crashed should be recorded as `CRASH`.
///
/// Only crashtests, wdspec tests and tests the harness already timed out are reclassified;
/// changing the status of other test types causes instability.
pub fn crash_verdict(test_type: TestType, status: Status, crashed: bool) -> CrashVerdict {
    if !crashed || status == Status::Crash {
        return CrashVerdict::Unchanged;
    }
    match test_type {
        TestType::Crashtest | TestType::Wdspec => CrashVerdict::Reclassified,
        _ if status == Status::ExternalTimeout => CrashVerdict::Reclassified,
        _ => CrashVerdict::Ignored,
    }
}

/// Summary of the subtests of one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubtestSummary {
    pub any_unexpected: bool,
    /// False if any unexpected subtest result is not a pass.
    pub all_unexpected_pass: bool,
}

impl Default for SubtestSummary {
    fn default() -> Self {
        Self {
            any_unexpected: false,
            all_unexpected_pass: true,
        }
    }
}

impl SubtestSummary {
    pub fn add(&mut self, subtest: &SubtestResult) {
        if !subtest.is_unexpected() {
            return;
        }
        self.any_unexpected = true;
        // Anything against an expected NOTRUN counts as an unexpected pass.
        let expected_notrun = subtest.expected.admits(Status::Notrun);
        if subtest.status != Status::Pass && !expected_notrun {
            self.all_unexpected_pass = false;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unexpected {
    No,
    Pass,
    Fail,
}

/// Classifies a test whose harness result has already been sanitized.
///
/// A test passes unexpectedly when something about it was unexpected, the harness status is a
/// pass or expected, and every unexpected subtest passed.
pub fn classify(harness: &HarnessResult, subtests: SubtestSummary) -> Unexpected {
    let harness_unexpected = harness.is_unexpected();
    if !harness_unexpected && !subtests.any_unexpected {
        return Unexpected::No;
    }
    let pass_or_expected = harness.status.is_pass() || !harness_unexpected;
    if pass_or_expected && subtests.all_unexpected_pass {
        Unexpected::Pass
    } else {
        Unexpected::Fail
    }
}
