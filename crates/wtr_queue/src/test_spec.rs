use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::status::{Expectation, Status};

/// Identifies a test within a run. For web tests this is the test's URL.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TestId(String);

impl TestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TestId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A named partition of a run with its own configuration. The default subsuite is empty.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SubsuiteName(String);

impl SubsuiteName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubsuiteName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubsuiteName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum TestType {
    Testharness,
    Reftest,
    PrintReftest,
    Wdspec,
    Crashtest,
}

impl TestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::Testharness => "testharness",
            TestType::Reftest => "reftest",
            TestType::PrintReftest => "print-reftest",
            TestType::Wdspec => "wdspec",
            TestType::Crashtest => "crashtest",
        }
    }

    /// Status a passing test of this type finishes with.
    pub fn pass_status(&self) -> Status {
        match self {
            TestType::Testharness | TestType::Wdspec => Status::Ok,
            TestType::Reftest | TestType::PrintReftest | TestType::Crashtest => Status::Pass,
        }
    }
}

impl std::fmt::Display for TestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `(subsuite, test type)` pair tests are bucketed, configured and reported by.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestKey {
    pub subsuite: SubsuiteName,
    pub test_type: TestType,
}

impl TestKey {
    pub fn new(subsuite: impl Into<SubsuiteName>, test_type: TestType) -> Self {
        Self {
            subsuite: subsuite.into(),
            test_type,
        }
    }
}

/// A single unit of work. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Test {
    pub id: TestId,
    /// URL the test is loaded from, relative to the test server root.
    pub url: String,
    pub test_type: TestType,
    pub timeout: Duration,
    pub expected: Expectation,
    pub subtest_expectations: BTreeMap<String, Expectation>,
    /// Always give the next test a fresh browser.
    pub restart_after: bool,
}

impl Test {
    /// A test that is expected to pass, loaded from its own id.
    pub fn new(id: impl Into<String>, test_type: TestType, timeout: Duration) -> Self {
        let id = id.into();
        Self {
            url: id.clone(),
            id: TestId(id),
            test_type,
            timeout,
            expected: Expectation::new(test_type.pass_status()),
            subtest_expectations: BTreeMap::new(),
            restart_after: false,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_expected(mut self, expected: Expectation) -> Self {
        self.expected = expected;
        self
    }

    pub fn with_subtest_expected(mut self, name: impl Into<String>, expected: Expectation) -> Self {
        self.subtest_expectations.insert(name.into(), expected);
        self
    }

    pub fn with_restart_after(mut self, restart_after: bool) -> Self {
        self.restart_after = restart_after;
        self
    }

    /// Expectation for a named subtest. Subtests without metadata are expected to pass.
    pub fn subtest_expected(&self, name: &str) -> Expectation {
        self.subtest_expectations
            .get(name)
            .cloned()
            .unwrap_or_else(|| Expectation::new(Status::Pass))
    }

    /// Directory components of the test's URL path, outermost first.
    ///
    /// Query and fragment are ignored, as is the file name.
    pub fn url_dirs(&self) -> Vec<&str> {
        let path = self
            .url
            .split(|c: char| c == '?' || c == '#')
            .next()
            .unwrap_or_default();
        let mut parts: Vec<&str> = path.split('/').collect();
        // Leading slash yields an empty first segment; the last segment is the file.
        parts.pop();
        if parts.first().map_or(false, |first| first.is_empty()) {
            parts.remove(0);
        }
        parts
    }
}

/// Tests of a run, bucketed by subsuite and test type, each bucket in manifest order.
pub type TestsByType = BTreeMap<TestKey, Vec<Arc<Test>>>;

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{Test, TestType};
    use crate::status::Status;

    #[test]
    fn url_dirs_drop_file_query_and_fragment() {
        let test = Test::new(
            "/dom/nodes/Node-cloneNode.html?variant=1#frag",
            TestType::Testharness,
            Duration::from_secs(10),
        );
        assert_eq!(test.url_dirs(), vec!["dom", "nodes"]);
    }

    #[test]
    fn top_level_test_has_no_dirs() {
        let test = Test::new("/index.html", TestType::Reftest, Duration::from_secs(10));
        assert!(test.url_dirs().is_empty());
    }

    #[test]
    fn default_expectations() {
        let test = Test::new("/a/b.html", TestType::Testharness, Duration::from_secs(10));
        assert_eq!(test.expected.status, Status::Ok);
        assert_eq!(test.subtest_expected("anything").status, Status::Pass);

        let test = Test::new("/a/b.html", TestType::Crashtest, Duration::from_secs(10));
        assert_eq!(test.expected.status, Status::Pass);
    }
}
