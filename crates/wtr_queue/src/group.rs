use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::test_spec::{SubsuiteName, Test, TestKey, TestType};

/// Position of a group in the queue it was dequeued from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct GroupId(pub usize);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

/// Free-form context shared by every test in a group.
///
/// Only the manager that dequeued the group, and the worker it drives, ever touch a group's
/// metadata, and never concurrently.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct GroupMetadata(Map<String, Value>);

impl GroupMetadata {
    pub const SCOPE: &'static str = "scope";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scope(scope: impl Into<String>) -> Self {
        let mut metadata = Self::new();
        metadata.insert(Self::SCOPE, Value::String(scope.into()));
        metadata
    }

    /// Path prefix shared by the group's tests, if the grouping policy recorded one.
    pub fn scope(&self) -> Option<&str> {
        self.0.get(Self::SCOPE).and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Bumps an integer counter, treating a missing or non-integer entry as zero.
    pub fn increment(&mut self, key: &str) -> u64 {
        let next = self.counter(key) + 1;
        self.0.insert(key.to_owned(), Value::from(next));
        next
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.0.get(key).and_then(Value::as_u64).unwrap_or(0)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// Tests that run back to back on one browser, in order.
#[derive(Debug, Clone)]
pub struct TestGroup {
    /// Assigned when the group is written to a queue.
    pub id: GroupId,
    pub subsuite: SubsuiteName,
    pub test_type: TestType,
    pub tests: VecDeque<Arc<Test>>,
    pub metadata: GroupMetadata,
}

impl TestGroup {
    pub fn new(key: TestKey, tests: impl IntoIterator<Item = Arc<Test>>, metadata: GroupMetadata) -> Self {
        Self {
            id: GroupId(0),
            subsuite: key.subsuite,
            test_type: key.test_type,
            tests: tests.into_iter().collect(),
            metadata,
        }
    }

    pub fn key(&self) -> TestKey {
        TestKey::new(self.subsuite.clone(), self.test_type)
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Sum of the group's test timeouts; a proxy for how long the group takes to run.
    pub fn total_timeout(&self) -> Duration {
        self.tests.iter().map(|test| test.timeout).sum()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::{GroupMetadata, TestGroup};
    use crate::test_spec::{Test, TestKey, TestType};

    #[test]
    fn counters_start_at_zero() {
        let mut metadata = GroupMetadata::with_scope("/dom");
        assert_eq!(metadata.counter("url_count"), 0);
        assert_eq!(metadata.increment("url_count"), 1);
        assert_eq!(metadata.increment("url_count"), 2);
        assert_eq!(metadata.scope(), Some("/dom"));
        assert_eq!(
            serde_json::to_value(&metadata).unwrap(),
            json!({"scope": "/dom", "url_count": 2})
        );
    }

    #[test]
    fn non_integer_counter_restarts() {
        let mut metadata = GroupMetadata::new();
        metadata.insert("url_count", json!("many"));
        assert_eq!(metadata.increment("url_count"), 1);
    }

    #[test]
    fn total_timeout_sums_tests() {
        let tests = [1, 2, 3].map(|secs| {
            Arc::new(Test::new(
                format!("/a/{secs}.html"),
                TestType::Testharness,
                Duration::from_secs(secs),
            ))
        });
        let group = TestGroup::new(
            TestKey::new("", TestType::Testharness),
            tests,
            GroupMetadata::new(),
        );
        assert_eq!(group.total_timeout(), Duration::from_secs(6));
        assert_eq!(group.len(), 3);
    }
}
