//! Partitioning tests into groups, and groups into a queue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::group::{GroupMetadata, TestGroup};
use crate::hash::bucket_of;
use crate::queue::{ReadQueue, WriteQueue};
use crate::test_spec::{Test, TestId, TestKey, TestsByType};

pub const DEFAULT_SMALL_SUBSUITE_SIZE: usize = 10;

fn default_small_subsuite_size() -> usize {
    DEFAULT_SMALL_SUBSUITE_SIZE
}

/// How tests are grouped, as configured.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum GroupPolicy {
    /// Spread tests over one group per process by the hash of their id.
    #[default]
    SingleTestSource,
    /// Group consecutive tests sharing a directory prefix.
    PathGrouped {
        /// Number of leading directories that must match. `None` compares full directories.
        #[serde(default)]
        depth: Option<usize>,
        /// Subsuites with fewer tests than this run as a single group.
        #[serde(default = "default_small_subsuite_size")]
        small_subsuite_size: usize,
    },
    /// Every test is its own group.
    FullyParallel,
    /// Groups listed in a JSON file of `{"group name": ["test id", ...]}`.
    GroupFile { path: PathBuf },
}

/// An externally supplied assignment of tests to named groups, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupFile {
    groups: Vec<(String, Vec<TestId>)>,
}

impl GroupFile {
    pub fn new(groups: Vec<(String, Vec<TestId>)>) -> Self {
        Self { groups }
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        // Object keys keep their file order; see the `preserve_order` feature of serde_json.
        let groups: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)?;
        let groups = groups
            .into_iter()
            .map(|(name, ids)| Ok((name, serde_json::from_value(ids)?)))
            .collect::<Result<_, serde_json::Error>>()?;
        Ok(Self { groups })
    }

    pub fn from_json_path(path: &Path) -> Result<Self, QueueError> {
        let json = std::fs::read_to_string(path).map_err(|source| QueueError::GroupFileIo {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json_str(&json).map_err(|source| QueueError::GroupFileParse {
            path: path.to_owned(),
            source,
        })
    }

    fn group_of_test(&self) -> HashMap<&TestId, usize> {
        self.groups
            .iter()
            .enumerate()
            .flat_map(|(i, (_, ids))| ids.iter().map(move |id| (id, i)))
            .collect()
    }
}

/// The grouping policy with every external input loaded.
#[derive(Debug, Clone)]
enum Grouping {
    SingleTestSource,
    PathGrouped {
        depth: Option<usize>,
        small_subsuite_size: usize,
    },
    FullyParallel,
    GroupFile(GroupFile),
}

/// Builds the queue of test groups for a run.
#[derive(Debug, Clone)]
pub struct TestQueueBuilder {
    grouping: Grouping,
    processes: usize,
}

impl TestQueueBuilder {
    /// Builds from a configured policy, reading the group file if there is one.
    pub fn from_policy(policy: &GroupPolicy, processes: usize) -> Result<Self, QueueError> {
        let grouping = match policy {
            GroupPolicy::SingleTestSource => Grouping::SingleTestSource,
            GroupPolicy::PathGrouped {
                depth,
                small_subsuite_size,
            } => Grouping::PathGrouped {
                depth: *depth,
                small_subsuite_size: *small_subsuite_size,
            },
            GroupPolicy::FullyParallel => Grouping::FullyParallel,
            GroupPolicy::GroupFile { path } => Grouping::GroupFile(GroupFile::from_json_path(path)?),
        };
        Ok(Self {
            grouping,
            processes,
        })
    }

    pub fn single_test_source(processes: usize) -> Self {
        Self {
            grouping: Grouping::SingleTestSource,
            processes,
        }
    }

    pub fn path_grouped(processes: usize, depth: Option<usize>, small_subsuite_size: usize) -> Self {
        Self {
            grouping: Grouping::PathGrouped {
                depth,
                small_subsuite_size,
            },
            processes,
        }
    }

    pub fn fully_parallel(processes: usize) -> Self {
        Self {
            grouping: Grouping::FullyParallel,
            processes,
        }
    }

    pub fn group_file(processes: usize, groups: GroupFile) -> Self {
        Self {
            grouping: Grouping::GroupFile(groups),
            processes,
        }
    }

    pub fn processes(&self) -> usize {
        self.processes
    }

    /// Partitions `tests` into groups. Deterministic for the same input and policy.
    pub fn make_groups(&self, tests: &TestsByType) -> Result<Vec<TestGroup>, QueueError> {
        let groups = match &self.grouping {
            Grouping::SingleTestSource => single_test_source_groups(tests, self.processes),
            Grouping::PathGrouped {
                depth,
                small_subsuite_size,
            } => path_groups(tests, *depth, *small_subsuite_size),
            Grouping::FullyParallel => fully_parallel_groups(tests),
            Grouping::GroupFile(group_file) => group_file_groups(tests, group_file)?,
        };
        Ok(groups)
    }

    /// Builds the queue for `tests`, along with the number of managers that should consume it.
    ///
    /// The worker count never exceeds the number of groups or the requested processes, and is
    /// at least one. When several workers share the queue, the groups that take longest are
    /// handed out first, so that no single straggler group starts last.
    pub fn make_queue(&self, tests: &TestsByType) -> Result<(ReadQueue, usize), QueueError> {
        let mut groups = self.make_groups(tests)?;
        let worker_count = worker_count(self.processes, groups.len());

        if worker_count > 1 {
            sort_for_scheduling(&mut groups);
        }

        tracing::debug!(
            num_groups = groups.len(),
            worker_count,
            "built test group queue"
        );

        let mut queue = WriteQueue::new();
        queue.extend(groups);
        Ok((queue.to_read(), worker_count))
    }
}

pub fn worker_count(processes: usize, num_groups: usize) -> usize {
    processes.min(num_groups).max(1)
}

/// Sorts groups descending by subsuite, then test type, then total timeout.
/// Stable, so equal groups keep the order they were built in.
fn sort_for_scheduling(groups: &mut [TestGroup]) {
    groups.sort_by(|a, b| {
        let a_key = (a.subsuite.as_str(), a.test_type.as_str(), a.total_timeout());
        let b_key = (b.subsuite.as_str(), b.test_type.as_str(), b.total_timeout());
        b_key.cmp(&a_key)
    });
}

fn single_test_source_groups(tests: &TestsByType, processes: usize) -> Vec<TestGroup> {
    let num_buckets = processes.max(1);
    let mut groups = vec![];
    for (key, tests) in tests {
        let mut buckets: Vec<Vec<Arc<Test>>> = vec![vec![]; num_buckets];
        for test in tests {
            buckets[bucket_of(test.id.as_str(), num_buckets)].push(Arc::clone(test));
        }
        groups.extend(
            buckets
                .into_iter()
                .filter(|bucket| !bucket.is_empty())
                .map(|bucket| TestGroup::new(key.clone(), bucket, GroupMetadata::new())),
        );
    }
    groups
}

fn scope_of(dirs: &[&str]) -> String {
    format!("/{}", dirs.join("/"))
}

fn path_groups(
    tests: &TestsByType,
    depth: Option<usize>,
    small_subsuite_size: usize,
) -> Vec<TestGroup> {
    let mut groups = vec![];
    for (key, tests) in tests {
        if tests.is_empty() {
            continue;
        }
        if tests.len() < small_subsuite_size {
            groups.push(TestGroup::new(
                key.clone(),
                tests.iter().cloned(),
                GroupMetadata::with_scope("/"),
            ));
            continue;
        }

        let mut current: Option<(Vec<&str>, Vec<Arc<Test>>)> = None;
        for test in tests {
            let mut dirs = test.url_dirs();
            if let Some(depth) = depth {
                dirs.truncate(depth);
            }
            if let Some((prefix, group)) = current.as_mut() {
                if *prefix == dirs {
                    group.push(Arc::clone(test));
                    continue;
                }
            }
            if let Some((prefix, group)) = current.replace((dirs, vec![Arc::clone(test)])) {
                groups.push(TestGroup::new(
                    key.clone(),
                    group,
                    GroupMetadata::with_scope(scope_of(&prefix)),
                ));
            }
        }
        if let Some((prefix, group)) = current {
            groups.push(TestGroup::new(
                key.clone(),
                group,
                GroupMetadata::with_scope(scope_of(&prefix)),
            ));
        }
    }
    groups
}

fn fully_parallel_groups(tests: &TestsByType) -> Vec<TestGroup> {
    tests
        .iter()
        .flat_map(|(key, tests)| {
            tests.iter().map(move |test| {
                TestGroup::new(
                    key.clone(),
                    [Arc::clone(test)],
                    GroupMetadata::with_scope(test.id.as_str()),
                )
            })
        })
        .collect()
}

fn group_file_groups(
    tests: &TestsByType,
    group_file: &GroupFile,
) -> Result<Vec<TestGroup>, QueueError> {
    let group_of_test = group_file.group_of_test();
    let mut groups = vec![];
    for (key, tests) in tests {
        let mut by_group: Vec<Vec<Arc<Test>>> = vec![vec![]; group_file.groups.len()];
        for test in tests {
            let group = group_of_test
                .get(&test.id)
                .ok_or_else(|| QueueError::UngroupedTest(test.id.clone()))?;
            by_group[*group].push(Arc::clone(test));
        }
        for (i, tests) in by_group.into_iter().enumerate() {
            if tests.is_empty() {
                continue;
            }
            let (name, _) = &group_file.groups[i];
            groups.push(TestGroup::new(
                key.clone(),
                tests,
                GroupMetadata::with_scope(name.as_str()),
            ));
        }
    }
    Ok(groups)
}

#[cfg(test)]
mod test {
    use std::collections::{BTreeMap, BTreeSet};
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    use indoc::indoc;
    use proptest::prelude::*;

    use super::{worker_count, GroupFile, GroupPolicy, TestQueueBuilder};
    use crate::error::QueueError;
    use crate::group::TestGroup;
    use crate::test_spec::{Test, TestId, TestKey, TestType, TestsByType};

    fn test(id: &str, secs: u64) -> Arc<Test> {
        Arc::new(Test::new(id, TestType::Testharness, Duration::from_secs(secs)))
    }

    fn testharness(ids: &[&str]) -> TestsByType {
        BTreeMap::from([(
            TestKey::new("", TestType::Testharness),
            ids.iter().map(|id| test(id, 10)).collect(),
        )])
    }

    fn group_ids(group: &TestGroup) -> Vec<&str> {
        group.tests.iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn single_test_source_makes_one_group_per_nonempty_bucket() {
        let ids: Vec<String> = (0..40).map(|i| format!("/t/{i}.html")).collect();
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        let groups = TestQueueBuilder::single_test_source(4)
            .make_groups(&testharness(&ids))
            .unwrap();

        assert!(!groups.is_empty() && groups.len() <= 4);
        assert!(groups.iter().all(|g| !g.is_empty()));
        assert_eq!(groups.iter().map(TestGroup::len).sum::<usize>(), 40);
    }

    #[test]
    fn single_test_source_is_deterministic() {
        let tests = testharness(&["/a.html", "/b.html", "/c.html", "/d.html", "/e.html"]);
        let builder = TestQueueBuilder::single_test_source(3);
        let first: Vec<Vec<String>> = builder
            .make_groups(&tests)
            .unwrap()
            .iter()
            .map(|g| group_ids(g).into_iter().map(String::from).collect())
            .collect();
        let second: Vec<Vec<String>> = builder
            .make_groups(&tests)
            .unwrap()
            .iter()
            .map(|g| group_ids(g).into_iter().map(String::from).collect())
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn path_grouped_splits_on_directory_change() {
        let tests = testharness(&[
            "/dom/a/1.html",
            "/dom/a/2.html",
            "/dom/b/3.html",
            "/css/4.html",
            "/dom/a/5.html",
        ]);
        let groups = TestQueueBuilder::path_grouped(1, None, 0)
            .make_groups(&tests)
            .unwrap();

        let ids: Vec<_> = groups.iter().map(group_ids).collect();
        assert_eq!(
            ids,
            vec![
                vec!["/dom/a/1.html", "/dom/a/2.html"],
                vec!["/dom/b/3.html"],
                vec!["/css/4.html"],
                vec!["/dom/a/5.html"],
            ]
        );
        let scopes: Vec<_> = groups.iter().map(|g| g.metadata.scope().unwrap()).collect();
        assert_eq!(scopes, vec!["/dom/a", "/dom/b", "/css", "/dom/a"]);
    }

    #[test]
    fn path_grouped_respects_depth() {
        let tests = testharness(&["/dom/a/1.html", "/dom/b/2.html", "/css/3.html"]);
        let groups = TestQueueBuilder::path_grouped(1, Some(1), 0)
            .make_groups(&tests)
            .unwrap();
        let ids: Vec<_> = groups.iter().map(group_ids).collect();
        assert_eq!(
            ids,
            vec![vec!["/dom/a/1.html", "/dom/b/2.html"], vec!["/css/3.html"]]
        );
    }

    #[test]
    fn small_subsuite_collapses_into_one_group() {
        let mut tests = testharness(&["/x/1.html", "/y/2.html", "/z/3.html"]);
        tests.insert(
            TestKey::new("big", TestType::Testharness),
            (0..4).map(|i| test(&format!("/d{i}/t.html"), 10)).collect(),
        );

        let groups = TestQueueBuilder::path_grouped(1, None, 4)
            .make_groups(&tests)
            .unwrap();
        let small: Vec<_> = groups.iter().filter(|g| g.subsuite.as_str().is_empty()).collect();
        let big: Vec<_> = groups.iter().filter(|g| g.subsuite.as_str() == "big").collect();
        assert_eq!(small.len(), 1);
        assert_eq!(small[0].len(), 3);
        assert_eq!(big.len(), 4);
    }

    #[test]
    fn fully_parallel_isolates_every_test() {
        let groups = TestQueueBuilder::fully_parallel(8)
            .make_groups(&testharness(&["/a.html", "/b.html", "/c.html"]))
            .unwrap();
        assert_eq!(groups.len(), 3);
        assert!(groups.iter().all(|g| g.len() == 1));
    }

    #[test]
    fn group_file_assigns_named_groups() {
        let group_file = GroupFile::from_json_str(indoc! {r#"
            {
                "zeta": ["/b.html", "/c.html"],
                "alpha": ["/a.html"]
            }
        "#})
        .unwrap();
        let groups = TestQueueBuilder::group_file(2, group_file)
            .make_groups(&testharness(&["/a.html", "/b.html", "/c.html"]))
            .unwrap();

        let scopes: Vec<_> = groups.iter().map(|g| g.metadata.scope().unwrap()).collect();
        assert_eq!(scopes, vec!["zeta", "alpha"]);
        assert_eq!(group_ids(&groups[0]), vec!["/b.html", "/c.html"]);
        assert_eq!(group_ids(&groups[1]), vec!["/a.html"]);
    }

    #[test]
    fn group_file_rejects_ungrouped_test() {
        let group_file = GroupFile::new(vec![("only".to_owned(), vec![TestId::new("/a.html")])]);
        let err = TestQueueBuilder::group_file(1, group_file)
            .make_groups(&testharness(&["/a.html", "/missing.html"]))
            .unwrap_err();
        assert!(matches!(err, QueueError::UngroupedTest(id) if id.as_str() == "/missing.html"));
    }

    #[test]
    fn group_file_policy_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"g": ["/a.html"]}}"#).unwrap();

        let policy = GroupPolicy::GroupFile {
            path: file.path().to_owned(),
        };
        let groups = TestQueueBuilder::from_policy(&policy, 1)
            .unwrap()
            .make_groups(&testharness(&["/a.html"]))
            .unwrap();
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn missing_group_file_fails_to_load() {
        let policy = GroupPolicy::GroupFile {
            path: "/definitely/not/a/group/file.json".into(),
        };
        assert!(matches!(
            TestQueueBuilder::from_policy(&policy, 1),
            Err(QueueError::GroupFileIo { .. })
        ));
    }

    #[test]
    fn worker_count_is_never_zero() {
        assert_eq!(worker_count(0, 5), 1);
        assert_eq!(worker_count(8, 3), 3);
        assert_eq!(worker_count(2, 3), 2);
        assert_eq!(worker_count(4, 0), 1);
    }

    #[test]
    fn single_process_queue_keeps_build_order() {
        let tests = testharness(&["/a/1.html", "/b/2.html", "/c/3.html"]);
        let (queue, workers) = TestQueueBuilder::fully_parallel(1).make_queue(&tests).unwrap();
        assert_eq!(workers, 1);
        let ids: Vec<_> = queue
            .drain()
            .iter()
            .map(|g| g.tests[0].id.as_str().to_owned())
            .collect();
        assert_eq!(ids, vec!["/a/1.html", "/b/2.html", "/c/3.html"]);
    }

    fn arb_tests() -> impl Strategy<Value = TestsByType> {
        let subsuite = prop::sample::select(vec!["", "sub1", "sub2"]);
        let test_type = prop::sample::select(vec![
            TestType::Testharness,
            TestType::Reftest,
            TestType::Crashtest,
        ]);
        let key = (subsuite, test_type)
            .prop_map(|(subsuite, test_type)| TestKey::new(subsuite, test_type));
        let test = (0..4usize, 0..1000u32, 1..60u64);
        prop::collection::btree_map(key, prop::collection::vec(test, 1..30), 1..6).prop_map(
            |buckets| {
                let mut n = 0;
                buckets
                    .into_iter()
                    .map(|(key, tests)| {
                        let tests: Vec<Arc<Test>> = tests
                            .into_iter()
                            .map(|(dir, file, secs)| {
                                n += 1;
                                // `n` keeps ids unique across the run.
                                Arc::new(Test::new(
                                    format!("/d{dir}/f{file}-{n}.html"),
                                    key.test_type,
                                    Duration::from_secs(secs),
                                ))
                            })
                            .collect();
                        (key, tests)
                    })
                    .collect::<TestsByType>()
            },
        )
    }

    fn arb_builder() -> impl Strategy<Value = TestQueueBuilder> {
        (0..8usize, 0..4u8).prop_map(|(processes, policy)| match policy {
            0 => TestQueueBuilder::single_test_source(processes),
            1 => TestQueueBuilder::path_grouped(processes, None, 5),
            2 => TestQueueBuilder::path_grouped(processes, Some(1), 0),
            _ => TestQueueBuilder::fully_parallel(processes),
        })
    }

    proptest! {
        #[test]
        fn every_test_is_delivered_exactly_once(tests in arb_tests(), builder in arb_builder()) {
            let (queue, _) = builder.make_queue(&tests).unwrap();
            let mut seen = BTreeSet::new();
            for group in queue.drain() {
                for test in &group.tests {
                    prop_assert!(seen.insert(test.id.clone()), "{} delivered twice", test.id);
                    prop_assert_eq!(test.test_type, group.test_type);
                }
            }
            let all: BTreeSet<_> = tests.values().flatten().map(|t| t.id.clone()).collect();
            prop_assert_eq!(seen, all);
        }

        #[test]
        fn worker_count_is_bounded(tests in arb_tests(), builder in arb_builder()) {
            let num_groups = builder.make_groups(&tests).unwrap().len();
            let (queue, workers) = builder.make_queue(&tests).unwrap();
            prop_assert_eq!(queue.len(), num_groups);
            prop_assert!(workers >= 1);
            prop_assert!(workers <= num_groups.max(1));
            prop_assert!(workers <= builder.processes().max(1));
        }

        #[test]
        fn groups_are_dequeued_largest_first(tests in arb_tests(), builder in arb_builder()) {
            let (queue, workers) = builder.make_queue(&tests).unwrap();
            prop_assume!(workers > 1);

            let keys: Vec<_> = queue
                .drain()
                .iter()
                .map(|g| (g.subsuite.as_str().to_owned(), g.test_type.as_str(), g.total_timeout()))
                .collect();
            for pair in keys.windows(2) {
                prop_assert!(pair[0] >= pair[1], "{:?} before {:?}", pair[0], pair[1]);
            }
        }
    }
}
