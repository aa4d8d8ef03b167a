//! In-process fakes of the browser, executor and logger seams, for driving workers and managers
//! in tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Map;
use wtr_queue::{GroupMetadata, Status, SubsuiteName, Test, TestId, TestType, TestsByType};
use wtr_workers::executor::{
    Browser, BrowserFactory, BrowserSettings, Executor, ExecutorBrowser, ExecutorFactory, Kwargs,
    Protocol,
};
use wtr_workers::logger::{LogLevel, StructuredLogger};
use wtr_workers::results::{HarnessResult, SubtestResult, TestOutcome};

const ORDERING: Ordering = Ordering::SeqCst;

pub const DEFAULT_PROTOCOL: &str = "fake";

/// How the fake executor behaves for one run of a test.
#[derive(Debug, Clone)]
pub enum TestScript {
    Status(Status),
    Subtests(Status, Vec<(String, Status)>),
    /// `run_test` returns an error.
    ExecutorError,
    /// `run_test` panics.
    Panic,
    /// The worker thread dies outright, without reporting anything.
    KillWorker,
    /// Sleeps, then passes.
    Hang(Duration),
    /// Blocks until the signal is raised, as a test talking to a hung browser does until the
    /// browser is killed; then fails with an executor error. See [FakeBrowserFactory::stop_signal].
    UntilBrowserStops(Arc<AtomicBool>),
}

/// Panic payload that panics again when dropped, taking the worker thread down with it.
struct WorkerKiller;

impl Drop for WorkerKiller {
    fn drop(&mut self) {
        panic!("worker killed");
    }
}

#[derive(Default)]
struct ExecutorState {
    scripts: Mutex<HashMap<TestId, Vec<TestScript>>>,
    runs: Mutex<Vec<TestId>>,
    failing_setups: AtomicUsize,
    wait_reruns: AtomicUsize,
    setups: AtomicUsize,
    handovers: AtomicUsize,
    resets: AtomicUsize,
    waits: AtomicUsize,
}

impl ExecutorState {
    fn script_for(&self, test: &TestId, run: usize) -> Option<TestScript> {
        let scripts = self.scripts.lock();
        let runs = scripts.get(test)?;
        runs.get(run).or_else(|| runs.last()).cloned()
    }
}

/// Builds [FakeExecutor]s. Clones share their scripts and counters.
#[derive(Clone)]
pub struct FakeExecutorFactory {
    name: String,
    protocol: String,
    extra_timeout: Duration,
    state: Arc<ExecutorState>,
}

impl Default for FakeExecutorFactory {
    fn default() -> Self {
        Self::named("fake-executor")
    }
}

impl FakeExecutorFactory {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            protocol: DEFAULT_PROTOCOL.to_owned(),
            extra_timeout: Duration::ZERO,
            state: Default::default(),
        }
    }

    pub fn protocol(mut self, kind: &str) -> Self {
        self.protocol = kind.to_owned();
        self
    }

    pub fn extra_timeout(mut self, extra: Duration) -> Self {
        self.extra_timeout = extra;
        self
    }

    /// Scripts every run of `test`.
    pub fn script(self, test: &str, script: TestScript) -> Self {
        self.script_runs(test, vec![script])
    }

    /// Scripts consecutive runs of `test`; the last script repeats.
    pub fn script_runs(self, test: &str, scripts: Vec<TestScript>) -> Self {
        self.state.scripts.lock().insert(TestId::from(test), scripts);
        self
    }

    pub fn fail_setup(self) -> Self {
        self.state.failing_setups.store(usize::MAX, ORDERING);
        self
    }

    pub fn rerun_after_wait(self, rerun: bool) -> Self {
        self.wait_reruns(if rerun { usize::MAX } else { 0 })
    }

    /// The first `n` waits ask for the test to be rerun.
    pub fn wait_reruns(self, n: usize) -> Self {
        self.state.wait_reruns.store(n, ORDERING);
        self
    }

    /// Tests run so far, in order.
    pub fn runs(&self) -> Vec<TestId> {
        self.state.runs.lock().clone()
    }

    pub fn runs_of(&self, test: &str) -> usize {
        self.state
            .runs
            .lock()
            .iter()
            .filter(|id| id.as_str() == test)
            .count()
    }

    pub fn setups(&self) -> usize {
        self.state.setups.load(ORDERING)
    }

    /// Setups that took over a protocol from a previous executor.
    pub fn handovers(&self) -> usize {
        self.state.handovers.load(ORDERING)
    }

    pub fn resets(&self) -> usize {
        self.state.resets.load(ORDERING)
    }

    pub fn waits(&self) -> usize {
        self.state.waits.load(ORDERING)
    }
}

impl ExecutorFactory for FakeExecutorFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self, _browser: &ExecutorBrowser, _kwargs: &Kwargs) -> anyhow::Result<Box<dyn Executor>> {
        Ok(Box::new(FakeExecutor {
            protocol_kind: self.protocol.clone(),
            protocol: None,
            state: Arc::clone(&self.state),
        }))
    }

    fn extra_timeout(&self) -> Duration {
        self.extra_timeout
    }
}

pub struct FakeProtocol {
    kind: String,
}

impl Protocol for FakeProtocol {
    fn kind(&self) -> &str {
        &self.kind
    }
}

pub struct FakeExecutor {
    protocol_kind: String,
    protocol: Option<Box<dyn Protocol>>,
    state: Arc<ExecutorState>,
}

impl Executor for FakeExecutor {
    fn protocol_kind(&self) -> &str {
        &self.protocol_kind
    }

    fn setup(&mut self, protocol: Option<Box<dyn Protocol>>) -> anyhow::Result<()> {
        let failing = self
            .state
            .failing_setups
            .fetch_update(ORDERING, ORDERING, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("executor setup failed");
        }
        self.state.setups.fetch_add(1, ORDERING);
        if protocol.is_some() {
            self.state.handovers.fetch_add(1, ORDERING);
        }
        let protocol: Box<dyn Protocol> = match protocol {
            Some(protocol) => protocol,
            None => Box::new(FakeProtocol {
                kind: self.protocol_kind.clone(),
            }),
        };
        self.protocol = Some(protocol);
        Ok(())
    }

    fn run_test(
        &mut self,
        test: &Test,
        group_metadata: &mut GroupMetadata,
    ) -> anyhow::Result<TestOutcome> {
        let run = {
            let mut runs = self.state.runs.lock();
            let run = runs.iter().filter(|id| **id == test.id).count();
            runs.push(test.id.clone());
            run
        };
        group_metadata.increment("url_count");

        let pass = || TestOutcome::new(HarnessResult::for_test(test, test.test_type.pass_status()));
        match self.state.script_for(&test.id, run) {
            None => Ok(pass()),
            Some(TestScript::Status(status)) => {
                Ok(TestOutcome::new(HarnessResult::for_test(test, status)))
            }
            Some(TestScript::Subtests(status, subtests)) => Ok(TestOutcome::with_subtests(
                HarnessResult::for_test(test, status),
                subtests
                    .into_iter()
                    .map(|(name, status)| SubtestResult::for_test(test, name, status))
                    .collect(),
            )),
            Some(TestScript::ExecutorError) => anyhow::bail!("executor failed on {}", test.id),
            Some(TestScript::Panic) => panic!("executor panicked on {}", test.id),
            Some(TestScript::KillWorker) => std::panic::panic_any(WorkerKiller),
            Some(TestScript::Hang(duration)) => {
                thread::sleep(duration);
                Ok(pass())
            }
            Some(TestScript::UntilBrowserStops(stopped)) => {
                while !stopped.load(ORDERING) {
                    thread::sleep(Duration::from_millis(5));
                }
                anyhow::bail!("browser went away while running {}", test.id)
            }
        }
    }

    fn reset(&mut self) -> anyhow::Result<()> {
        self.state.resets.fetch_add(1, ORDERING);
        Ok(())
    }

    fn wait(&mut self) -> anyhow::Result<bool> {
        self.state.waits.fetch_add(1, ORDERING);
        let rerun = self
            .state
            .wait_reruns
            .fetch_update(ORDERING, ORDERING, |n| n.checked_sub(1))
            .is_ok();
        Ok(rerun)
    }

    fn teardown(&mut self) -> Option<Box<dyn Protocol>> {
        self.protocol.take()
    }
}

type SettingsFn = Arc<dyn Fn(&Test) -> BrowserSettings + Send + Sync>;

#[derive(Default)]
struct BrowserState {
    failing_starts: AtomicUsize,
    crash_on: Mutex<HashSet<TestId>>,
    settings: Mutex<Option<SettingsFn>>,
    switch_test_types: AtomicBool,
    dies_after_start: AtomicBool,
    init_timeout: Mutex<Option<Duration>>,
    start_delay: Mutex<Option<Duration>>,
    builds: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    forced_stops: AtomicUsize,
    cleanups: AtomicUsize,
    stopped: Arc<AtomicBool>,
}

/// Builds [FakeBrowser]s. Clones share their configuration and counters.
#[derive(Clone, Default)]
pub struct FakeBrowserFactory {
    state: Arc<BrowserState>,
}

impl FakeBrowserFactory {
    /// The first `n` starts fail.
    pub fn fail_starts(self, n: usize) -> Self {
        self.state.failing_starts.store(n, ORDERING);
        self
    }

    pub fn always_fail(self) -> Self {
        self.fail_starts(usize::MAX)
    }

    /// Reports a crash whenever `test` is checked.
    pub fn crash_on(self, test: &str) -> Self {
        self.state.crash_on.lock().insert(TestId::from(test));
        self
    }

    pub fn settings_fn(self, f: impl Fn(&Test) -> BrowserSettings + Send + Sync + 'static) -> Self {
        *self.state.settings.lock() = Some(Arc::new(f));
        self
    }

    /// Lets the executor be switched between test types on a live browser.
    pub fn can_switch_test_types(self) -> Self {
        self.state.switch_test_types.store(true, ORDERING);
        self
    }

    /// Started browsers report themselves dead.
    pub fn dies_after_start(self) -> Self {
        self.state.dies_after_start.store(true, ORDERING);
        self
    }

    pub fn init_timeout(self, timeout: Duration) -> Self {
        *self.state.init_timeout.lock() = Some(timeout);
        self
    }

    /// Every start takes `delay` before succeeding or failing.
    pub fn slow_start(self, delay: Duration) -> Self {
        *self.state.start_delay.lock() = Some(delay);
        self
    }

    /// Raised the first time any browser of this factory is stopped.
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.state.stopped)
    }

    pub fn builds(&self) -> usize {
        self.state.builds.load(ORDERING)
    }

    /// Start attempts, successful or not.
    pub fn starts(&self) -> usize {
        self.state.starts.load(ORDERING)
    }

    pub fn stops(&self) -> usize {
        self.state.stops.load(ORDERING)
    }

    pub fn forced_stops(&self) -> usize {
        self.state.forced_stops.load(ORDERING)
    }

    pub fn cleanups(&self) -> usize {
        self.state.cleanups.load(ORDERING)
    }
}

impl BrowserFactory for FakeBrowserFactory {
    fn name(&self) -> &str {
        "fake-browser"
    }

    fn build(&self, _kwargs: &Kwargs) -> anyhow::Result<Box<dyn Browser>> {
        self.state.builds.fetch_add(1, ORDERING);
        Ok(Box::new(FakeBrowser {
            state: Arc::clone(&self.state),
            alive: false,
        }))
    }
}

pub struct FakeBrowser {
    state: Arc<BrowserState>,
    alive: bool,
}

impl Browser for FakeBrowser {
    fn settings(&self, test: &Test) -> BrowserSettings {
        match &*self.state.settings.lock() {
            Some(settings) => settings(test),
            None => BrowserSettings::new(),
        }
    }

    fn start(&mut self, _settings: &BrowserSettings, _group_metadata: &GroupMetadata) -> anyhow::Result<()> {
        self.state.starts.fetch_add(1, ORDERING);
        let delay = *self.state.start_delay.lock();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        let failing = self
            .state
            .failing_starts
            .fetch_update(ORDERING, ORDERING, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("browser failed to start");
        }
        self.alive = !self.state.dies_after_start.load(ORDERING);
        Ok(())
    }

    fn stop(&mut self, force: bool) -> bool {
        self.state.stops.fetch_add(1, ORDERING);
        if force {
            self.state.forced_stops.fetch_add(1, ORDERING);
        }
        self.state.stopped.store(true, ORDERING);
        self.alive = false;
        true
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    fn check_crash(&mut self, test: Option<&TestId>) -> bool {
        test.map_or(false, |test| self.state.crash_on.lock().contains(test))
    }

    fn restart_on_test_type_change(&self, _old: TestType, _new: TestType) -> bool {
        !self.state.switch_test_types.load(ORDERING)
    }

    fn executor_browser(&self) -> ExecutorBrowser {
        ExecutorBrowser {
            name: "fake".to_owned(),
            params: Map::new(),
        }
    }

    fn init_timeout(&self) -> Duration {
        self.state
            .init_timeout
            .lock()
            .unwrap_or(Duration::from_secs(30))
    }

    fn cleanup(&mut self) {
        self.state.cleanups.fetch_add(1, ORDERING);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    SuiteStart {
        num_tests: usize,
    },
    SuiteEnd,
    TestStart {
        test: TestId,
        subsuite: SubsuiteName,
    },
    TestStatus {
        test: TestId,
        subtest: String,
        status: Status,
    },
    TestEnd {
        test: TestId,
        result: HarnessResult,
    },
    Log {
        level: LogLevel,
        message: String,
    },
}

/// Keeps everything logged to it, in order.
#[derive(Debug, Default)]
pub struct RecordingLogger {
    entries: Mutex<Vec<LogEntry>>,
}

impl RecordingLogger {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    pub fn test_starts(&self) -> Vec<TestId> {
        self.entries
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                LogEntry::TestStart { test, .. } => Some(test.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn test_ends(&self) -> Vec<(TestId, Status)> {
        self.test_results()
            .into_iter()
            .map(|(test, result)| (test, result.status))
            .collect()
    }

    pub fn test_results(&self) -> Vec<(TestId, HarnessResult)> {
        self.entries
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                LogEntry::TestEnd { test, result } => Some((test.clone(), result.clone())),
                _ => None,
            })
            .collect()
    }

    /// Statuses `test` ended with, in order.
    pub fn statuses_of(&self, test: &str) -> Vec<Status> {
        self.test_ends()
            .into_iter()
            .filter(|(id, _)| id.as_str() == test)
            .map(|(_, status)| status)
            .collect()
    }

    pub fn subtest_statuses(&self) -> Vec<(TestId, String, Status)> {
        self.entries
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                LogEntry::TestStatus {
                    test,
                    subtest,
                    status,
                } => Some((test.clone(), subtest.clone(), *status)),
                _ => None,
            })
            .collect()
    }

    pub fn messages(&self, level: LogLevel) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                LogEntry::Log { level: l, message } if *l == level => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn has_message(&self, level: LogLevel, needle: &str) -> bool {
        self.messages(level).iter().any(|m| m.contains(needle))
    }

    pub fn suite_ends(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| matches!(entry, LogEntry::SuiteEnd))
            .count()
    }

    fn push(&self, entry: LogEntry) {
        self.entries.lock().push(entry);
    }
}

impl StructuredLogger for RecordingLogger {
    fn suite_start(&self, tests: &TestsByType) {
        self.push(LogEntry::SuiteStart {
            num_tests: tests.values().map(Vec::len).sum(),
        });
    }

    fn suite_end(&self) {
        self.push(LogEntry::SuiteEnd);
    }

    fn test_start(&self, test: &TestId, subsuite: &SubsuiteName) {
        self.push(LogEntry::TestStart {
            test: test.clone(),
            subsuite: subsuite.clone(),
        });
    }

    fn test_status(&self, test: &TestId, result: &SubtestResult, _subsuite: &SubsuiteName) {
        self.push(LogEntry::TestStatus {
            test: test.clone(),
            subtest: result.name.clone(),
            status: result.status,
        });
    }

    fn test_end(&self, test: &TestId, result: &HarnessResult, _subsuite: &SubsuiteName) {
        self.push(LogEntry::TestEnd {
            test: test.clone(),
            result: result.clone(),
        });
    }

    fn log(&self, level: LogLevel, message: &str) {
        self.push(LogEntry::Log {
            level,
            message: message.to_owned(),
        });
    }
}
