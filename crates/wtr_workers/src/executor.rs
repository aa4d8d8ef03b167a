//! Seams to the browser and executor implementations a run is configured with.
//!
//! A [Browser] lives on its manager's thread and owns the browser process. An [Executor] lives on
//! the worker's thread and drives tests through a [Protocol] connection to that browser. Both are
//! built by factories named in a [TestImplementation], one per `(subsuite, test type)`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use wtr_queue::{GroupMetadata, Test, TestId, TestKey, TestType};

use crate::results::TestOutcome;

/// Keyword arguments an implementation is configured with.
pub type Kwargs = Map<String, Value>;

/// Per-test browser configuration. A change between consecutive tests requires a fresh browser.
pub type BrowserSettings = Map<String, Value>;

/// A connection to a running browser. May outlive the executor that opened it.
pub trait Protocol: Send {
    /// Executors can only share a protocol of the same kind.
    fn kind(&self) -> &str;
}

pub trait Executor {
    /// Kind of [Protocol] this executor speaks.
    fn protocol_kind(&self) -> &str;

    /// Connects to the browser, reusing `protocol` if one is handed over from a previous
    /// executor.
    fn setup(&mut self, protocol: Option<Box<dyn Protocol>>) -> anyhow::Result<()>;

    /// Runs one test to completion. May block for as long as the test takes; the manager bounds
    /// this externally.
    fn run_test(
        &mut self,
        test: &Test,
        group_metadata: &mut GroupMetadata,
    ) -> anyhow::Result<TestOutcome>;

    /// Brings the executor back to a clean state before the same test runs again.
    fn reset(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Blocks until the browser exits or is told to resume. Returns whether the test that just
    /// ran should run again.
    fn wait(&mut self) -> anyhow::Result<bool>;

    /// Tears the executor down, handing back its protocol for reuse.
    fn teardown(&mut self) -> Option<Box<dyn Protocol>>;
}

/// How the worker should reach the browser.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutorBrowser {
    pub name: String,
    pub params: Map<String, Value>,
}

pub trait ExecutorFactory: Send + Sync {
    fn name(&self) -> &str;

    fn build(
        &self,
        browser: &ExecutorBrowser,
        kwargs: &Kwargs,
    ) -> anyhow::Result<Box<dyn Executor>>;

    /// Slack the executor needs on top of a test's own timeout.
    fn extra_timeout(&self) -> Duration {
        Duration::ZERO
    }
}

pub trait Browser: Send {
    /// Settings `test` needs the browser to be started with.
    fn settings(&self, test: &Test) -> BrowserSettings;

    fn start(
        &mut self,
        settings: &BrowserSettings,
        group_metadata: &GroupMetadata,
    ) -> anyhow::Result<()>;

    /// Stops the browser. Returns whether it stopped.
    fn stop(&mut self, force: bool) -> bool;

    fn is_alive(&self) -> bool;

    /// Whether the browser crashed, during `test` if one is given.
    fn check_crash(&mut self, test: Option<&TestId>) -> bool;

    /// Whether moving from `old` to `new` test types needs a fresh browser, rather than only a
    /// new executor on the live connection.
    fn restart_on_test_type_change(&self, old: TestType, new: TestType) -> bool {
        let _ = (old, new);
        true
    }

    fn executor_browser(&self) -> ExecutorBrowser;

    fn init_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Releases anything the browser holds beyond its process.
    fn cleanup(&mut self) {}
}

pub trait BrowserFactory: Send + Sync {
    fn name(&self) -> &str;

    fn build(&self, kwargs: &Kwargs) -> anyhow::Result<Box<dyn Browser>>;
}

/// The executor and browser a group of tests is run with.
#[derive(Clone)]
pub struct TestImplementation {
    pub executor: Arc<dyn ExecutorFactory>,
    pub executor_kwargs: Kwargs,
    pub browser: Arc<dyn BrowserFactory>,
    pub browser_kwargs: Kwargs,
}

impl TestImplementation {
    pub fn new(executor: Arc<dyn ExecutorFactory>, browser: Arc<dyn BrowserFactory>) -> Self {
        Self {
            executor,
            executor_kwargs: Kwargs::new(),
            browser,
            browser_kwargs: Kwargs::new(),
        }
    }

    pub fn with_executor_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.executor_kwargs = kwargs;
        self
    }

    pub fn with_browser_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.browser_kwargs = kwargs;
        self
    }

    /// Whether both implementations run on the same browser, so that a browser started for one
    /// can serve the other.
    pub fn shares_browser_with(&self, other: &TestImplementation) -> bool {
        same_factory(&self.browser, &other.browser) && self.browser_kwargs == other.browser_kwargs
    }
}

fn same_factory<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    // Compare addresses only; vtable pointers of the same type may differ across codegen units.
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl std::fmt::Debug for TestImplementation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestImplementation")
            .field("executor", &self.executor.name())
            .field("executor_kwargs", &self.executor_kwargs)
            .field("browser", &self.browser.name())
            .field("browser_kwargs", &self.browser_kwargs)
            .finish()
    }
}

pub type TestImplementations = BTreeMap<TestKey, Arc<TestImplementation>>;
