//! Manager-side control of one browser process.

use std::sync::mpsc::Sender;
use std::sync::Arc;

use wtr_queue::{GroupMetadata, Status, Test, TestId, TestType};
use wtr_utils::timer::Watchdog;

use crate::executor::{Browser, BrowserSettings, ExecutorBrowser, TestImplementation};
use crate::messages::ManagerEvent;

pub struct BrowserManager {
    name: String,
    browser: Box<dyn Browser>,
    /// The implementation the browser was built for.
    implementation: Arc<TestImplementation>,
    settings: Option<BrowserSettings>,
    last_test: Option<TestId>,
    /// Whether the last test recorded against this browser crashed it.
    last_test_crashed: bool,
    started: bool,
    init_timer: Option<Watchdog>,
}

impl BrowserManager {
    pub fn new(
        name: impl Into<String>,
        implementation: Arc<TestImplementation>,
    ) -> anyhow::Result<Self> {
        let browser = implementation
            .browser
            .build(&implementation.browser_kwargs)?;
        Ok(Self {
            name: name.into(),
            browser,
            implementation,
            settings: None,
            last_test: None,
            last_test_crashed: false,
            started: false,
            init_timer: None,
        })
    }

    /// Whether this browser can serve tests of `implementation` without being rebuilt.
    pub fn serves(&self, implementation: &TestImplementation) -> bool {
        self.implementation.shares_browser_with(implementation)
    }

    /// Records the settings `test` needs. Returns whether the browser must be restarted before
    /// running it.
    ///
    /// A restart is needed when the settings changed, or when moving on to a different test after
    /// one that crashed, or to a test that is itself expected to crash.
    pub fn update_settings(&mut self, test: &Test) -> bool {
        let settings = self.browser.settings(test);
        let settings_changed = self
            .settings
            .as_ref()
            .map_or(false, |current| *current != settings);

        let new_test = self.last_test.as_ref() != Some(&test.id);
        let needs_fresh_browser =
            new_test && (self.last_test_crashed || test.expected.status == Status::Crash);

        self.settings = Some(settings);
        if new_test {
            self.last_test = Some(test.id.clone());
            self.last_test_crashed = false;
        }

        settings_changed || needs_fresh_browser
    }

    /// Starts the browser with the last recorded settings.
    ///
    /// Arms a watchdog that reports [ManagerEvent::InitFailed] on `events` if initialization
    /// takes longer than the browser allows; [BrowserManager::after_init] disarms it. Returns
    /// false if the browser failed to start.
    pub fn init(&mut self, group_metadata: &GroupMetadata, events: Sender<ManagerEvent>) -> bool {
        let init_timeout = self.browser.init_timeout();
        let timer = Watchdog::arm(format!("{}-init", self.name), init_timeout, move || {
            tracing::warn!(?init_timeout, "browser init timed out");
            let _ = events.send(ManagerEvent::InitFailed);
        });
        match timer {
            Ok(timer) => self.init_timer = Some(timer),
            Err(error) => {
                tracing::error!(?error, "failed to arm the browser init watchdog");
                return false;
            }
        }

        let settings = self.settings.clone().unwrap_or_default();
        if let Err(error) = self.browser.start(&settings, group_metadata) {
            tracing::error!(?error, "failure during browser init");
            self.cancel_init_timer();
            return false;
        }

        self.started = true;
        true
    }

    pub fn after_init(&mut self) {
        self.cancel_init_timer();
    }

    fn cancel_init_timer(&mut self) {
        if let Some(timer) = self.init_timer.take() {
            timer.cancel();
        }
    }

    /// Remembers how the last test ended, for [BrowserManager::update_settings].
    pub fn record_status(&mut self, test: &TestId, status: Status) {
        if self.last_test.as_ref() == Some(test) {
            self.last_test_crashed = status == Status::Crash;
        }
    }

    pub fn check_crash(&mut self, test: Option<&TestId>) -> bool {
        self.browser.check_crash(test)
    }

    pub fn is_alive(&self) -> bool {
        self.started && self.browser.is_alive()
    }

    pub fn restart_on_test_type_change(&self, old: TestType, new: TestType) -> bool {
        self.browser.restart_on_test_type_change(old, new)
    }

    pub fn executor_browser(&self) -> ExecutorBrowser {
        self.browser.executor_browser()
    }

    pub fn stop(&mut self, force: bool) {
        if !self.started {
            return;
        }
        if !self.browser.stop(force) {
            tracing::warn!(force, "browser did not stop cleanly");
        }
        self.started = false;
    }

    pub fn cleanup(&mut self) {
        self.cancel_init_timer();
        self.browser.cleanup();
    }
}

impl std::fmt::Debug for BrowserManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserManager")
            .field("name", &self.name)
            .field("browser", &self.implementation.browser.name())
            .field("started", &self.started)
            .field("last_test", &self.last_test)
            .finish()
    }
}
