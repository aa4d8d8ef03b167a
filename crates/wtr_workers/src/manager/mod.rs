//! The manager: one per worker, a state machine on its own thread that takes groups off the
//! shared queue, keeps a browser and worker alive to run them, and turns what comes back into
//! results.

mod results;
mod state;

use std::collections::BTreeMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use wtr_queue::{GroupMetadata, ReadQueue, Status, SubsuiteName, Test, TestId, TestKey, TestType};
use wtr_utils::stop_flag::StopFlag;
use wtr_utils::timer::Watchdog;

use crate::browser_manager::BrowserManager;
use crate::config::RunConfig;
use crate::executor::{ExecutorBrowser, TestImplementation, TestImplementations};
use crate::logger::StructuredLogger;
use crate::messages::{Command, ManagerEvent, Serial};
use crate::results::{HarnessResult, TestOutcome};
use crate::worker::{panic_message, WorkerEnv, WorkerHandle};

use results::{classify, crash_verdict, CrashVerdict, SubtestSummary, Unexpected};
pub use state::{ActiveGroup, CurrentTest, PendingWork, RunPhase, RunnerManagerState};

pub const EXTERNAL_TIMEOUT_MESSAGE: &str =
    "TestRunner hit external timeout (this may indicate a hang)";

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no implementation is configured for {0:?}")]
    NoImplementation(TestKey),
    #[error("failed to build browser: {0:#}")]
    BuildBrowser(anyhow::Error),
    #[error("browser failed to start")]
    BrowserInit,
    #[error("failed to spawn worker thread")]
    SpawnWorker(#[source] io::Error),
}

/// What one manager has recorded so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerSummary {
    pub test_count: BTreeMap<TestKey, usize>,
    pub unexpected_pass: BTreeMap<TestKey, Vec<TestId>>,
    pub unexpected_fail: BTreeMap<TestKey, Vec<TestId>>,
    /// Tests reported as `SKIP` because the harness gave up on them.
    pub skipped: usize,
    /// Whether the manager ended in error or died.
    pub errored: bool,
}

impl ManagerSummary {
    pub fn merge(&mut self, other: &ManagerSummary) {
        for (key, count) in &other.test_count {
            *self.test_count.entry(key.clone()).or_default() += count;
        }
        for (key, tests) in &other.unexpected_pass {
            self.unexpected_pass
                .entry(key.clone())
                .or_default()
                .extend(tests.iter().cloned());
        }
        for (key, tests) in &other.unexpected_fail {
            self.unexpected_fail
                .entry(key.clone())
                .or_default()
                .extend(tests.iter().cloned());
        }
        self.skipped += other.skipped;
        self.errored |= other.errored;
    }

    pub fn total_tests(&self) -> usize {
        self.test_count.values().sum()
    }

    pub fn has_unexpected(&self) -> bool {
        self.unexpected_pass.values().any(|tests| !tests.is_empty())
            || self.unexpected_fail.values().any(|tests| !tests.is_empty())
    }
}

/// Everything a manager shares with the rest of its pool.
pub struct ManagerEnv {
    pub index: usize,
    pub config: Arc<RunConfig>,
    pub implementations: Arc<TestImplementations>,
    pub queue: Arc<ReadQueue>,
    pub stop_flag: StopFlag,
    pub logger: Arc<dyn StructuredLogger>,
    /// Where the manager publishes its results as it records them.
    pub summary: Arc<Mutex<ManagerSummary>>,
}

enum Next {
    /// Enter a state, running its entry action.
    Enter(RunnerManagerState),
    /// Stay in a state until the next event.
    Await(RunnerManagerState),
}

/// How a recorded result affects what happens next.
struct Verdict {
    restart_before_next: bool,
    force_stop: bool,
    pause: bool,
}

pub struct TestRunnerManager {
    name: String,
    config: Arc<RunConfig>,
    implementations: Arc<TestImplementations>,
    queue: Arc<ReadQueue>,
    stop_flag: StopFlag,
    logger: Arc<dyn StructuredLogger>,
    summary: Arc<Mutex<ManagerSummary>>,

    browser: Option<BrowserManager>,
    worker: Option<WorkerHandle>,
    /// Sender handed to the worker and to timers. Replaced, along with the receiver, every time
    /// a worker is stopped, so nothing an old worker or timer sends is ever seen.
    events_tx: Sender<ManagerEvent>,
    events_rx: Receiver<ManagerEvent>,
    test_timer: Option<Watchdog>,
    serial: Serial,
    /// Times the current test has run.
    run_count: u32,
}

impl TestRunnerManager {
    pub fn new(env: ManagerEnv) -> Self {
        let ManagerEnv {
            index,
            config,
            implementations,
            queue,
            stop_flag,
            logger,
            summary,
        } = env;
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            name: format!("TestRunnerManager-{index}"),
            config,
            implementations,
            queue,
            stop_flag,
            logger,
            summary,
            browser: None,
            worker: None,
            events_tx,
            events_rx,
            test_timer: None,
            serial: 0,
            run_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs until the queue is drained, the manager gives up, or a stop is requested; then
    /// cleans up and waits at the pool's shutdown barrier.
    ///
    /// A panic in the state machine is logged as critical and re-raised once cleanup is done.
    pub fn run(mut self) {
        let span = tracing::info_span!("manager", name = %self.name);
        let _entered = span.enter();

        let mut panic_payload = None;
        let final_state = match panic::catch_unwind(AssertUnwindSafe(|| self.run_loop())) {
            Ok(state) => state,
            Err(panic) => {
                self.logger.critical(&format!(
                    "Unhandled panic in {}: {}",
                    self.name,
                    panic_message(&*panic)
                ));
                self.summary.lock().errored = true;
                panic_payload = Some(panic);
                RunnerManagerState::Error
            }
        };

        self.cleanup_run_loop(final_state);

        if let Some(panic) = panic_payload {
            panic::resume_unwind(panic);
        }
    }

    fn run_loop(&mut self) -> RunnerManagerState {
        let mut next = Next::Enter(RunnerManagerState::BeforeInit);
        loop {
            next = match next {
                Next::Enter(state) => {
                    tracing::debug!(state = state.name(), "entering state");
                    if state.is_terminal() {
                        return state;
                    }
                    if self.stop_flag.is_stop_requested() {
                        return self.stop_requested(state);
                    }
                    self.enter(state)
                }
                Next::Await(state) => {
                    if self.stop_flag.is_stop_requested() {
                        return self.stop_requested(state);
                    }
                    match self.events_rx.recv_timeout(self.config.poll_interval()) {
                        Ok(event) => {
                            tracing::debug!(state = state.name(), event = event.name(), "got event");
                            self.on_event(state, event)
                        }
                        Err(RecvTimeoutError::Timeout) => self.on_poll_timeout(state),
                        Err(RecvTimeoutError::Disconnected) => {
                            self.logger.critical("Manager event channel closed");
                            Next::Enter(self.fail(state))
                        }
                    }
                }
            };
        }
    }

    fn cleanup_run_loop(&mut self, final_state: RunnerManagerState) {
        tracing::debug!(
            state = final_state.name(),
            "main loop terminating, starting cleanup"
        );
        self.stop_runner(final_state.force_stop());
        if let Some(mut browser) = self.browser.take() {
            browser.cleanup();
        }
        if !self.stop_flag.manager_done(self.config.cleanup_timeout()) {
            tracing::warn!("timed out waiting for the rest of the pool to shut down");
        }
    }

    fn enter(&mut self, state: RunnerManagerState) -> Next {
        match state {
            RunnerManagerState::BeforeInit => self.start_init(),
            RunnerManagerState::Initializing {
                current,
                failure_count,
            } => self.init(current, failure_count),
            RunnerManagerState::Running { current, .. } => self.run_test(current),
            RunnerManagerState::Restarting {
                current,
                force_stop,
            } => self.restart_runner(current, force_stop),
            RunnerManagerState::SwitchingExecutor { current } => self.switch_executor(current),
            state @ (RunnerManagerState::Error | RunnerManagerState::Stop { .. }) => {
                Next::Enter(state)
            }
        }
    }

    fn on_event(&mut self, state: RunnerManagerState, event: ManagerEvent) -> Next {
        use RunnerManagerState::*;

        match (state, event) {
            (
                Initializing {
                    current,
                    failure_count: _,
                },
                ManagerEvent::InitSucceeded,
            ) => {
                if let Some(browser) = &mut self.browser {
                    browser.after_init();
                }
                Next::Enter(Running {
                    current,
                    phase: RunPhase::Starting,
                })
            }
            (
                Initializing {
                    current,
                    failure_count,
                },
                ManagerEvent::InitFailed,
            ) => Next::Enter(self.init_failed(current, failure_count)),
            (
                Initializing {
                    current,
                    failure_count,
                },
                ManagerEvent::Error { message },
            ) => {
                self.logger.error(&message);
                Next::Enter(self.init_failed(current, failure_count))
            }

            (
                Running {
                    current,
                    phase: RunPhase::InFlight { serial },
                },
                ManagerEvent::TestEnded {
                    serial: ended_serial,
                    test,
                    outcome,
                    group_metadata,
                },
            ) => {
                if ended_serial != serial || test != current.test.id {
                    self.logger
                        .warning(&format!("Received unexpected test_ended for {test}"));
                    return Next::Await(Running {
                        current,
                        phase: RunPhase::InFlight { serial },
                    });
                }
                self.test_ended(current, outcome, group_metadata)
            }
            (
                Running {
                    current,
                    phase: RunPhase::InFlight { .. },
                },
                ManagerEvent::Error { message },
            ) => {
                self.logger.error(&message);
                let outcome = TestOutcome::new(
                    HarnessResult::for_test(&current.test, Status::InternalError)
                        .with_message(message),
                );
                self.test_ended(current, outcome, None)
            }
            (
                Running {
                    current,
                    phase: RunPhase::Paused,
                },
                ManagerEvent::WaitFinished { rerun },
            ) => {
                self.logger.debug("Wait finished");
                // The browser was released while paused; only a rerun can reuse it.
                self.after_test_end(current, !rerun, rerun, false)
            }
            (
                Running {
                    current,
                    phase: RunPhase::Paused,
                },
                ManagerEvent::Error { message },
            ) => {
                self.logger.error(&message);
                self.after_test_end(current, true, false, false)
            }

            (SwitchingExecutor { current }, ManagerEvent::SwitchExecutorSucceeded) => {
                Next::Enter(Running {
                    current,
                    phase: RunPhase::Starting,
                })
            }
            (SwitchingExecutor { current }, ManagerEvent::SwitchExecutorFailed) => {
                self.logger.info("Switching executor failed, restarting");
                Next::Enter(Restarting {
                    current,
                    force_stop: false,
                })
            }
            (SwitchingExecutor { current }, ManagerEvent::Error { message }) => {
                self.logger.error(&message);
                Next::Enter(Restarting {
                    current,
                    force_stop: false,
                })
            }

            (state, ManagerEvent::TestEnded { test, .. }) => {
                self.logger
                    .warning(&format!("Received unexpected test_ended for {test}"));
                Next::Await(state)
            }
            (state, event) => {
                tracing::warn!(
                    state = state.name(),
                    event = event.name(),
                    "ignoring event the current state does not expect"
                );
                Next::Await(state)
            }
        }
    }

    fn on_poll_timeout(&mut self, state: RunnerManagerState) -> Next {
        let RunnerManagerState::Running { .. } = state else {
            return Next::Await(state);
        };

        if self.config.debug_interactive
            && self.browser.as_ref().map_or(false, |browser| !browser.is_alive())
        {
            self.logger.info("Browser not running, stopping");
            self.skip_pending(state.into_pending());
            return Next::Enter(RunnerManagerState::Stop { force_stop: false });
        }

        let worker_alive = self.worker.as_ref().map_or(false, WorkerHandle::is_alive);
        if worker_alive {
            return Next::Await(state);
        }

        // Something may have been sent just before the worker exited.
        if let Ok(event) = self.events_rx.try_recv() {
            return self.on_event(state, event);
        }

        match state {
            RunnerManagerState::Running {
                current,
                phase: RunPhase::InFlight { .. },
            } => {
                self.logger.critical(&format!(
                    "Worker exited while running {}; its result cannot be known",
                    current.test.id
                ));
                self.cancel_test_timer();
                let outcome = TestOutcome::new(
                    HarnessResult::for_test(&current.test, Status::Crash)
                        .with_message("worker exited unexpectedly"),
                );
                self.record_result(&current, outcome);
                Next::Enter(self.fail(RunnerManagerState::Running {
                    current,
                    phase: RunPhase::Paused,
                }))
            }
            RunnerManagerState::Running { current, .. } => {
                self.logger.warning("Worker exited unexpectedly, restarting");
                self.after_test_end(current, true, false, true)
            }
            state => Next::Await(state),
        }
    }

    fn start_init(&mut self) -> Next {
        match self.next_test(None) {
            Some((current, _)) => Next::Enter(RunnerManagerState::Initializing {
                current,
                failure_count: 0,
            }),
            None => {
                tracing::debug!("no tests to run");
                Next::Enter(RunnerManagerState::Stop { force_stop: false })
            }
        }
    }

    fn init(&mut self, current: CurrentTest, failure_count: usize) -> Next {
        if failure_count > self.config.max_restarts {
            self.logger.critical(&format!(
                "Max restarts exceeded: browser failed to start {failure_count} times in a row"
            ));
            return Next::Enter(self.fail(RunnerManagerState::Initializing {
                current,
                failure_count,
            }));
        }

        let started = self
            .start_browser(&current)
            .and_then(|executor_browser| self.start_worker(&current, executor_browser));
        match started {
            Ok(()) => Next::Await(RunnerManagerState::Initializing {
                current,
                failure_count,
            }),
            Err(error) => {
                self.logger.error(&error.to_string());
                Next::Enter(self.init_failed(current, failure_count))
            }
        }
    }

    fn ensure_browser(
        &mut self,
        implementation: &Arc<TestImplementation>,
    ) -> Result<&mut BrowserManager, ManagerError> {
        if let Some(browser) = self.browser.take() {
            if browser.serves(implementation) {
                return Ok(self.browser.insert(browser));
            }
            let mut old = browser;
            old.stop(true);
            old.cleanup();
        }
        let browser = BrowserManager::new(format!("{}-browser", self.name), Arc::clone(implementation))
            .map_err(ManagerError::BuildBrowser)?;
        Ok(self.browser.insert(browser))
    }

    fn start_browser(&mut self, current: &CurrentTest) -> Result<ExecutorBrowser, ManagerError> {
        let events = self.events_tx.clone();
        let browser = self.ensure_browser(&current.group.implementation)?;
        browser.update_settings(&current.test);
        if !browser.init(&current.group.metadata, events) {
            return Err(ManagerError::BrowserInit);
        }
        Ok(browser.executor_browser())
    }

    fn start_worker(
        &mut self,
        current: &CurrentTest,
        executor_browser: ExecutorBrowser,
    ) -> Result<(), ManagerError> {
        let env = WorkerEnv {
            name: format!("{}-worker", self.name),
            implementation: Arc::clone(&current.group.implementation),
            executor_browser,
            sanitizer: self.config.sanitizer,
        };
        let worker =
            WorkerHandle::spawn(env, self.events_tx.clone()).map_err(ManagerError::SpawnWorker)?;
        self.worker = Some(worker);
        Ok(())
    }

    fn init_failed(&mut self, current: CurrentTest, failure_count: usize) -> RunnerManagerState {
        tracing::debug!(failure_count, "init failed");
        if let Some(browser) = &mut self.browser {
            browser.check_crash(None);
            browser.after_init();
        }
        self.stop_runner(true);
        RunnerManagerState::Initializing {
            current,
            failure_count: failure_count + 1,
        }
    }

    fn run_test(&mut self, current: CurrentTest) -> Next {
        let needs_restart = self
            .browser
            .as_mut()
            .map_or(true, |browser| browser.update_settings(&current.test));
        if needs_restart {
            self.logger.info("Restarting browser for new test environment");
            return Next::Enter(RunnerManagerState::Restarting {
                current,
                force_stop: false,
            });
        }

        let test = Arc::clone(&current.test);
        self.logger.test_start(&test.id, &current.group.key.subsuite);

        if self.config.rerun > 1 {
            self.logger
                .info(&format!("Run {}/{}", self.run_count + 1, self.config.rerun));
            self.send(Command::Reset);
        }
        self.run_count += 1;
        self.serial += 1;
        let serial = self.serial;

        if !self.config.debug_interactive {
            let extra_timeout = current.group.implementation.executor.extra_timeout();
            let timeout = self.config.external_timeout(test.timeout, extra_timeout);
            self.arm_test_timer(serial, &test, timeout);
        }

        self.send(Command::RunTest {
            serial,
            test,
            group_metadata: current.group.metadata.clone(),
        });
        Next::Await(RunnerManagerState::Running {
            current,
            phase: RunPhase::InFlight { serial },
        })
    }

    fn arm_test_timer(&mut self, serial: Serial, test: &Arc<Test>, timeout: std::time::Duration) {
        let events = self.events_tx.clone();
        let timed_out = Arc::clone(test);
        let timer = Watchdog::arm(format!("{}-timeout", self.name), timeout, move || {
            let outcome = TestOutcome::new(
                HarnessResult::for_test(&timed_out, Status::ExternalTimeout)
                    .with_message(EXTERNAL_TIMEOUT_MESSAGE),
            );
            let _ = events.send(ManagerEvent::TestEnded {
                serial,
                test: timed_out.id.clone(),
                outcome,
                group_metadata: None,
            });
        });
        match timer {
            Ok(timer) => self.test_timer = Some(timer),
            Err(error) => {
                self.logger
                    .error(&format!("Failed to arm the external timeout for {}: {error}", test.id));
            }
        }
    }

    fn cancel_test_timer(&mut self) {
        if let Some(timer) = self.test_timer.take() {
            timer.cancel();
        }
    }

    fn test_ended(
        &mut self,
        mut current: CurrentTest,
        outcome: TestOutcome,
        group_metadata: Option<GroupMetadata>,
    ) -> Next {
        self.cancel_test_timer();
        if let Some(metadata) = group_metadata {
            current.group.metadata = metadata;
        }

        let verdict = self.record_result(&current, outcome);

        if verdict.pause {
            self.logger.info("Pausing until the browser exits");
            self.send(Command::Wait);
            return Next::Await(RunnerManagerState::Running {
                current,
                phase: RunPhase::Paused,
            });
        }

        self.after_test_end(
            current,
            verdict.restart_before_next,
            false,
            verdict.force_stop,
        )
    }

    /// Logs and counts the result of the current test.
    fn record_result(&mut self, current: &CurrentTest, outcome: TestOutcome) -> Verdict {
        let test = &current.test;
        let key = &current.group.key;
        let subsuite = &key.subsuite;
        let TestOutcome {
            mut harness,
            subtests,
        } = outcome;

        let mut subtest_summary = SubtestSummary::default();
        for mut subtest in subtests {
            subtest.status = subtest.status.sanitized();
            subtest_summary.add(&subtest);
            self.logger.test_status(&test.id, &subtest, subsuite);
        }

        let crashed = self
            .browser
            .as_mut()
            .map_or(false, |browser| browser.check_crash(Some(&test.id)));
        match crash_verdict(test.test_type, harness.status, crashed) {
            CrashVerdict::Unchanged => {}
            CrashVerdict::Reclassified => {
                self.logger
                    .info("Found a crash dump file; changing status to CRASH");
                harness.status = Status::Crash;
            }
            CrashVerdict::Ignored => {
                self.logger.warning(&format!(
                    "Found a crash dump; should change status from {} to CRASH but this causes instability",
                    harness.status
                ));
            }
        }

        let raw_status = harness.status;
        if let Some(browser) = &mut self.browser {
            browser.record_status(&test.id, raw_status);
        }
        harness.status = raw_status.sanitized();

        let unexpected = classify(&harness, subtest_summary);
        {
            let mut summary = self.summary.lock();
            *summary.test_count.entry(key.clone()).or_default() += 1;
            match unexpected {
                Unexpected::No => {}
                Unexpected::Pass => summary
                    .unexpected_pass
                    .entry(key.clone())
                    .or_default()
                    .push(test.id.clone()),
                Unexpected::Fail => summary
                    .unexpected_fail
                    .entry(key.clone())
                    .or_default()
                    .push(test.id.clone()),
            }
        }

        self.logger.test_end(&test.id, &harness, subsuite);

        let is_unexpected = unexpected != Unexpected::No;
        Verdict {
            restart_before_next: self.config.retry_index > 0
                || test.restart_after
                || raw_status.forces_restart()
                || (is_unexpected && self.config.restart_on_unexpected),
            force_stop: test.test_type == TestType::Wdspec && raw_status == Status::ExternalTimeout,
            pause: raw_status != Status::Crash
                && (self.config.pause_after_test
                    || (self.config.pause_on_unexpected && is_unexpected)),
        }
    }

    fn after_test_end(
        &mut self,
        current: CurrentTest,
        restart: bool,
        force_rerun: bool,
        force_stop: bool,
    ) -> Next {
        let mut restart = restart;

        let next = if !force_rerun && self.run_count >= self.config.rerun {
            let CurrentTest { group, .. } = current;
            let previous_key = group.key.clone();
            let previous_implementation = Arc::clone(&group.implementation);

            let Some((next, new_group)) = self.next_test(Some(group)) else {
                return Next::Enter(RunnerManagerState::Stop { force_stop });
            };

            if new_group {
                let next_key = &next.group.key;
                if next_key.subsuite != previous_key.subsuite
                    || self.config.restart_on_new_group
                    || !next
                        .group
                        .implementation
                        .shares_browser_with(&previous_implementation)
                {
                    restart = true;
                }

                if !restart && next_key.test_type != previous_key.test_type {
                    let browser_restart = self.browser.as_ref().map_or(true, |browser| {
                        browser.restart_on_test_type_change(previous_key.test_type, next_key.test_type)
                    });
                    if !browser_restart {
                        return Next::Enter(RunnerManagerState::SwitchingExecutor { current: next });
                    }
                    restart = true;
                }
            }
            next
        } else {
            current
        };

        if restart {
            Next::Enter(RunnerManagerState::Restarting {
                current: next,
                force_stop,
            })
        } else {
            Next::Enter(RunnerManagerState::Running {
                current: next,
                phase: RunPhase::Starting,
            })
        }
    }

    /// Takes the next test: the rest of `group` first, then groups off the shared queue.
    /// Returns the test, and whether it starts a new group.
    fn next_test(&mut self, group: Option<ActiveGroup>) -> Option<(CurrentTest, bool)> {
        self.run_count = 0;

        if let Some(mut group) = group {
            if let Some(test) = group.remaining.pop_front() {
                return Some((CurrentTest { test, group }, false));
            }
        }

        while let Some(group) = self.queue.pop() {
            let key = group.key();
            let Some(implementation) = self.implementations.get(&key).cloned() else {
                self.logger
                    .error(&ManagerError::NoImplementation(key.clone()).to_string());
                self.skip_tests(group.tests.iter(), &key.subsuite);
                continue;
            };
            tracing::debug!(group = %group.id, tests = group.len(), "took group off the queue");
            let mut group = ActiveGroup::new(group, implementation);
            if let Some(test) = group.remaining.pop_front() {
                return Some((CurrentTest { test, group }, true));
            }
        }
        None
    }

    fn restart_runner(&mut self, current: CurrentTest, force_stop: bool) -> Next {
        self.logger.debug("Restarting runner");
        self.stop_runner(force_stop);
        Next::Enter(RunnerManagerState::Initializing {
            current,
            failure_count: 0,
        })
    }

    fn switch_executor(&mut self, current: CurrentTest) -> Next {
        self.logger.debug(&format!(
            "Switching executor for {} tests",
            current.group.key.test_type
        ));
        let sent = self.send(Command::SwitchExecutor {
            implementation: Arc::clone(&current.group.implementation),
        });
        if !sent {
            return Next::Enter(RunnerManagerState::Restarting {
                current,
                force_stop: false,
            });
        }
        Next::Await(RunnerManagerState::SwitchingExecutor { current })
    }

    /// Stops the worker and the browser, and discards anything either may still send.
    ///
    /// The browser goes down before the worker is waited on: a worker stuck in a test only
    /// returns once the browser it is talking to is gone.
    fn stop_runner(&mut self, force: bool) {
        self.cancel_test_timer();

        let worker = self.worker.take();
        if let Some(worker) = &worker {
            tracing::debug!(force, "stopping worker");
            worker.request_stop();
        }

        if let Some(browser) = &mut self.browser {
            browser.stop(force);
        }

        if let Some(worker) = worker {
            let name = worker.name().to_owned();
            let grace = self.config.runner_stop_timeout();
            if !worker.join(grace) {
                self.logger.warning(&format!(
                    "{name} did not exit within {grace:?} of being stopped; abandoning it"
                ));
            }
        }

        let (events_tx, events_rx) = mpsc::channel();
        self.events_tx = events_tx;
        self.events_rx = events_rx;
    }

    fn send(&self, command: Command) -> bool {
        match &self.worker {
            Some(worker) => worker.send(command),
            None => false,
        }
    }

    fn stop_requested(&mut self, state: RunnerManagerState) -> RunnerManagerState {
        self.logger.debug("Stop requested");
        self.skip_pending(state.into_pending());
        RunnerManagerState::Stop { force_stop: true }
    }

    /// Gives up on the work held in `state` and enters the error state.
    fn fail(&mut self, state: RunnerManagerState) -> RunnerManagerState {
        self.summary.lock().errored = true;
        self.skip_pending(state.into_pending());
        RunnerManagerState::Error
    }

    fn skip_pending(&mut self, pending: Option<PendingWork>) {
        let Some(PendingWork { test, group }) = pending else {
            return;
        };
        let subsuite = &group.key.subsuite;
        let mut skipped = 0;
        if let Some((test, started)) = test {
            if !started {
                self.logger.test_start(&test.id, subsuite);
            }
            self.log_skip(&test, subsuite);
            skipped += 1;
        }
        skipped += self.skip_tests(group.remaining.iter(), subsuite);
        if skipped > 0 {
            self.logger.warning(&format!(
                "Skipped {skipped} tests left in {} of {}",
                group.id, self.name
            ));
        }
    }

    fn skip_tests<'a>(
        &mut self,
        tests: impl Iterator<Item = &'a Arc<Test>>,
        subsuite: &SubsuiteName,
    ) -> usize {
        let mut skipped = 0;
        for test in tests {
            self.logger.test_start(&test.id, subsuite);
            self.log_skip(test, subsuite);
            skipped += 1;
        }
        skipped
    }

    fn log_skip(&mut self, test: &Test, subsuite: &SubsuiteName) {
        let result = HarnessResult::for_test(test, Status::Skip)
            .with_message("the harness stopped before this test could finish");
        self.logger.test_end(&test.id, &result, subsuite);
        self.summary.lock().skipped += 1;
    }
}

impl std::fmt::Debug for TestRunnerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestRunnerManager")
            .field("name", &self.name)
            .field("browser", &self.browser)
            .field("worker", &self.worker)
            .field("serial", &self.serial)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tracing_test::traced_test;
    use wtr_queue::{GroupMetadata, Status, Test, TestGroup, TestKey, TestType, WriteQueue};
    use wtr_utils::stop_flag::StopFlag;

    use super::{
        ActiveGroup, CurrentTest, ManagerEnv, ManagerSummary, Next, RunPhase, RunnerManagerState,
        TestRunnerManager,
    };
    use crate::config::RunConfig;
    use crate::executor::{
        Browser, BrowserFactory, Executor, ExecutorBrowser, ExecutorFactory, Kwargs,
        TestImplementation,
    };
    use crate::logger::TracingLogger;
    use crate::messages::ManagerEvent;
    use crate::results::{HarnessResult, TestOutcome};

    /// Never asked to build anything: these tests drive the state machine by hand.
    struct Unbuildable;

    impl ExecutorFactory for Unbuildable {
        fn name(&self) -> &str {
            "unbuildable"
        }

        fn build(&self, _browser: &ExecutorBrowser, _kwargs: &Kwargs) -> anyhow::Result<Box<dyn Executor>> {
            anyhow::bail!("not buildable")
        }
    }

    impl BrowserFactory for Unbuildable {
        fn name(&self) -> &str {
            "unbuildable"
        }

        fn build(&self, _kwargs: &Kwargs) -> anyhow::Result<Box<dyn Browser>> {
            anyhow::bail!("not buildable")
        }
    }

    fn manager(summary: &Arc<Mutex<ManagerSummary>>) -> TestRunnerManager {
        TestRunnerManager::new(ManagerEnv {
            index: 0,
            config: Arc::new(RunConfig {
                restart_on_unexpected: false,
                ..RunConfig::default()
            }),
            implementations: Arc::new(BTreeMap::new()),
            queue: Arc::new(WriteQueue::new().to_read()),
            stop_flag: StopFlag::new(1),
            logger: Arc::new(TracingLogger),
            summary: Arc::clone(summary),
        })
    }

    fn group_of(ids: &[&str]) -> ActiveGroup {
        let tests = ids
            .iter()
            .map(|id| Arc::new(Test::new(*id, TestType::Testharness, Duration::from_secs(1))));
        let group = TestGroup::new(
            TestKey::new("", TestType::Testharness),
            tests,
            GroupMetadata::new(),
        );
        let implementation = Arc::new(TestImplementation::new(
            Arc::new(Unbuildable),
            Arc::new(Unbuildable),
        ));
        ActiveGroup::new(group, implementation)
    }

    fn in_flight(current: CurrentTest, serial: u64) -> RunnerManagerState {
        RunnerManagerState::Running {
            current,
            phase: RunPhase::InFlight { serial },
        }
    }

    fn ended(serial: u64, test: &Test, status: Status) -> ManagerEvent {
        ManagerEvent::TestEnded {
            serial,
            test: test.id.clone(),
            outcome: TestOutcome::new(HarnessResult::for_test(test, status)),
            group_metadata: None,
        }
    }

    #[test]
    #[traced_test]
    fn a_test_ending_twice_is_counted_once() {
        let summary = Arc::default();
        let mut manager = manager(&summary);
        let mut group = group_of(&["/a/1.html", "/a/2.html"]);
        let first = group.remaining.pop_front().unwrap();
        manager.run_count = 1;

        let next = manager.on_event(
            in_flight(
                CurrentTest {
                    test: Arc::clone(&first),
                    group,
                },
                1,
            ),
            ended(1, &first, Status::Ok),
        );
        let Next::Enter(RunnerManagerState::Running { current, .. }) = next else {
            panic!("expected to move on to the next test");
        };
        assert_eq!(current.test.id.as_str(), "/a/2.html");
        let second = Arc::clone(&current.test);
        manager.run_count = 1;

        // The first test's timer fired just as its real result came in.
        let next = manager.on_event(in_flight(current, 2), ended(1, &first, Status::ExternalTimeout));
        let Next::Await(state @ RunnerManagerState::Running { .. }) = next else {
            panic!("expected to keep waiting on the second test");
        };
        assert_eq!(summary.lock().total_tests(), 1);
        assert!(logs_contain("Received unexpected test_ended for /a/1.html"));

        let next = manager.on_event(state, ended(2, &second, Status::Ok));
        let Next::Enter(state @ RunnerManagerState::Stop { .. }) = next else {
            panic!("expected to stop once the group is done");
        };

        let next = manager.on_event(state, ended(2, &second, Status::Ok));
        assert!(matches!(next, Next::Await(RunnerManagerState::Stop { .. })));
        assert!(logs_contain("Received unexpected test_ended for /a/2.html"));

        let summary = summary.lock();
        assert_eq!(summary.total_tests(), 2);
        assert!(!summary.has_unexpected());
    }
}
