//! The pool of managers for one run.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use wtr_queue::{QueueError, ReadQueue, Status, TestId, TestKey, TestQueueBuilder, TestsByType};
use wtr_utils::exit::ExitCode;
use wtr_utils::stop_flag::StopFlag;

use crate::config::RunConfig;
use crate::executor::TestImplementations;
use crate::logger::StructuredLogger;
use crate::manager::{ManagerEnv, ManagerSummary, TestRunnerManager};
use crate::results::HarnessResult;

#[derive(Debug, Error)]
pub enum ManagerGroupError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("the manager group was already started")]
    AlreadyStarted,
    #[error("failed to spawn manager thread")]
    Spawn(#[source] io::Error),
}

pub struct ManagerGroup {
    config: Arc<RunConfig>,
    implementations: Arc<TestImplementations>,
    logger: Arc<dyn StructuredLogger>,
    run: Option<ActiveRun>,
}

struct ActiveRun {
    queue: Arc<ReadQueue>,
    stop_flag: StopFlag,
    managers: Vec<RunningManager>,
    /// Tests left in the queue once every manager finished.
    leftover_skipped: usize,
    suite_ended: bool,
}

struct RunningManager {
    name: String,
    summary: Arc<Mutex<ManagerSummary>>,
    thread: Option<JoinHandle<()>>,
}

impl ActiveRun {
    /// Arrives at the shutdown barrier on behalf of every manager that was never spawned, so
    /// the ones that were are not left waiting for them.
    fn release_unspawned(&self, worker_count: usize) {
        for _ in self.managers.len()..worker_count {
            self.stop_flag.manager_done(Duration::ZERO);
        }
    }
}

impl ManagerGroup {
    pub fn new(
        config: RunConfig,
        implementations: TestImplementations,
        logger: Arc<dyn StructuredLogger>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            implementations: Arc::new(implementations),
            logger,
            run: None,
        }
    }

    /// Runs `tests` to completion, returning the overall exit code.
    pub fn run(&mut self, tests: TestsByType) -> Result<ExitCode, ManagerGroupError> {
        self.start(tests)?;
        self.wait(None);
        Ok(self.exit_code())
    }

    /// Builds the queue for `tests` and starts its managers without waiting for them.
    ///
    /// Returns the number of managers started.
    pub fn start(&mut self, tests: TestsByType) -> Result<usize, ManagerGroupError> {
        if self.run.is_some() {
            return Err(ManagerGroupError::AlreadyStarted);
        }

        let tests = self.config.chunker()?.filter(tests);
        let builder = TestQueueBuilder::from_policy(&self.config.group_policy, self.config.processes)?;
        let (queue, worker_count) = builder.make_queue(&tests)?;

        tracing::info!(
            num_groups = queue.len(),
            worker_count,
            "starting test runner managers"
        );
        self.logger.suite_start(&tests);

        let mut run = ActiveRun {
            queue: Arc::new(queue),
            stop_flag: StopFlag::new(worker_count),
            managers: Vec::with_capacity(worker_count),
            leftover_skipped: 0,
            suite_ended: false,
        };

        for index in 0..worker_count {
            let summary = Arc::new(Mutex::new(ManagerSummary::default()));
            let manager = TestRunnerManager::new(ManagerEnv {
                index,
                config: Arc::clone(&self.config),
                implementations: Arc::clone(&self.implementations),
                queue: Arc::clone(&run.queue),
                stop_flag: run.stop_flag.clone(),
                logger: Arc::clone(&self.logger),
                summary: Arc::clone(&summary),
            });
            let name = manager.name().to_owned();

            match thread::Builder::new()
                .name(name.clone())
                .spawn(move || manager.run())
            {
                Ok(thread) => run.managers.push(RunningManager {
                    name,
                    summary,
                    thread: Some(thread),
                }),
                Err(error) => {
                    tracing::error!(?error, manager = %name, "failed to spawn manager");
                    // The managers that did start see the stop and wind down.
                    run.stop_flag.stop();
                    run.release_unspawned(worker_count);
                    self.run = Some(run);
                    return Err(ManagerGroupError::Spawn(error));
                }
            }
        }

        self.run = Some(run);
        Ok(worker_count)
    }

    /// Requests that every manager stop. Returns immediately; see [ManagerGroup::wait].
    pub fn stop(&self) {
        if let Some(run) = &self.run {
            run.stop_flag.stop();
        }
    }

    /// Waits up to `timeout` (or indefinitely, for `None`) for every manager to finish its
    /// cleanup. Returns whether they all did.
    ///
    /// May be called again after a call that timed out. The first call that observes every
    /// manager finished reports tests nobody took off the queue as skipped, and ends the suite.
    pub fn wait(&mut self, timeout: Option<Duration>) -> bool {
        let Some(run) = self.run.as_mut() else {
            return true;
        };

        if !run.stop_flag.wait_all(timeout) {
            tracing::debug!(
                done = run.stop_flag.managers_done(),
                total = run.stop_flag.num_managers(),
                groups_left = run.queue.remaining(),
                "timed out waiting for managers"
            );
            return false;
        }

        for manager in &mut run.managers {
            let Some(thread) = manager.thread.take() else {
                continue;
            };
            if thread.join().is_err() {
                self.logger
                    .critical(&format!("{} exited with a panic", manager.name));
                manager.summary.lock().errored = true;
            }
        }

        if !run.suite_ended {
            for group in run.queue.drain() {
                let subsuite = &group.subsuite;
                for test in &group.tests {
                    self.logger.test_start(&test.id, subsuite);
                    let result = HarnessResult::for_test(test, Status::Skip)
                        .with_message("no manager was left to run this test");
                    self.logger.test_end(&test.id, &result, subsuite);
                    run.leftover_skipped += 1;
                }
            }
            if run.leftover_skipped > 0 {
                self.logger.warning(&format!(
                    "Skipped {} tests that were never started",
                    run.leftover_skipped
                ));
            }
            self.logger.suite_end();
            run.suite_ended = true;
        }
        true
    }

    /// Whether any manager thread is still running.
    pub fn is_alive(&self) -> bool {
        self.run.as_ref().map_or(false, |run| {
            run.managers.iter().any(|manager| {
                manager
                    .thread
                    .as_ref()
                    .map_or(false, |thread| !thread.is_finished())
            })
        })
    }

    /// Everything recorded so far, across all managers.
    pub fn summary(&self) -> ManagerSummary {
        let mut summary = ManagerSummary::default();
        if let Some(run) = &self.run {
            for manager in &run.managers {
                summary.merge(&manager.summary.lock());
            }
            summary.skipped += run.leftover_skipped;
        }
        summary
    }

    pub fn test_count(&self) -> usize {
        self.summary().total_tests()
    }

    pub fn test_counts(&self) -> BTreeMap<TestKey, usize> {
        self.summary().test_count
    }

    pub fn unexpected_fail_tests(&self) -> BTreeMap<TestKey, Vec<TestId>> {
        self.summary().unexpected_fail
    }

    pub fn unexpected_pass_tests(&self) -> BTreeMap<TestKey, Vec<TestId>> {
        self.summary().unexpected_pass
    }

    pub fn exit_code(&self) -> ExitCode {
        let summary = self.summary();
        if summary.errored {
            ExitCode::HARNESS_ERROR
        } else if summary.has_unexpected() {
            ExitCode::UNEXPECTED
        } else {
            ExitCode::SUCCESS
        }
    }
}

impl std::fmt::Debug for ManagerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("ManagerGroup");
        if let Some(run) = &self.run {
            debug
                .field("managers", &run.managers.len())
                .field("stop_flag", &run.stop_flag);
        }
        debug.finish()
    }
}
