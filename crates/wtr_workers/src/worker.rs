//! The worker side of a manager/worker pair: a thread that owns one executor and runs the
//! commands its manager sends it, one at a time.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use wtr_queue::{GroupMetadata, Test};

use crate::executor::{Executor, ExecutorBrowser, TestImplementation};
use crate::messages::{Command, ManagerEvent, Serial};
use crate::sanitizer::SanitizerExecutor;

/// How often [WorkerHandle::stop] checks whether the worker has exited.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Everything a worker needs to build its executor.
#[derive(Clone)]
pub struct WorkerEnv {
    pub name: String,
    pub implementation: Arc<TestImplementation>,
    pub executor_browser: ExecutorBrowser,
    pub sanitizer: bool,
}

/// The manager's handle to a running worker.
pub struct WorkerHandle {
    name: String,
    commands: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Starts a worker. It reports [ManagerEvent::InitSucceeded] or [ManagerEvent::InitFailed]
    /// on `events` before accepting any command.
    pub fn spawn(env: WorkerEnv, events: Sender<ManagerEvent>) -> io::Result<Self> {
        let (commands, commands_rx) = mpsc::channel();
        let name = env.name.clone();
        let span = tracing::debug_span!("worker", name = %name);
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            let _entered = span.enter();
            TestRunner::start(env, events, commands_rx)
        })?;
        Ok(Self {
            name,
            commands,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends a command. Returns false if the worker has already exited.
    pub fn send(&self, command: Command) -> bool {
        let name = command.name();
        match self.commands.send(command) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(worker = %self.name, command = name, "worker is gone");
                false
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.thread
            .as_ref()
            .map_or(false, |thread| !thread.is_finished())
    }

    /// Asks the worker to stop, waiting up to `grace` for it to exit.
    ///
    /// A worker that does not exit in time is abandoned: its thread is detached and anything it
    /// sends afterwards must be discarded by the caller. Returns whether the worker exited.
    pub fn stop(self, grace: Duration) -> bool {
        self.request_stop();
        self.join(grace)
    }

    /// Queues [Command::Stop] behind whatever the worker is doing, without waiting.
    pub fn request_stop(&self) {
        self.send(Command::Stop);
    }

    /// Waits up to `grace` for a worker that was asked to stop to exit. See [WorkerHandle::stop].
    pub fn join(mut self, grace: Duration) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };

        let deadline = Instant::now() + grace;
        while !thread.is_finished() && Instant::now() < deadline {
            thread::sleep(STOP_POLL_INTERVAL);
        }

        if !thread.is_finished() {
            tracing::warn!(
                worker = %self.name,
                ?grace,
                "worker did not exit after stop, abandoning it"
            );
            return false;
        }

        if thread.join().is_err() {
            tracing::error!(worker = %self.name, "worker thread panicked outside of a command");
        }
        true
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("alive", &self.is_alive())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// The worker's command loop.
struct TestRunner {
    env: WorkerEnv,
    executor: Box<dyn Executor>,
    events: Sender<ManagerEvent>,
}

impl TestRunner {
    fn start(env: WorkerEnv, events: Sender<ManagerEvent>, commands: Receiver<Command>) {
        let setup = panic::catch_unwind(AssertUnwindSafe(|| Self::setup(&env)));
        let executor = match setup {
            Ok(Ok(executor)) => executor,
            Ok(Err(error)) => {
                tracing::error!(?error, "executor setup failed");
                let _ = events.send(ManagerEvent::InitFailed);
                return;
            }
            Err(panic) => {
                tracing::error!(panic = %panic_message(&*panic), "executor setup panicked");
                let _ = events.send(ManagerEvent::InitFailed);
                return;
            }
        };

        let _ = events.send(ManagerEvent::InitSucceeded);

        let mut runner = Self {
            env,
            executor,
            events,
        };
        runner.run(commands);
        runner.teardown();
    }

    fn setup(env: &WorkerEnv) -> anyhow::Result<Box<dyn Executor>> {
        let mut executor = build_executor(env, &env.implementation)?;
        executor.setup(None)?;
        Ok(executor)
    }

    fn run(&mut self, commands: Receiver<Command>) {
        // A closed command channel means the manager abandoned this worker.
        while let Ok(command) = commands.recv() {
            if let Command::Stop = command {
                tracing::debug!("stopping");
                break;
            }

            let name = command.name();
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(command)));
            let message = match result {
                Ok(Ok(())) => continue,
                Ok(Err(error)) => format!("{name} failed: {error:#}"),
                Err(panic) => format!("{name} panicked: {}", panic_message(&*panic)),
            };
            tracing::error!(command = name, error = %message, "command failed");
            self.send(ManagerEvent::Error { message });
        }
    }

    fn dispatch(&mut self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::RunTest {
                serial,
                test,
                group_metadata,
            } => self.run_test(serial, test, group_metadata),
            Command::SwitchExecutor { implementation } => {
                self.switch_executor(implementation);
                Ok(())
            }
            Command::Reset => self.executor.reset(),
            Command::Wait => {
                let rerun = self.executor.wait()?;
                self.send(ManagerEvent::WaitFinished { rerun });
                Ok(())
            }
            Command::Stop => Ok(()),
        }
    }

    fn run_test(
        &mut self,
        serial: Serial,
        test: Arc<Test>,
        mut group_metadata: GroupMetadata,
    ) -> anyhow::Result<()> {
        let outcome = match self.executor.run_test(&test, &mut group_metadata) {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(test = %test.id, ?error, "executor failed to run test");
                return Err(error);
            }
        };
        self.send(ManagerEvent::TestEnded {
            serial,
            test: test.id.clone(),
            outcome,
            group_metadata: Some(group_metadata),
        });
        Ok(())
    }

    fn switch_executor(&mut self, implementation: Arc<TestImplementation>) {
        let succeeded = match self.try_switch_executor(&implementation) {
            Ok(()) => {
                self.env.implementation = implementation;
                true
            }
            Err(error) => {
                tracing::warn!(?error, "failed to switch executor");
                false
            }
        };
        self.send(if succeeded {
            ManagerEvent::SwitchExecutorSucceeded
        } else {
            ManagerEvent::SwitchExecutorFailed
        });
    }

    fn try_switch_executor(&mut self, implementation: &TestImplementation) -> anyhow::Result<()> {
        let mut executor = build_executor(&self.env, implementation)?;
        let (old_kind, new_kind) = (self.executor.protocol_kind(), executor.protocol_kind());
        if old_kind != new_kind {
            anyhow::bail!("cannot hand a {old_kind} protocol over to an executor speaking {new_kind}");
        }
        let protocol = self.executor.teardown();
        executor.setup(protocol)?;
        self.executor = executor;
        Ok(())
    }

    fn teardown(&mut self) {
        let teardown = panic::catch_unwind(AssertUnwindSafe(|| self.executor.teardown()));
        if let Err(panic) = teardown {
            tracing::error!(panic = %panic_message(&*panic), "executor teardown panicked");
        }
    }

    fn send(&self, event: ManagerEvent) {
        // The manager may already have moved on from this worker.
        let _ = self.events.send(event);
    }
}

fn build_executor(
    env: &WorkerEnv,
    implementation: &TestImplementation,
) -> anyhow::Result<Box<dyn Executor>> {
    let executor = implementation
        .executor
        .build(&env.executor_browser, &implementation.executor_kwargs)?;
    Ok(SanitizerExecutor::wrap_if(env.sanitizer, executor))
}
