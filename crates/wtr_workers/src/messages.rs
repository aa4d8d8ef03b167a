//! Messages between a manager and the worker it drives.
//!
//! Commands flow from a manager to its one worker. Events flow back to the manager from the
//! worker, and from timers the manager arms; the manager is the single consumer of its events.

use std::sync::Arc;

use wtr_queue::{GroupMetadata, Test, TestId};

use crate::executor::TestImplementation;
use crate::results::TestOutcome;

/// Identifies one dispatch of a test, so that a late or duplicate result can be told apart from
/// the one the manager is waiting for.
pub type Serial = u64;

#[derive(Debug)]
pub enum Command {
    RunTest {
        serial: Serial,
        test: Arc<Test>,
        group_metadata: GroupMetadata,
    },
    /// Replace the executor, keeping its protocol connection.
    SwitchExecutor {
        implementation: Arc<TestImplementation>,
    },
    Reset,
    /// Block until the browser exits or is resumed, then report [ManagerEvent::WaitFinished].
    Wait,
    Stop,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::RunTest { .. } => "run_test",
            Command::SwitchExecutor { .. } => "switch_executor",
            Command::Reset => "reset",
            Command::Wait => "wait",
            Command::Stop => "stop",
        }
    }
}

#[derive(Debug)]
pub enum ManagerEvent {
    InitSucceeded,
    InitFailed,
    TestEnded {
        serial: Serial,
        test: TestId,
        outcome: TestOutcome,
        /// Metadata as the test left it. Absent when the result was synthesized by the manager.
        group_metadata: Option<GroupMetadata>,
    },
    WaitFinished {
        rerun: bool,
    },
    SwitchExecutorSucceeded,
    SwitchExecutorFailed,
    /// A command failed on the worker. The worker is still alive.
    Error {
        message: String,
    },
}

impl ManagerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ManagerEvent::InitSucceeded => "init_succeeded",
            ManagerEvent::InitFailed => "init_failed",
            ManagerEvent::TestEnded { .. } => "test_ended",
            ManagerEvent::WaitFinished { .. } => "wait_finished",
            ManagerEvent::SwitchExecutorSucceeded => "switch_executor_succeeded",
            ManagerEvent::SwitchExecutorFailed => "switch_executor_failed",
            ManagerEvent::Error { .. } => "error",
        }
    }
}
