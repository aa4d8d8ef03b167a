use std::collections::VecDeque;
use std::sync::Arc;

use wtr_queue::{GroupId, GroupMetadata, Test, TestGroup, TestKey};

use crate::executor::TestImplementation;
use crate::messages::Serial;

/// The group a manager is working through.
#[derive(Debug, Clone)]
pub struct ActiveGroup {
    pub id: GroupId,
    pub key: TestKey,
    /// Tests of the group not yet taken.
    pub remaining: VecDeque<Arc<Test>>,
    pub metadata: GroupMetadata,
    pub implementation: Arc<TestImplementation>,
}

impl ActiveGroup {
    pub fn new(group: TestGroup, implementation: Arc<TestImplementation>) -> Self {
        let key = group.key();
        Self {
            id: group.id,
            key,
            remaining: group.tests,
            metadata: group.metadata,
            implementation,
        }
    }
}

/// A test the manager has taken, along with the group it came from.
#[derive(Debug, Clone)]
pub struct CurrentTest {
    pub test: Arc<Test>,
    pub group: ActiveGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// The test has not been dispatched yet.
    Starting,
    /// The test was dispatched and its result is outstanding.
    InFlight { serial: Serial },
    /// The test ended and the worker is waiting for the browser to be released.
    Paused,
}

#[derive(Debug)]
pub enum RunnerManagerState {
    BeforeInit,
    Initializing {
        current: CurrentTest,
        failure_count: usize,
    },
    Running {
        current: CurrentTest,
        phase: RunPhase,
    },
    Restarting {
        current: CurrentTest,
        force_stop: bool,
    },
    SwitchingExecutor {
        current: CurrentTest,
    },
    Error,
    Stop {
        force_stop: bool,
    },
}

impl RunnerManagerState {
    pub fn name(&self) -> &'static str {
        match self {
            RunnerManagerState::BeforeInit => "before_init",
            RunnerManagerState::Initializing { .. } => "initializing",
            RunnerManagerState::Running { .. } => "running",
            RunnerManagerState::Restarting { .. } => "restarting",
            RunnerManagerState::SwitchingExecutor { .. } => "switching_executor",
            RunnerManagerState::Error => "error",
            RunnerManagerState::Stop { .. } => "stop",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunnerManagerState::Error | RunnerManagerState::Stop { .. }
        )
    }

    /// Whether the browser should be killed rather than asked to exit when the manager cleans up.
    pub fn force_stop(&self) -> bool {
        !matches!(self, RunnerManagerState::Stop { force_stop: false })
    }

    /// Work the manager still holds in this state: the current test, if it has not ended,
    /// and the rest of its group.
    pub fn into_pending(self) -> Option<PendingWork> {
        let (current, phase) = match self {
            RunnerManagerState::Initializing { current, .. }
            | RunnerManagerState::Restarting { current, .. }
            | RunnerManagerState::SwitchingExecutor { current } => (current, RunPhase::Starting),
            RunnerManagerState::Running { current, phase } => (current, phase),
            RunnerManagerState::BeforeInit
            | RunnerManagerState::Error
            | RunnerManagerState::Stop { .. } => return None,
        };
        let CurrentTest { test, group } = current;
        let test = match phase {
            RunPhase::Starting => Some((test, false)),
            RunPhase::InFlight { .. } => Some((test, true)),
            RunPhase::Paused => None,
        };
        Some(PendingWork { test, group })
    }
}

#[derive(Debug)]
pub struct PendingWork {
    /// A test that has not ended, and whether it was already reported as started.
    pub test: Option<(Arc<Test>, bool)>,
    pub group: ActiveGroup,
}
