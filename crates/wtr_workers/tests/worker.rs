use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::Duration;

use ntest::timeout;
use wtr_queue::{GroupMetadata, Status, Test, TestType};
use wtr_test_utils::{FakeBrowserFactory, FakeExecutorFactory, TestScript};
use wtr_workers::executor::{ExecutorBrowser, TestImplementation};
use wtr_workers::messages::{Command, ManagerEvent};
use wtr_workers::worker::{WorkerEnv, WorkerHandle};

fn env(executor: FakeExecutorFactory) -> WorkerEnv {
    WorkerEnv {
        name: "worker-test".to_owned(),
        implementation: Arc::new(TestImplementation::new(
            Arc::new(executor),
            Arc::new(FakeBrowserFactory::default()),
        )),
        executor_browser: ExecutorBrowser::default(),
        sanitizer: false,
    }
}

fn next(events: &Receiver<ManagerEvent>) -> ManagerEvent {
    events.recv_timeout(Duration::from_secs(5)).unwrap()
}

fn test(id: &str) -> Arc<Test> {
    Arc::new(Test::new(id, TestType::Testharness, Duration::from_secs(1)))
}

#[test]
#[timeout(10000)]
fn runs_tests_and_reports_results() {
    let (tx, events) = mpsc::channel();
    let worker = WorkerHandle::spawn(env(FakeExecutorFactory::default()), tx).unwrap();
    assert!(matches!(next(&events), ManagerEvent::InitSucceeded));

    let mut metadata = GroupMetadata::new();
    metadata.increment("url_count");
    worker.send(Command::RunTest {
        serial: 7,
        test: test("/a.html"),
        group_metadata: metadata,
    });
    match next(&events) {
        ManagerEvent::TestEnded {
            serial,
            test,
            outcome,
            group_metadata,
        } => {
            assert_eq!(serial, 7);
            assert_eq!(test.as_str(), "/a.html");
            assert_eq!(outcome.harness.status, Status::Ok);
            // The fake executor bumps the counter once per test.
            assert_eq!(group_metadata.unwrap().counter("url_count"), 2);
        }
        other => panic!("unexpected {other:?}"),
    }

    assert!(worker.stop(Duration::from_secs(5)));
}

#[test]
#[timeout(10000)]
fn failed_setup_reports_init_failed() {
    let executor = FakeExecutorFactory::default().fail_setup();
    let (tx, events) = mpsc::channel();
    let worker = WorkerHandle::spawn(env(executor), tx).unwrap();
    assert!(matches!(next(&events), ManagerEvent::InitFailed));
    assert!(worker.stop(Duration::from_secs(5)));
}

#[test]
#[timeout(10000)]
fn command_errors_are_reported_and_the_loop_continues() {
    let executor = FakeExecutorFactory::default()
        .script("/error.html", TestScript::ExecutorError)
        .script("/panic.html", TestScript::Panic);
    let (tx, events) = mpsc::channel();
    let worker = WorkerHandle::spawn(env(executor), tx).unwrap();
    assert!(matches!(next(&events), ManagerEvent::InitSucceeded));

    for (serial, id) in [(1, "/error.html"), (2, "/panic.html")] {
        worker.send(Command::RunTest {
            serial,
            test: test(id),
            group_metadata: GroupMetadata::new(),
        });
        assert!(matches!(next(&events), ManagerEvent::Error { .. }));
    }

    worker.send(Command::RunTest {
        serial: 3,
        test: test("/fine.html"),
        group_metadata: GroupMetadata::new(),
    });
    assert!(matches!(
        next(&events),
        ManagerEvent::TestEnded { serial: 3, .. }
    ));
    assert!(worker.is_alive());
    assert!(worker.stop(Duration::from_secs(5)));
}

#[test]
#[timeout(10000)]
fn switch_executor_requires_matching_protocol() {
    let (tx, events) = mpsc::channel();
    let worker = WorkerHandle::spawn(env(FakeExecutorFactory::default()), tx).unwrap();
    assert!(matches!(next(&events), ManagerEvent::InitSucceeded));

    let same_protocol = env(FakeExecutorFactory::named("other")).implementation;
    worker.send(Command::SwitchExecutor {
        implementation: same_protocol,
    });
    assert!(matches!(next(&events), ManagerEvent::SwitchExecutorSucceeded));

    let other_protocol =
        env(FakeExecutorFactory::named("other").protocol("marionette")).implementation;
    worker.send(Command::SwitchExecutor {
        implementation: other_protocol,
    });
    assert!(matches!(next(&events), ManagerEvent::SwitchExecutorFailed));

    assert!(worker.stop(Duration::from_secs(5)));
}

#[test]
#[timeout(10000)]
fn wait_reports_rerun() {
    let executor = FakeExecutorFactory::default().rerun_after_wait(true);
    let (tx, events) = mpsc::channel();
    let worker = WorkerHandle::spawn(env(executor), tx).unwrap();
    assert!(matches!(next(&events), ManagerEvent::InitSucceeded));

    worker.send(Command::Wait);
    assert!(matches!(
        next(&events),
        ManagerEvent::WaitFinished { rerun: true }
    ));
    assert!(worker.stop(Duration::from_secs(5)));
}

#[test]
#[timeout(10000)]
fn hung_worker_is_abandoned() {
    let executor = FakeExecutorFactory::default().script(
        "/hang.html",
        TestScript::Hang(Duration::from_secs(2)),
    );
    let (tx, events) = mpsc::channel();
    let worker = WorkerHandle::spawn(env(executor), tx).unwrap();
    assert!(matches!(next(&events), ManagerEvent::InitSucceeded));

    worker.send(Command::RunTest {
        serial: 1,
        test: test("/hang.html"),
        group_metadata: GroupMetadata::new(),
    });
    assert!(!worker.stop(Duration::from_millis(50)));
}

#[test]
#[timeout(10000)]
fn killed_worker_reports_nothing() {
    let executor = FakeExecutorFactory::default().script("/kill.html", TestScript::KillWorker);
    let (tx, events) = mpsc::channel();
    let worker = WorkerHandle::spawn(env(executor), tx).unwrap();
    assert!(matches!(next(&events), ManagerEvent::InitSucceeded));

    worker.send(Command::RunTest {
        serial: 1,
        test: test("/kill.html"),
        group_metadata: GroupMetadata::new(),
    });
    // The thread is gone without a word; its sender was dropped with it.
    assert!(events.recv_timeout(Duration::from_secs(5)).is_err());
    while worker.is_alive() {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!worker.send(Command::Reset));
    assert!(worker.stop(Duration::from_secs(1)));
}
