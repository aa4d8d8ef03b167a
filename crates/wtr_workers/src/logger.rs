//! The structured log that results are reported through.

use serde_json::Value;
use wtr_queue::{SubsuiteName, TestId, TestsByType};

use crate::results::{HarnessResult, SubtestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
}

/// Consumer of everything a run reports.
///
/// Statuses passed here are already sanitized: harness-internal statuses never appear.
pub trait StructuredLogger: Send + Sync {
    fn suite_start(&self, tests: &TestsByType);

    fn suite_end(&self);

    fn test_start(&self, test: &TestId, subsuite: &SubsuiteName);

    fn test_status(&self, test: &TestId, result: &SubtestResult, subsuite: &SubsuiteName);

    fn test_end(&self, test: &TestId, result: &HarnessResult, subsuite: &SubsuiteName);

    fn log(&self, level: LogLevel, message: &str);

    fn critical(&self, message: &str) {
        self.log(LogLevel::Critical, message)
    }

    fn error(&self, message: &str) {
        self.log(LogLevel::Error, message)
    }

    fn warning(&self, message: &str) {
        self.log(LogLevel::Warning, message)
    }

    fn info(&self, message: &str) {
        self.log(LogLevel::Info, message)
    }

    fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message)
    }
}

/// Reports everything as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl StructuredLogger for TracingLogger {
    fn suite_start(&self, tests: &TestsByType) {
        let num_tests: usize = tests.values().map(Vec::len).sum();
        tracing::info!(num_tests, num_buckets = tests.len(), "suite_start");
    }

    fn suite_end(&self) {
        tracing::info!("suite_end");
    }

    fn test_start(&self, test: &TestId, subsuite: &SubsuiteName) {
        tracing::info!(%test, %subsuite, "test_start");
    }

    fn test_status(&self, test: &TestId, result: &SubtestResult, subsuite: &SubsuiteName) {
        tracing::info!(
            %test,
            %subsuite,
            subtest = %result.name,
            status = %result.status,
            expected = %result.expected.status,
            known_intermittent = ?result.expected.known_intermittent,
            details = result.message.as_deref(),
            stack = result.stack.as_deref(),
            "test_status"
        );
    }

    fn test_end(&self, test: &TestId, result: &HarnessResult, subsuite: &SubsuiteName) {
        let extra = (!result.extra.is_empty()).then(|| Value::Object(result.extra.clone()));
        tracing::info!(
            %test,
            %subsuite,
            status = %result.status,
            expected = %result.expected.status,
            known_intermittent = ?result.expected.known_intermittent,
            details = result.message.as_deref(),
            extra = extra.as_ref().map(tracing::field::display),
            stack = result.stack.as_deref(),
            "test_end"
        );
    }

    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Critical => tracing::error!(critical = true, "{}", message),
            LogLevel::Error => tracing::error!("{}", message),
            LogLevel::Warning => tracing::warn!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Debug => tracing::debug!("{}", message),
        }
    }
}
