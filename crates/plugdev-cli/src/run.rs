//! Test run aggregation.
//!
//! Code running inside the target posts lifecycle events; this module only
//! counts them and decides when the run is over.

use plugdev_core::TestConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle event types posted by the in-target test runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    Start,
    Suite,
    SuiteEnd,
    Pending,
    Pass,
    Fail,
    End,
    Debug,
}

/// One posted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl TestEvent {
    /// Test or suite title, if the event carries one.
    pub fn title(&self) -> Option<&str> {
        let data = self.data.as_ref()?;
        data.as_str().or_else(|| {
            data.get("fullTitle")
                .or_else(|| data.get("title"))
                .and_then(Value::as_str)
        })
    }

    /// Failure message of a `fail` event.
    pub fn error_message(&self) -> Option<&str> {
        let data = self.data.as_ref()?;
        let err = data.get("err").or_else(|| data.get("error"))?;
        err.as_str()
            .or_else(|| err.get("message").and_then(Value::as_str))
    }
}

/// Why a test run ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A test failed with abort-on-fail set.
    Aborted,
    /// The suite reported its end with exit-on-finish set.
    Finished { all_passed: bool },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Aborted => 1,
            RunOutcome::Finished { all_passed: true } => 0,
            RunOutcome::Finished { all_passed: false } => 1,
        }
    }
}

/// Aggregate of one test run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestRun {
    pub passed: u32,
    pub failed: u32,
    pub pending: u32,
    /// Stopped by abort-on-fail before the suite ended.
    pub aborted: bool,
    /// No further events are counted.
    pub finished: bool,
}

impl TestRun {
    /// Count `event`. Returns an outcome when the run should end the session.
    ///
    /// Events after the run finished are ignored.
    pub fn record(&mut self, event: &TestEvent, policy: &TestConfig) -> Option<RunOutcome> {
        if self.finished {
            return None;
        }

        match event.kind {
            EventType::Pass => self.passed += 1,
            EventType::Pending => self.pending += 1,
            EventType::Fail => {
                self.failed += 1;
                if policy.abort_on_fail {
                    self.aborted = true;
                    self.finished = true;
                    return Some(RunOutcome::Aborted);
                }
            }
            EventType::End => {
                self.finished = true;
                if policy.exit_on_finish {
                    return Some(RunOutcome::Finished {
                        all_passed: self.all_passed(),
                    });
                }
            }
            EventType::Start | EventType::Suite | EventType::SuiteEnd | EventType::Debug => {}
        }
        None
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0 && !self.aborted
    }

    /// Exit code for this run when the session ends for another reason.
    pub fn exit_code(&self) -> i32 {
        if self.all_passed() {
            0
        } else {
            1
        }
    }

    /// One-line summary.
    pub fn summary(&self) -> String {
        let mut summary = format!("{} passing, {} failing", self.passed, self.failed);
        if self.pending > 0 {
            summary.push_str(&format!(", {} pending", self.pending));
        }
        if self.aborted {
            summary.push_str(" (aborted)");
        }
        summary
    }
}
