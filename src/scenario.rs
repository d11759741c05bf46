//! Scenario runner
//!
//! Runs scenario bodies one by one or side by side and reports each as
//! PASS/FAIL. Every scenario gets its own [`CleanupStack`]. The stack unwinds
//! after the body returns, fails, panics or overruns its deadline, and its
//! result is reported next to the outcome rather than folded into it.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::cleanup::{CleanupStack, TeardownReport};
use crate::{FailureCategory, Result};

/// Longest error text printed in the summary
const MAX_SUMMARY_ERROR: usize = 200;

/// How a scenario body ended
#[derive(Debug)]
pub enum Outcome {
    /// Every check held
    Passed,
    /// The body returned an error
    Failed {
        /// Which side the failure implicates
        category: FailureCategory,
        /// Error text
        message: String,
    },
    /// The body panicked
    Panicked(String),
    /// The body was still running at the scenario deadline
    DeadlineExceeded(Duration),
}

impl Outcome {
    /// True for [`Outcome::Passed`]
    pub fn passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    /// Triage bucket of a failed outcome
    pub fn category(&self) -> Option<FailureCategory> {
        match self {
            Self::Passed => None,
            Self::Failed { category, .. } => Some(*category),
            Self::Panicked(_) => Some(FailureCategory::Environment),
            Self::DeadlineExceeded(_) => Some(FailureCategory::SystemUnderTest),
        }
    }

    fn message(&self) -> Option<String> {
        match self {
            Self::Passed => None,
            Self::Failed { message, .. } => Some(message.clone()),
            Self::Panicked(msg) => Some(format!("PANIC: {msg}")),
            Self::DeadlineExceeded(deadline) => {
                Some(format!("scenario deadline of {deadline:?} exceeded"))
            }
        }
    }
}

/// Result of one scenario: what happened, and what teardown left behind
#[derive(Debug)]
pub struct ScenarioReport {
    /// Scenario name
    pub name: String,
    /// Outcome of the body
    pub outcome: Outcome,
    /// Outcome of unwinding the cleanup stack
    pub teardown: TeardownReport,
    /// Wall time including teardown
    pub duration: Duration,
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run one scenario body under `deadline`, then unwind its cleanup stack
pub async fn run_scenario<F, Fut>(name: &str, deadline: Duration, body: F) -> ScenarioReport
where
    F: FnOnce(CleanupStack) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let start = Instant::now();
    let cleanup = CleanupStack::new();
    info!(scenario = %name, "Scenario starting");

    let guarded = AssertUnwindSafe(body(cleanup.clone())).catch_unwind();
    let outcome = match tokio::time::timeout(deadline, guarded).await {
        Ok(Ok(Ok(()))) => Outcome::Passed,
        Ok(Ok(Err(e))) => Outcome::Failed {
            category: e.category(),
            message: e.to_string(),
        },
        Ok(Err(panic)) => Outcome::Panicked(panic_message(panic.as_ref())),
        Err(_) => Outcome::DeadlineExceeded(deadline),
    };

    match &outcome {
        Outcome::Passed => info!(scenario = %name, "Scenario passed"),
        other => error!(
            scenario = %name,
            category = ?other.category(),
            error = %other.message().unwrap_or_default(),
            "Scenario failed, tearing down"
        ),
    }

    let teardown = cleanup.run_all().await;
    if !teardown.is_clean() {
        warn!(
            scenario = %name,
            failures = teardown.failures.len(),
            "Teardown left resources behind"
        );
    }

    ScenarioReport {
        name: name.to_string(),
        outcome,
        teardown,
        duration: start.elapsed(),
    }
}

/// Counts behind a suite verdict
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SuiteSummary {
    /// Scenarios that passed
    pub passed: usize,
    /// Failures blamed on the reconciler
    pub system_under_test_failures: usize,
    /// Failures blamed on the harness or its environment
    pub environment_failures: usize,
    /// Cleanup actions that failed, across all scenarios
    pub teardown_failures: usize,
}

impl SuiteSummary {
    /// True when every scenario passed and every teardown completed
    pub fn is_green(&self) -> bool {
        self.system_under_test_failures == 0
            && self.environment_failures == 0
            && self.teardown_failures == 0
    }
}

/// Collects scenario reports and prints the run-all summary
pub struct Suite {
    name: String,
    deadline: Duration,
    reports: Mutex<Vec<ScenarioReport>>,
}

impl Suite {
    /// `deadline` applies to each scenario separately
    pub fn new(name: &str, deadline: Duration) -> Self {
        Self {
            name: name.to_string(),
            deadline,
            reports: Mutex::new(Vec::new()),
        }
    }

    /// Run a scenario and record its report; safe to call concurrently
    pub async fn run<F, Fut>(&self, name: &str, body: F)
    where
        F: FnOnce(CleanupStack) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let report = run_scenario(name, self.deadline, body).await;
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report);
    }

    /// Log the summary table and return the counts behind it
    pub fn finish(&self) -> SuiteSummary {
        let reports = self.reports.lock().unwrap_or_else(PoisonError::into_inner);
        let mut summary = SuiteSummary::default();
        let total_duration: Duration = reports.iter().map(|r| r.duration).sum();

        info!("========================================");
        info!("  {}", self.name.to_uppercase());
        info!("========================================");
        for r in reports.iter() {
            let tag = if r.outcome.passed() { "PASS" } else { "FAIL" };
            info!("  {tag}  {:48} {:.1}s", r.name, r.duration.as_secs_f64());

            match r.outcome.category() {
                None => summary.passed += 1,
                Some(FailureCategory::SystemUnderTest) => summary.system_under_test_failures += 1,
                Some(FailureCategory::Environment) => summary.environment_failures += 1,
            }
            if let (Some(category), Some(message)) = (r.outcome.category(), r.outcome.message()) {
                info!("        -> [{category}] {}", truncate(&message));
            }
            for failure in r.teardown.failure_messages() {
                summary.teardown_failures += 1;
                info!("        LEAK {}", truncate(&failure));
            }
        }
        info!("----------------------------------------");
        info!(
            "  {} passed, {} failed ({} system-under-test, {} environment) in {:.1}s",
            summary.passed,
            summary.system_under_test_failures + summary.environment_failures,
            summary.system_under_test_failures,
            summary.environment_failures,
            total_duration.as_secs_f64()
        );
        if summary.teardown_failures > 0 {
            info!("  {} teardown action(s) failed", summary.teardown_failures);
        }
        info!("========================================");

        summary
    }
}

fn truncate(message: &str) -> &str {
    match message.char_indices().nth(MAX_SUMMARY_ERROR) {
        Some((idx, _)) => &message[..idx],
        None => message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::Arc;

    fn record_cleanup(stack: &CleanupStack, log: &Arc<Mutex<Vec<String>>>, name: &'static str) {
        let log = log.clone();
        stack.register_fn(name, move || {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(name.to_string());
                Ok(())
            }
        });
    }

    #[tokio::test]
    async fn passing_scenario_still_tears_down() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();

        let report = run_scenario("infra", Duration::from_secs(60), |cleanup| async move {
            record_cleanup(&cleanup, &l, "delete network");
            Ok(())
        })
        .await;

        assert!(report.outcome.passed());
        assert!(report.teardown.is_clean());
        assert_eq!(*log.lock().unwrap(), vec!["delete network"]);
    }

    /// Story: a verification failure is blamed on the reconciler, not the harness
    #[tokio::test]
    async fn story_failure_is_reported_with_its_category() {
        let report = run_scenario("infra", Duration::from_secs(60), |_| async {
            Err(Error::mismatch("subnet-cidr", "expected 10.250.0.0/16"))
        })
        .await;

        match report.outcome {
            Outcome::Failed { category, message } => {
                assert_eq!(category, FailureCategory::SystemUnderTest);
                assert!(message.contains("subnet-cidr"));
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
    }

    /// Story: a panicking scenario body still releases its cloud resources
    #[tokio::test]
    async fn story_panic_is_caught_and_cleanup_runs() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();

        let report = run_scenario("bastion", Duration::from_secs(60), |cleanup| async move {
            record_cleanup(&cleanup, &l, "delete security group");
            if !cleanup.is_empty() {
                panic!("index out of bounds");
            }
            Ok(())
        })
        .await;

        assert!(matches!(report.outcome, Outcome::Panicked(ref msg) if msg.contains("index out of bounds")));
        assert_eq!(*log.lock().unwrap(), vec!["delete security group"]);
    }

    /// Story: a hung wait is cut off at the deadline and teardown still runs
    #[tokio::test(start_paused = true)]
    async fn story_deadline_cancels_body_but_not_teardown() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();

        let report = run_scenario("infra", Duration::from_secs(3600), |cleanup| async move {
            record_cleanup(&cleanup, &l, "delete infrastructure");
            tokio::time::sleep(Duration::from_secs(7200)).await;
            Ok(())
        })
        .await;

        assert!(matches!(report.outcome, Outcome::DeadlineExceeded(_)));
        assert_eq!(report.outcome.category(), Some(FailureCategory::SystemUnderTest));
        assert_eq!(*log.lock().unwrap(), vec!["delete infrastructure"]);
    }

    #[tokio::test]
    async fn teardown_failures_are_kept_apart_from_the_outcome() {
        let report = run_scenario("infra", Duration::from_secs(60), |cleanup| async move {
            cleanup.register_fn("delete router", || async {
                Err(Error::provider(409, "router has ports"))
            });
            Ok(())
        })
        .await;

        assert!(report.outcome.passed());
        assert_eq!(report.teardown.failures.len(), 1);
    }

    #[tokio::test]
    async fn suite_summary_counts_by_category() {
        let suite = Suite::new("infrastructure", Duration::from_secs(60));
        suite.run("passes", |_| async { Ok(()) }).await;
        suite
            .run("reconciler broke", |_| async {
                Err(Error::mismatch("router-ip", "differs"))
            })
            .await;
        suite
            .run("cloud broke", |_| async { Err(Error::setup("quota exceeded")) })
            .await;
        suite
            .run("leaks", |cleanup| async move {
                cleanup.register_fn("delete network", || async {
                    Err(Error::provider(500, "neutron down"))
                });
                Ok(())
            })
            .await;

        let summary = suite.finish();
        assert_eq!(
            summary,
            SuiteSummary {
                passed: 2,
                system_under_test_failures: 1,
                environment_failures: 1,
                teardown_failures: 1,
            }
        );
        assert!(!summary.is_green());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let long = "ä".repeat(300);
        assert_eq!(truncate(&long).chars().count(), MAX_SUMMARY_ERROR);
        assert_eq!(truncate("short"), "short");
    }
}
