//! Tiered readiness poller
//!
//! One primitive for every eventually-consistent wait the harness performs.
//! A wait has three tiers:
//!
//! - `initial_delay`: sleep before the first fetch, for operations known to take a while
//! - `poll_interval`: cadence of fetch + evaluate after that
//! - `timeout`: hard ceiling, measured from the start of the wait
//!
//! Fetch errors are kept apart from an unsatisfied predicate. A few in a row are
//! tolerated; a run longer than `max_consecutive_fetch_errors` fails the wait,
//! and a fetch error still present at the deadline ends up in the timeout error.
//!
//! All waiting is `tokio::time::sleep`, so tests drive it with a paused clock.

use std::future::Future;
use std::time::Duration;

use kube::ResourceExt;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::crd::{ExtensionObject, LastOperationState, LastOperationType};
use crate::{Error, Result, OPERATION_ANNOTATION};

/// Timing of one wait
#[derive(Clone, Debug, PartialEq)]
pub struct WaitConfig {
    /// Sleep before the first fetch
    pub initial_delay: Duration,
    /// Time between fetches
    pub poll_interval: Duration,
    /// Hard ceiling measured from the start of the wait
    pub timeout: Duration,
    /// Consecutive fetch failures tolerated before giving up
    pub max_consecutive_fetch_errors: u32,
}

const DEFAULT_MAX_FETCH_ERRORS: u32 = 10;

impl WaitConfig {
    /// Build a config from the three tiers
    pub fn new(initial_delay: Duration, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            initial_delay,
            poll_interval,
            timeout,
            max_consecutive_fetch_errors: DEFAULT_MAX_FETCH_ERRORS,
        }
    }

    /// Object readiness after create or reconcile: 10s / 30s / 16min
    pub fn creation() -> Self {
        Self::new(
            Duration::from_secs(10),
            Duration::from_secs(30),
            Duration::from_secs(16 * 60),
        )
    }

    /// Bastion readiness, which includes booting an instance: 60s / 120s / 10min
    pub fn bastion_creation() -> Self {
        Self::new(
            Duration::from_secs(60),
            Duration::from_secs(120),
            Duration::from_secs(10 * 60),
        )
    }

    /// Reconciler picking up the operation annotation: 10s / 30s / 5min
    pub fn reconcile_trigger() -> Self {
        Self::new(
            Duration::from_secs(10),
            Duration::from_secs(30),
            Duration::from_secs(5 * 60),
        )
    }

    /// Object disappearing after delete: 10s / 10s / 16min
    pub fn deletion() -> Self {
        Self::new(
            Duration::from_secs(10),
            Duration::from_secs(10),
            Duration::from_secs(16 * 60),
        )
    }

    /// Provider-side existence propagating after the reconciler is done: 0s / 5s / 60s
    pub fn existence_grace() -> Self {
        Self::new(Duration::ZERO, Duration::from_secs(5), Duration::from_secs(60))
    }

    /// Replace the hard ceiling and return self for chaining
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reject configurations that could never poll
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::validation("poll interval must be positive"));
        }
        if self.timeout < self.poll_interval {
            return Err(Error::validation(format!(
                "timeout {:?} is shorter than poll interval {:?}",
                self.timeout, self.poll_interval
            )));
        }
        if self.max_consecutive_fetch_errors == 0 {
            return Err(Error::validation(
                "max consecutive fetch errors must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Verdict of a predicate over the latest observation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Condition satisfied
    Ready,
    /// Not yet; the reason becomes the last observed status
    Pending(String),
    /// The reconciler reported a terminal failure; stop waiting
    Failed(String),
}

/// Poll until `predicate` accepts the latest fetched observation
///
/// `fetch` yields `Ok(Some(obj))`, `Ok(None)` when the object does not exist,
/// or `Err` for a failed fetch. Returns the observation that satisfied the
/// predicate.
pub async fn wait_until<K, F, Fut, P>(
    what: &str,
    config: &WaitConfig,
    mut fetch: F,
    predicate: P,
) -> Result<Option<K>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<K>>>,
    P: Fn(Option<&K>) -> Readiness,
{
    let start = Instant::now();
    let mut consecutive_errors = 0u32;
    let mut last_observed = "nothing observed yet".to_string();

    info!(
        what = %what,
        timeout_secs = config.timeout.as_secs(),
        "Waiting"
    );

    if !config.initial_delay.is_zero() {
        tokio::time::sleep(config.initial_delay).await;
    }

    loop {
        match fetch().await {
            Ok(observed) => {
                consecutive_errors = 0;
                match predicate(observed.as_ref()) {
                    Readiness::Ready => {
                        info!(
                            what = %what,
                            elapsed_secs = start.elapsed().as_secs(),
                            "Condition satisfied"
                        );
                        return Ok(observed);
                    }
                    Readiness::Pending(reason) => {
                        debug!(what = %what, status = %reason, "Not yet");
                        last_observed = reason;
                    }
                    Readiness::Failed(reason) => {
                        return Err(Error::ReconcileFailed {
                            what: what.to_string(),
                            reason,
                        });
                    }
                }
            }
            Err(e) => {
                consecutive_errors += 1;
                debug!(what = %what, attempt = consecutive_errors, error = %e, "Fetch failed");
                if consecutive_errors >= config.max_consecutive_fetch_errors {
                    return Err(Error::TransientFetch {
                        what: what.to_string(),
                        attempts: consecutive_errors,
                        last_error: e.to_string(),
                    });
                }
                last_observed = format!("fetch error: {e}");
            }
        }

        let elapsed = start.elapsed();
        if elapsed >= config.timeout {
            return Err(Error::ConvergenceTimeout {
                what: what.to_string(),
                elapsed,
                last_observed,
            });
        }

        tokio::time::sleep(config.poll_interval.min(config.timeout - elapsed)).await;
    }
}

// =============================================================================
// Predicates
// =============================================================================

fn operation_annotation(obj: &impl ExtensionObject) -> Option<&str> {
    obj.annotations()
        .get(OPERATION_ANNOTATION)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// The reconciler finished its last operation successfully
///
/// Requires a `Succeeded` last operation for the current generation, no last
/// error and no pending operation annotation. A `Failed` or `Aborted` last
/// operation is terminal. `Error` is not: the reconciler retries those.
pub fn extension_ready<K: ExtensionObject>() -> impl Fn(Option<&K>) -> Readiness {
    |obj| {
        let Some(obj) = obj else {
            return Readiness::Pending("object not found".to_string());
        };
        if let Some(op) = operation_annotation(obj) {
            return Readiness::Pending(format!("operation annotation '{op}' still present"));
        }
        let Some(status) = obj.extension_status() else {
            return Readiness::Pending("no status reported".to_string());
        };
        let Some(last_operation) = status.last_operation.as_ref() else {
            return Readiness::Pending("no lastOperation reported".to_string());
        };

        if last_operation.state.is_terminal_failure() {
            return Readiness::Failed(status.summary());
        }

        let generation = obj.meta().generation.unwrap_or_default();
        let observed = status.observed_generation.unwrap_or_default();
        if observed < generation {
            return Readiness::Pending(format!(
                "observed generation {observed} behind generation {generation}"
            ));
        }

        if last_operation.state == LastOperationState::Succeeded && status.last_error.is_none() {
            Readiness::Ready
        } else {
            Readiness::Pending(status.summary())
        }
    }
}

/// The reconciler picked up a trigger set after `baseline_resource_version` was read
///
/// An absent annotation alone is not enough: a cached copy from before the
/// trigger was written has no annotation either. The resource version has to
/// have moved past the baseline too.
pub fn operation_annotation_removed<K: ExtensionObject>(
    baseline_resource_version: String,
) -> impl Fn(Option<&K>) -> Readiness {
    move |obj| {
        let Some(obj) = obj else {
            return Readiness::Pending("object not found".to_string());
        };
        if obj.resource_version().as_deref() == Some(baseline_resource_version.as_str()) {
            return Readiness::Pending(format!(
                "resourceVersion still {baseline_resource_version}, cache not updated yet"
            ));
        }
        match operation_annotation(obj) {
            Some(op) => Readiness::Pending(format!("operation annotation '{op}' not yet removed")),
            None => Readiness::Ready,
        }
    }
}

/// The object no longer exists
///
/// A failed delete operation is terminal.
pub fn object_deleted<K: ExtensionObject>() -> impl Fn(Option<&K>) -> Readiness {
    |obj| {
        let Some(obj) = obj else {
            return Readiness::Ready;
        };
        let summary = obj
            .extension_status()
            .map(|s| s.summary())
            .unwrap_or_else(|| "no status reported".to_string());

        let delete_failed = obj
            .extension_status()
            .and_then(|s| s.last_operation.as_ref())
            .is_some_and(|op| {
                op.type_ == LastOperationType::Delete && op.state.is_terminal_failure()
            });
        if delete_failed {
            return Readiness::Failed(summary);
        }

        if obj.meta().deletion_timestamp.is_some() {
            Readiness::Pending(format!("deletion in progress; {summary}"))
        } else {
            Readiness::Pending(format!("no deletion timestamp yet; {summary}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ExtensionStatus, Infrastructure, InfrastructureSpec};
    use crate::crd::openstack::InfrastructureConfig;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> WaitConfig {
        WaitConfig::new(
            Duration::from_secs(10),
            Duration::from_secs(30),
            Duration::from_secs(300),
        )
    }

    fn infra(generation: i64, status: Option<ExtensionStatus>) -> Infrastructure {
        let config = InfrastructureConfig::new("pool", "10.250.0.0/16", None, None);
        let mut infra = Infrastructure::new(
            "infrastructure",
            InfrastructureSpec::new("ns", "eu-de-1", &config, "key").unwrap(),
        );
        infra.metadata.namespace = Some("ns".to_string());
        infra.metadata.generation = Some(generation);
        infra.metadata.resource_version = Some("100".to_string());
        infra.status = status;
        infra
    }

    fn succeeded(generation: i64) -> ExtensionStatus {
        ExtensionStatus::default()
            .last_operation(LastOperationType::Reconcile, LastOperationState::Succeeded)
            .observed_generation(generation)
    }

    // =========================================================================
    // Poller
    // =========================================================================

    /// Story: the poller sleeps the initial delay before touching the API
    #[tokio::test(start_paused = true)]
    async fn story_first_fetch_happens_after_initial_delay() {
        let start = Instant::now();
        let first_fetch = Arc::new(std::sync::Mutex::new(None));
        let recorder = first_fetch.clone();

        let result = wait_until(
            "infra ready",
            &fast(),
            || {
                recorder.lock().unwrap().get_or_insert(start.elapsed());
                async { Ok(Some(1)) }
            },
            |_: Option<&i32>| Readiness::Ready,
        )
        .await;

        assert_eq!(result.unwrap(), Some(1));
        assert_eq!(first_fetch.lock().unwrap().unwrap(), Duration::from_secs(10));
    }

    /// Story: an unsatisfied predicate times out with the last observed status
    #[tokio::test(start_paused = true)]
    async fn story_timeout_carries_last_observation() {
        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();

        let err = wait_until(
            "infra ready",
            &fast(),
            move || {
                let n = p.fetch_add(1, Ordering::SeqCst);
                async move { Ok(Some(n)) }
            },
            |n: Option<&u32>| Readiness::Pending(format!("Reconcile Processing poll {}", n.unwrap())),
        )
        .await
        .unwrap_err();

        match err {
            Error::ConvergenceTimeout {
                what,
                elapsed,
                last_observed,
            } => {
                assert_eq!(what, "infra ready");
                assert!(elapsed >= Duration::from_secs(300));
                assert!(elapsed < Duration::from_secs(330));
                assert!(last_observed.starts_with("Reconcile Processing poll"));
            }
            other => panic!("Expected ConvergenceTimeout, got {other:?}"),
        }
        // 10s delay, then a poll every 30s up to the 300s ceiling
        assert_eq!(polls.load(Ordering::SeqCst), 11);
    }

    /// Story: a terminal failure stops the wait immediately
    #[tokio::test(start_paused = true)]
    async fn story_terminal_failure_aborts_without_waiting_out_the_timeout() {
        let start = Instant::now();
        let err = wait_until(
            "bastion ready",
            &fast(),
            || async { Ok(Some(())) },
            |_: Option<&()>| Readiness::Failed("quota exceeded".to_string()),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::ReconcileFailed { ref reason, .. } if reason == "quota exceeded"));
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    /// Story: a couple of API hiccups are absorbed
    #[tokio::test(start_paused = true)]
    async fn story_transient_fetch_errors_are_tolerated() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = wait_until(
            "infra ready",
            &fast(),
            move || {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::provider(503, "apiserver unavailable"))
                    } else {
                        Ok(Some("ready"))
                    }
                }
            },
            |_: Option<&&str>| Readiness::Ready,
        )
        .await;

        assert_eq!(result.unwrap(), Some("ready"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_fetch_errors_fail_the_wait() {
        let config = WaitConfig {
            max_consecutive_fetch_errors: 3,
            ..fast()
        };
        let err = wait_until(
            "infra ready",
            &config,
            || async { Err::<Option<()>, _>(Error::provider(500, "etcd timeout")) },
            |_| Readiness::Ready,
        )
        .await
        .unwrap_err();

        match err {
            Error::TransientFetch {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("etcd timeout"));
            }
            other => panic!("Expected TransientFetch, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_error_at_deadline_is_reported_in_timeout() {
        let config = WaitConfig::new(Duration::ZERO, Duration::from_secs(30), Duration::from_secs(60));
        let err = wait_until(
            "infra deleted",
            &config,
            || async { Err::<Option<()>, _>(Error::provider(503, "unavailable")) },
            |_| Readiness::Ready,
        )
        .await
        .unwrap_err();

        match err {
            Error::ConvergenceTimeout { last_observed, .. } => {
                assert!(last_observed.contains("fetch error"));
                assert!(last_observed.contains("unavailable"));
            }
            other => panic!("Expected ConvergenceTimeout, got {other:?}"),
        }
    }

    #[test]
    fn presets_match_their_tiers() {
        let creation = WaitConfig::creation();
        assert_eq!(creation.initial_delay, Duration::from_secs(10));
        assert_eq!(creation.poll_interval, Duration::from_secs(30));
        assert_eq!(creation.timeout, Duration::from_secs(960));

        assert_eq!(WaitConfig::reconcile_trigger().timeout, Duration::from_secs(300));
        assert_eq!(WaitConfig::deletion().poll_interval, Duration::from_secs(10));
        assert_eq!(WaitConfig::bastion_creation().initial_delay, Duration::from_secs(60));
        assert_eq!(WaitConfig::existence_grace().initial_delay, Duration::ZERO);

        for preset in [
            WaitConfig::creation(),
            WaitConfig::bastion_creation(),
            WaitConfig::reconcile_trigger(),
            WaitConfig::deletion(),
            WaitConfig::existence_grace(),
        ] {
            assert!(preset.validate().is_ok());
        }
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let config = WaitConfig::new(Duration::ZERO, Duration::ZERO, Duration::from_secs(1));
        assert!(config.validate().is_err());
    }

    // =========================================================================
    // Predicates
    // =========================================================================

    #[test]
    fn ready_requires_succeeded_current_generation() {
        let ready = extension_ready::<Infrastructure>();

        assert_eq!(ready(Some(&infra(2, Some(succeeded(2))))), Readiness::Ready);
        assert!(matches!(ready(Some(&infra(3, Some(succeeded(2))))), Readiness::Pending(_)));
        assert!(matches!(ready(Some(&infra(1, None))), Readiness::Pending(_)));
        assert!(matches!(ready(None), Readiness::Pending(_)));
    }

    #[test]
    fn ready_waits_while_operation_annotation_is_set() {
        let mut obj = infra(1, Some(succeeded(1)));
        obj.annotations_mut()
            .insert(OPERATION_ANNOTATION.to_string(), "reconcile".to_string());

        match extension_ready::<Infrastructure>()(Some(&obj)) {
            Readiness::Pending(reason) => assert!(reason.contains("annotation")),
            other => panic!("Expected Pending, got {other:?}"),
        }
    }

    #[test]
    fn retriable_error_keeps_waiting_but_failed_is_terminal() {
        let ready = extension_ready::<Infrastructure>();

        let erroring = ExtensionStatus::default()
            .last_operation(LastOperationType::Create, LastOperationState::Error)
            .last_error("router quota exceeded")
            .observed_generation(1);
        match ready(Some(&infra(1, Some(erroring)))) {
            Readiness::Pending(reason) => assert!(reason.contains("router quota exceeded")),
            other => panic!("Expected Pending, got {other:?}"),
        }

        let failed = ExtensionStatus::default()
            .last_operation(LastOperationType::Create, LastOperationState::Failed)
            .last_error("invalid credentials")
            .observed_generation(1);
        match ready(Some(&infra(1, Some(failed)))) {
            Readiness::Failed(reason) => assert!(reason.contains("invalid credentials")),
            other => panic!("Expected Failed, got {other:?}"),
        }
    }

    /// Story: a stale cached copy is not mistaken for a picked-up trigger
    ///
    /// Right after the trigger patch, an informer cache can still serve the
    /// copy from before the patch. It carries no annotation, which looks like
    /// the reconciler already cleared it. Only a newer resource version counts.
    #[test]
    fn story_stale_cache_is_not_a_picked_up_trigger() {
        let picked_up = operation_annotation_removed::<Infrastructure>("100".to_string());

        let stale = infra(1, Some(succeeded(1)));
        match picked_up(Some(&stale)) {
            Readiness::Pending(reason) => assert!(reason.contains("cache not updated")),
            other => panic!("Expected Pending, got {other:?}"),
        }

        let mut triggered = stale.clone();
        triggered.metadata.resource_version = Some("101".to_string());
        triggered
            .annotations_mut()
            .insert(OPERATION_ANNOTATION.to_string(), "reconcile".to_string());
        assert!(matches!(picked_up(Some(&triggered)), Readiness::Pending(_)));

        triggered.annotations_mut().remove(OPERATION_ANNOTATION);
        triggered.metadata.resource_version = Some("102".to_string());
        assert_eq!(picked_up(Some(&triggered)), Readiness::Ready);
    }

    #[test]
    fn deleted_predicate() {
        let deleted = object_deleted::<Infrastructure>();
        assert_eq!(deleted(None), Readiness::Ready);

        let mut deleting = infra(1, Some(succeeded(1)));
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        match deleted(Some(&deleting)) {
            Readiness::Pending(reason) => assert!(reason.contains("deletion in progress")),
            other => panic!("Expected Pending, got {other:?}"),
        }

        deleting.status = Some(
            ExtensionStatus::default()
                .last_operation(LastOperationType::Delete, LastOperationState::Failed)
                .last_error("router still has ports"),
        );
        assert!(matches!(deleted(Some(&deleting)), Readiness::Failed(_)));
    }

    /// Story: a full wait over a fake object that converges on the third poll
    #[tokio::test(start_paused = true)]
    async fn story_wait_for_extension_ready() {
        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();

        let obj = wait_until(
            "Infrastructure ns/infrastructure ready",
            &WaitConfig::creation(),
            move || {
                let n = p.fetch_add(1, Ordering::SeqCst);
                async move {
                    let status = if n < 2 {
                        ExtensionStatus::default()
                            .last_operation(LastOperationType::Create, LastOperationState::Processing)
                            .observed_generation(1)
                    } else {
                        succeeded(1)
                    };
                    Ok(Some(infra(1, Some(status))))
                }
            },
            extension_ready(),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(obj.name_any(), "infrastructure");
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }
}
