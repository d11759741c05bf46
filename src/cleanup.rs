//! Cleanup stack
//!
//! Every resource a scenario creates registers a teardown action here at the
//! moment it is created. When the scenario ends, for whatever reason, the stack
//! unwinds in reverse registration order so dependents go before their
//! dependencies (router interface before subnet, subnet before network).
//!
//! Actions are command objects implementing [`CleanupAction`]; closures are
//! accepted through [`FnAction`]. Each registration returns a
//! [`CleanupHandle`] that can skip the action ([`CleanupStack::remove`]) or run
//! it early ([`CleanupStack::run`]). Either way an action executes at most once.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{error, info};

use crate::{Error, Result};

/// One idempotent teardown step
#[async_trait]
pub trait CleanupAction: Send + Sync {
    /// Human-readable description used in logs and teardown reports
    fn describe(&self) -> String;

    /// Perform the teardown
    async fn run(&self) -> Result<()>;
}

/// A [`CleanupAction`] backed by a closure
pub struct FnAction<F> {
    description: String,
    f: F,
}

impl<F, Fut> FnAction<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    /// Wrap a closure producing the teardown future
    pub fn new(description: impl Into<String>, f: F) -> Self {
        Self {
            description: description.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> CleanupAction for FnAction<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    fn describe(&self) -> String {
        self.description.clone()
    }

    async fn run(&self) -> Result<()> {
        (self.f)().await
    }
}

/// Generation-tagged reference to a registered action
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CleanupHandle(u64);

struct Entry {
    handle: CleanupHandle,
    action: Arc<dyn CleanupAction>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: Vec<Entry>,
}

/// Outcome of unwinding a [`CleanupStack`]
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Descriptions of actions that completed
    pub succeeded: Vec<String>,
    /// One [`Error::Teardown`] per failed action, in execution order
    pub failures: Vec<Error>,
}

impl TeardownReport {
    /// True when every action completed
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failure messages for reporting
    pub fn failure_messages(&self) -> Vec<String> {
        self.failures.iter().map(ToString::to_string).collect()
    }
}

/// Ordered registry of teardown actions, unwound last-in first-out
///
/// Cloning yields another handle onto the same stack. The internal lock is
/// never held across an await, so concurrent registration during an unwind is
/// safe.
#[derive(Clone, Default)]
pub struct CleanupStack {
    inner: Arc<Mutex<Inner>>,
}

impl CleanupStack {
    /// Create an empty stack
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an action; it runs during [`run_all`](Self::run_all) unless removed first
    pub fn register(&self, action: impl CleanupAction + 'static) -> CleanupHandle {
        let description = action.describe();
        let handle = {
            let mut inner = self.lock();
            inner.next_id += 1;
            let handle = CleanupHandle(inner.next_id);
            inner.entries.push(Entry {
                handle,
                action: Arc::new(action),
            });
            handle
        };
        info!(action = %description, "Registered cleanup");
        handle
    }

    /// Register a closure as an action
    pub fn register_fn<F, Fut>(&self, description: impl Into<String>, f: F) -> CleanupHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(FnAction::new(description, f))
    }

    fn take(&self, handle: CleanupHandle) -> Option<Arc<dyn CleanupAction>> {
        let mut inner = self.lock();
        let pos = inner.entries.iter().position(|e| e.handle == handle)?;
        Some(inner.entries.remove(pos).action)
    }

    /// Permanently skip an action
    ///
    /// Returns false if the handle was already removed or executed.
    pub fn remove(&self, handle: CleanupHandle) -> bool {
        match self.take(handle) {
            Some(action) => {
                info!(action = %action.describe(), "Removed cleanup");
                true
            }
            None => false,
        }
    }

    /// Run one action now and drop it from the stack
    ///
    /// Returns `Ok(false)` if the handle was already consumed.
    pub async fn run(&self, handle: CleanupHandle) -> Result<bool> {
        let Some(action) = self.take(handle) else {
            return Ok(false);
        };
        let description = action.describe();
        info!(action = %description, "Running cleanup early");
        action.run().await.map_err(|e| Error::Teardown {
            action: description,
            reason: e.to_string(),
        })?;
        Ok(true)
    }

    /// Number of actions still registered
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Execute every registered action in reverse registration order
    ///
    /// A failing action is logged and recorded; the unwind continues with the
    /// rest. The stack is empty afterwards.
    pub async fn run_all(&self) -> TeardownReport {
        let mut report = TeardownReport::default();

        loop {
            let Some(entry) = self.lock().entries.pop() else {
                break;
            };
            let description = entry.action.describe();

            match entry.action.run().await {
                Ok(()) => {
                    info!(action = %description, "Cleanup completed");
                    report.succeeded.push(description);
                }
                Err(e) => {
                    error!(action = %description, error = %e, "Cleanup failed, continuing unwind");
                    report.failures.push(Error::Teardown {
                        action: description,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, CleanupStack) {
        (Arc::new(Mutex::new(Vec::new())), CleanupStack::new())
    }

    fn push(stack: &CleanupStack, log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> CleanupHandle {
        let log = log.clone();
        stack.register_fn(name, move || {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(name.to_string());
                Ok(())
            }
        })
    }

    /// Story: teardown follows reverse dependency order
    ///
    /// A network is created, then its subnet, then a router attached to the
    /// subnet. The provider rejects deleting a network that still has subnets,
    /// so the unwind has to go router, subnet, network.
    #[tokio::test]
    async fn story_unwind_is_last_in_first_out() {
        let (log, stack) = recorder();
        push(&stack, &log, "network");
        push(&stack, &log, "subnet");
        push(&stack, &log, "router");

        let report = stack.run_all().await;

        assert!(report.is_clean());
        assert_eq!(*log.lock().unwrap(), vec!["router", "subnet", "network"]);
        assert_eq!(report.succeeded, vec!["router", "subnet", "network"]);
        assert!(stack.is_empty());
    }

    /// Story: one stuck resource does not strand the rest
    #[tokio::test]
    async fn story_unwind_continues_past_failures() {
        let (log, stack) = recorder();
        push(&stack, &log, "network");
        stack.register_fn("delete subnet", || async {
            Err(Error::provider(409, "subnet has allocated ports"))
        });
        push(&stack, &log, "router");

        let report = stack.run_all().await;

        assert_eq!(*log.lock().unwrap(), vec!["router", "network"]);
        assert_eq!(report.failures.len(), 1);
        match &report.failures[0] {
            Error::Teardown { action, reason } => {
                assert_eq!(action, "delete subnet");
                assert!(reason.contains("allocated ports"));
            }
            other => panic!("Expected Teardown, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn removed_action_never_runs() {
        let (log, stack) = recorder();
        push(&stack, &log, "network");
        let subnet = push(&stack, &log, "subnet");

        assert!(stack.remove(subnet));
        assert!(!stack.remove(subnet));

        stack.run_all().await;
        assert_eq!(*log.lock().unwrap(), vec!["network"]);
    }

    #[tokio::test]
    async fn early_run_executes_exactly_once() {
        let (log, stack) = recorder();
        let object = push(&stack, &log, "object");
        push(&stack, &log, "namespace");

        assert!(stack.run(object).await.unwrap());
        assert!(!stack.run(object).await.unwrap());
        stack.run_all().await;

        assert_eq!(*log.lock().unwrap(), vec!["object", "namespace"]);
    }

    #[tokio::test]
    async fn early_run_failure_is_a_teardown_error() {
        let stack = CleanupStack::new();
        let handle = stack.register_fn("delete router", || async {
            Err(Error::provider(500, "neutron down"))
        });

        let err = stack.run(handle).await.unwrap_err();
        assert!(matches!(err, Error::Teardown { .. }));
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn clones_share_one_stack() {
        let (log, stack) = recorder();
        let other = stack.clone();
        push(&other, &log, "from clone");
        push(&stack, &log, "from original");

        assert_eq!(stack.len(), 2);
        other.run_all().await;
        assert_eq!(*log.lock().unwrap(), vec!["from original", "from clone"]);
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn handles_are_not_reused_after_unwind() {
        let (log, stack) = recorder();
        let first = push(&stack, &log, "first");
        stack.run_all().await;
        let second = push(&stack, &log, "second");

        assert_ne!(first, second);
        assert!(!stack.remove(first));
        assert!(stack.remove(second));
    }
}
