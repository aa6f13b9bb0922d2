//! The check state machine
//!
//! A [`Check`] is created in `Running` and consumed by exactly one of
//! [`Check::passed`], [`Check::failed`], [`Check::errored`] or
//! [`Check::abort`], so a check cannot reach two terminal states in one
//! cycle.

use chrono::Utc;
use tracing::{debug, info, warn};

use super::request::Request;
use super::result::StepResult;
use crate::crd::{CheckResult, CheckState, Resource};
use crate::Error;

/// A running check bound to its request
pub struct Check<'a, K: Resource> {
    req: &'a mut Request<K>,
    name: String,
    previous: Option<CheckResult>,
}

impl<'a, K: Resource> Check<'a, K> {
    /// Start the check named `name`.
    ///
    /// A check re-run for the generation it last ran at keeps its original
    /// start time, so identical outcomes do not show up as status changes.
    pub fn running(req: &'a mut Request<K>, name: impl Into<String>) -> Self {
        let name = name.into();
        let generation = req.generation();
        let previous = req.status().checks.get(&name).cloned();

        let started_at = previous
            .as_ref()
            .filter(|p| p.generation == generation && p.state != CheckState::Waiting)
            .and_then(|p| p.started_at)
            .unwrap_or_else(Utc::now);

        req.status_mut().checks.insert(
            name.clone(),
            CheckResult {
                state: CheckState::Running,
                message: None,
                generation,
                started_at: Some(started_at),
                completed_at: None,
            },
        );
        debug!(resource = %req.key(), check = %name, generation, "check start");

        Self {
            req,
            name,
            previous,
        }
    }

    /// Name of the check
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The request this check runs in
    pub fn request(&self) -> &Request<K> {
        self.req
    }

    /// Mutable access to the request
    pub fn request_mut(&mut self) -> &mut Request<K> {
        self.req
    }

    /// Working copy of the reconciled object
    pub fn object(&self) -> &K {
        self.req.object()
    }

    /// The check converged; continue with the next step
    pub async fn passed(self) -> StepResult {
        self.finish(CheckState::Passed, None).await.unwrap_or_else(StepResult::next)
    }

    /// Terminal failure for this generation; no automatic requeue.
    ///
    /// Conflicts are not failures and are handed to [`Check::errored`].
    pub async fn failed(self, err: Error) -> StepResult {
        if err.is_conflict() {
            return self.errored(err).await;
        }
        warn!(resource = %self.req.key(), check = %self.name, error = %err, "check failed");
        self.finish(CheckState::Failed, Some(err.to_string()))
            .await
            .unwrap_or_else(StepResult::stop)
    }

    /// Transient failure; the controller requeues with backoff.
    ///
    /// A conflict requeues shortly without touching the status. Any other
    /// error, a 4xx from the API server included, is handed on as an
    /// internal error of this check so it is always retried.
    pub async fn errored(self, err: Error) -> StepResult {
        if err.is_conflict() {
            debug!(resource = %self.req.key(), check = %self.name, "conflict, requeueing");
            return StepResult::from_error(err);
        }
        self.errored_with(err.to_string()).await
    }

    /// Stop while waiting on a precondition, recording `msg` verbatim
    pub async fn abort(self, msg: impl Into<String>) -> StepResult {
        self.errored_with(msg.into()).await
    }

    async fn errored_with(self, message: String) -> StepResult {
        info!(resource = %self.req.key(), check = %self.name, message = %message, "check errored");
        let err = Error::internal_with_context(self.name.clone(), message.clone());
        match self.finish(CheckState::Errored, Some(message)).await {
            Some(write_failure) => write_failure,
            None => StepResult::from_error(err),
        }
    }

    /// Record the terminal state and persist it.
    ///
    /// Returns `Some` only when persisting failed.
    async fn finish(self, state: CheckState, message: Option<String>) -> Option<StepResult> {
        let Check {
            req,
            name,
            previous,
        } = self;

        let mut result = req.status().checks.get(&name).cloned().unwrap_or_default();
        result.state = state;
        result.message = message;
        result.completed_at = match &previous {
            Some(prev) if *prev == result => prev.completed_at,
            _ => Some(Utc::now()),
        };

        let status = req.status_mut();
        status.checks.insert(name.clone(), result);
        status.is_ready = state == CheckState::Passed && status.all_checks_passed();

        match req.update_status().await {
            Ok(()) => None,
            Err(e) if e.is_not_found() => {
                debug!(resource = %req.key(), check = %name, "object gone while saving check");
                Some(StepResult::stop())
            }
            Err(e) => Some(StepResult::from_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::crd::CheckDefinition;
    use crate::error::api_error;
    use crate::reconciler::result::CONFLICT_REQUEUE;
    use crate::reconciler::store::ObjectKey;
    use crate::testing::{probe, FakeStore, Probe};

    async fn prepared(store: &Arc<FakeStore<Probe>>, checks: &[&str]) -> Request<Probe> {
        let obj = probe("default", "web");
        let key = ObjectKey::of(&obj);
        store.insert(obj);
        let mut req = Request::new(store.clone(), key).await.unwrap();
        let defs: Vec<_> = checks.iter().map(|n| CheckDefinition::new(*n, "")).collect();
        req.ensure_check_list(&defs).await.unwrap();
        req
    }

    /// Story: a conflict while erroring never writes status and requeues shortly
    #[tokio::test]
    async fn story_errored_conflict_skips_status_write() {
        let store = Arc::new(FakeStore::default());
        let mut req = prepared(&store, &["create/a"]).await;
        let writes = store.status_update_count();

        let result = Check::running(&mut req, "create/a")
            .errored(api_error(409, "Conflict"))
            .await;

        assert_eq!(store.status_update_count(), writes);
        assert!(result.error().is_none());
        assert_eq!(result.requeue(), Some(CONFLICT_REQUEUE));
        assert!(!result.should_proceed());
    }

    /// Story: a failed conflict is routed through errored
    #[tokio::test]
    async fn story_failed_conflict_is_not_terminal() {
        let store = Arc::new(FakeStore::default());
        let mut req = prepared(&store, &["create/a"]).await;
        let writes = store.status_update_count();

        let result = Check::running(&mut req, "create/a")
            .failed(api_error(409, "Conflict"))
            .await;

        assert_eq!(store.status_update_count(), writes);
        assert_eq!(result.requeue(), Some(CONFLICT_REQUEUE));
    }

    /// Story: passing the last check makes the object ready
    #[tokio::test]
    async fn story_passed_persists_and_proceeds() {
        let store = Arc::new(FakeStore::default());
        let mut req = prepared(&store, &["create/a", "create/b"]).await;

        let result = Check::running(&mut req, "create/a").passed().await;
        assert!(result.should_proceed());
        assert!(!req.status().is_ready);

        let result = Check::running(&mut req, "create/b").passed().await;
        assert!(result.should_proceed());
        assert!(req.status().is_ready);

        let stored = store.stored(req.key()).unwrap().status.unwrap();
        assert_eq!(stored.checks["create/a"].state, CheckState::Passed);
        assert!(stored.checks["create/a"].completed_at.is_some());
        assert_eq!(stored.checks["create/a"].generation, 1);
    }

    /// Story: a failed check records its message and stops without requeue
    #[tokio::test]
    async fn story_failed_is_terminal() {
        let store = Arc::new(FakeStore::default());
        let mut req = prepared(&store, &["create/a"]).await;
        req.status_mut().is_ready = true;

        let result = Check::running(&mut req, "create/a")
            .failed(Error::validation("spec.image must be set"))
            .await;

        assert!(!result.should_proceed());
        assert!(result.error().is_none());
        assert!(result.requeue().is_none());

        let stored = store.stored(req.key()).unwrap().status.unwrap();
        assert!(!stored.is_ready);
        assert_eq!(stored.checks["create/a"].state, CheckState::Failed);
        assert!(stored.checks["create/a"]
            .message
            .as_deref()
            .unwrap()
            .contains("spec.image must be set"));
    }

    /// Story: an errored check records its message and hands the error on
    #[tokio::test]
    async fn story_errored_propagates() {
        let store = Arc::new(FakeStore::default());
        let mut req = prepared(&store, &["create/a"]).await;

        let result = Check::running(&mut req, "create/a")
            .errored(api_error(500, "InternalError"))
            .await;
        assert!(result.error().is_some());

        let stored = store.stored(req.key()).unwrap().status.unwrap();
        assert_eq!(stored.checks["create/a"].state, CheckState::Errored);
    }

    /// Story: a dependency that does not exist yet is retried, not parked
    #[tokio::test]
    async fn story_errored_client_errors_stay_retryable() {
        let store = Arc::new(FakeStore::default());
        let mut req = prepared(&store, &["create/a", "create/b"]).await;

        let missing = Check::running(&mut req, "create/a")
            .errored(api_error(404, "NotFound"))
            .await;
        let throttled = Check::running(&mut req, "create/b")
            .errored(api_error(429, "TooManyRequests"))
            .await;

        for result in [missing, throttled] {
            let err = result.error().unwrap();
            assert!(err.is_retryable());
            assert!(!err.is_not_found());
        }
        let stored = store.stored(req.key()).unwrap().status.unwrap();
        assert!(stored.checks["create/a"].message.as_deref().unwrap().contains("NotFound"));
    }

    /// Story: abort keeps the waiting message readable
    #[tokio::test]
    async fn story_abort_records_message_verbatim() {
        let store = Arc::new(FakeStore::default());
        let mut req = prepared(&store, &["create/a"]).await;

        let result = Check::running(&mut req, "create/a")
            .abort("waiting for managed service to become ready")
            .await;
        assert!(result.error().is_some());

        let stored = store.stored(req.key()).unwrap().status.unwrap();
        assert_eq!(
            stored.checks["create/a"].message.as_deref(),
            Some("waiting for managed service to become ready")
        );
    }

    /// Story: repeating an identical outcome does not rewrite the status
    #[tokio::test]
    async fn story_identical_rerun_is_not_a_change() {
        let store = Arc::new(FakeStore::default());
        let mut req = prepared(&store, &["create/a"]).await;

        Check::running(&mut req, "create/a")
            .abort("waiting for dependency")
            .await;
        let writes = store.status_update_count();

        Check::running(&mut req, "create/a")
            .abort("waiting for dependency")
            .await;
        assert_eq!(store.status_update_count(), writes);
    }

    #[tokio::test]
    async fn running_stamps_generation_and_start() {
        let store = Arc::new(FakeStore::default());
        let mut req = prepared(&store, &["create/a"]).await;
        let check = Check::running(&mut req, "create/a");
        assert_eq!(check.name(), "create/a");
        let result = &check.request().status().checks["create/a"];
        assert_eq!(result.state, CheckState::Running);
        assert_eq!(result.generation, 1);
        assert!(result.started_at.is_some());
    }
}
