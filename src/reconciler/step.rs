//! Step orchestration
//!
//! Create path: ensure bookkeeping, then run `on_create` handlers in
//! registration order. Delete path: run `on_delete` handlers in reverse
//! order and remove the finalizer last.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::debug;

use super::check::Check;
use super::request::Request;
use super::result::StepResult;
use crate::crd::{CheckDefinition, Resource};
use crate::Result;

/// Requeue delay after a bookkeeping write on the create path
pub const ENSURE_REQUEUE: Duration = Duration::from_millis(500);

/// A step handler
#[async_trait]
pub trait StepFn<K: Resource>: Send + Sync {
    /// Run the step, resolving the check to exactly one outcome
    async fn run(&self, check: Check<'_, K>) -> StepResult;
}

#[async_trait]
impl<K, F> StepFn<K> for F
where
    K: Resource,
    F: for<'a> Fn(Check<'a, K>) -> BoxFuture<'a, StepResult> + Send + Sync,
{
    async fn run(&self, check: Check<'_, K>) -> StepResult {
        (self)(check).await
    }
}

/// A named pair of create and delete handlers
pub struct Step<K: Resource> {
    /// Unique name; checks are named `create/<name>` and `delete/<name>`
    pub name: String,
    /// Human readable title
    pub title: String,
    on_create: Option<Box<dyn StepFn<K>>>,
    on_delete: Option<Box<dyn StepFn<K>>>,
}

impl<K: Resource> Step<K> {
    /// A step without handlers; both paths pass it automatically
    pub fn new(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            on_create: None,
            on_delete: None,
        }
    }

    /// Set the create path handler
    pub fn on_create(mut self, handler: impl StepFn<K> + 'static) -> Self {
        self.on_create = Some(Box::new(handler));
        self
    }

    /// Set the delete path handler
    pub fn on_delete(mut self, handler: impl StepFn<K> + 'static) -> Self {
        self.on_delete = Some(Box::new(handler));
        self
    }

    fn create_check(&self) -> String {
        format!("create/{}", self.name)
    }

    fn delete_check(&self) -> String {
        format!("delete/{}", self.name)
    }
}

impl<K: Resource> std::fmt::Debug for Step<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("on_create", &self.on_create.is_some())
            .field("on_delete", &self.on_delete.is_some())
            .finish()
    }
}

/// Drive `req` through `steps`, picking the path from the deletion timestamp
pub async fn reconcile_steps<K: Resource>(req: &mut Request<K>, steps: &[Step<K>]) -> StepResult {
    if req.is_being_deleted() {
        run_delete_path(req, steps).await
    } else {
        run_create_path(req, steps).await
    }
}

async fn run_create_path<K: Resource>(req: &mut Request<K>, steps: &[Step<K>]) -> StepResult {
    if let Some(result) = ensured(req.clear_status_if_annotated().await) {
        return result;
    }
    if let Some(result) = ensured(req.reset_check_if_annotated().await) {
        return result;
    }
    if let Some(result) = ensured(req.ensure_labels_and_annotations().await) {
        return result;
    }
    if let Some(result) = ensured(req.ensure_finalizers().await) {
        return result;
    }

    let defs: Vec<CheckDefinition> = steps
        .iter()
        .map(|s| CheckDefinition::new(s.create_check(), s.title.clone()))
        .collect();
    if let Some(result) = ensured(req.ensure_check_list(&defs).await) {
        return result;
    }

    for step in steps {
        let check = Check::running(req, step.create_check());
        let result = match &step.on_create {
            Some(handler) => handler.run(check).await,
            None => check.passed().await,
        };
        if !result.should_proceed() {
            debug!(resource = %req.key(), step = %step.name, "create path stopped");
            return result;
        }
    }

    let status = req.status_mut();
    status.is_ready = status.all_checks_passed();
    match req.update_status().await {
        Ok(()) => StepResult::next(),
        Err(e) => StepResult::from_error(e),
    }
}

async fn run_delete_path<K: Resource>(req: &mut Request<K>, steps: &[Step<K>]) -> StepResult {
    let defs: Vec<CheckDefinition> = steps
        .iter()
        .map(|s| CheckDefinition::new(s.delete_check(), s.title.clone()))
        .collect();
    if let Err(e) = req.ensure_check_list(&defs).await {
        return StepResult::from_error(e);
    }

    for step in steps.iter().rev() {
        let check = Check::running(req, step.delete_check());
        let result = match &step.on_delete {
            Some(handler) => handler.run(check).await,
            None => check.passed().await,
        };
        if !result.should_proceed() {
            debug!(resource = %req.key(), step = %step.name, "delete path stopped");
            return result;
        }
    }

    match req.remove_finalizer().await {
        Ok(()) => StepResult::next(),
        Err(e) if e.is_not_found() => StepResult::next(),
        Err(e) => StepResult::from_error(e),
    }
}

/// `None` when nothing was written and the path may continue
fn ensured(outcome: Result<bool>) -> Option<StepResult> {
    match outcome {
        Ok(false) => None,
        Ok(true) => Some(StepResult::requeue_after(ENSURE_REQUEUE)),
        Err(e) => Some(StepResult::from_error(e)),
    }
}
