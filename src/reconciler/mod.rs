//! Request, Check and Step: the convergence state machine shared by all
//! controllers

mod check;
mod request;
mod result;
mod step;
mod store;

pub use check::Check;
pub use request::{Kv, Request};
pub use result::{StepResult, CONFLICT_REQUEUE};
pub use step::{reconcile_steps, Step, StepFn, ENSURE_REQUEUE};
pub use store::{merge_diff, KubeResourceStore, ObjectKey, ResourceStore};
