//! Shared status model for every reconciled resource
//!
//! The check list and the check map are stored separately: JSON has no
//! ordered map, so `check_list` is the ordering source of truth and `checks`
//! holds the per-name results.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle state of one check
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum CheckState {
    /// Registered but not started in this cycle
    #[default]
    Waiting,
    /// Currently executing
    Running,
    /// Transient failure; the object is requeued with backoff
    Errored,
    /// Converged
    Passed,
    /// Terminal failure for this generation; retried on the next spec change
    Failed,
}

impl CheckState {
    /// True for the three outcomes a check can finish a cycle with
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Errored | Self::Passed | Self::Failed)
    }

    /// Single character rendering used in the checks annotation
    pub fn glyph(&self) -> char {
        match self {
            Self::Waiting => '·',
            Self::Running => '~',
            Self::Errored => '!',
            Self::Passed => '✓',
            Self::Failed => '✗',
        }
    }
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Errored => "Errored",
            Self::Passed => "Passed",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Declaration of a check, created once per registered step
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckDefinition {
    /// Unique name within a status, e.g. `create/deployment`
    pub name: String,
    /// Human readable title
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    /// Only interesting while debugging a controller
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub debug: bool,
    /// Left out of the checks annotation
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hide: bool,
}

impl CheckDefinition {
    /// Create a definition with a name and title
    pub fn new(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            ..Default::default()
        }
    }
}

/// Persisted outcome of one check
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    /// Current state
    #[serde(default)]
    pub state: CheckState,
    /// Error or progress message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Object generation when the check started
    #[serde(default)]
    pub generation: i64,
    /// When the check started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the check reached its terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl CheckResult {
    /// A freshly registered check
    pub fn waiting() -> Self {
        Self::default()
    }
}

/// Equality for change detection: `completed_at` and sub-second jitter of
/// `started_at` are ignored.
impl PartialEq for CheckResult {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation
            && self.state == other.state
            && self.message == other.message
            && self.started_at.map(|t| t.timestamp()) == other.started_at.map(|t| t.timestamp())
    }
}

/// Pointer to an object created by a reconciler
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    /// apiVersion of the object
    pub api_version: String,
    /// Kind of the object
    pub kind: String,
    /// Namespace, empty for cluster scoped objects
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Name of the object
    pub name: String,
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{} {}", self.api_version, self.kind, self.name)
        } else {
            write!(
                f,
                "{}/{} {}/{}",
                self.api_version, self.kind, self.namespace, self.name
            )
        }
    }
}

/// Status shared by every Kloudlite resource
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// True iff every check in `check_list` passed
    #[serde(default)]
    pub is_ready: bool,
    /// Ordered check declarations
    #[serde(default)]
    pub check_list: Vec<CheckDefinition>,
    /// Results by check name
    #[serde(default)]
    pub checks: BTreeMap<String, CheckResult>,
    /// Generation at which the object was last fully ready
    #[serde(default)]
    pub last_ready_generation: i64,
    /// End of the last reconcile cycle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<DateTime<Utc>>,
    /// Children applied by the controller, for ownership based cleanup
    #[serde(default)]
    pub resources: Vec<ResourceRef>,
}

impl Status {
    /// True iff every listed check maps to a `Passed` result
    pub fn all_checks_passed(&self) -> bool {
        self.check_list.iter().all(|def| {
            self.checks
                .get(&def.name)
                .is_some_and(|r| r.state == CheckState::Passed)
        })
    }

    /// Names of the listed checks, in order
    pub fn check_names(&self) -> Vec<&str> {
        self.check_list.iter().map(|d| d.name.as_str()).collect()
    }

    /// Replace the check list if it differs from `defs`.
    ///
    /// A changed list resets every result to `Waiting`; returns whether
    /// anything changed.
    pub fn ensure_check_list(&mut self, defs: &[CheckDefinition]) -> bool {
        let results_match = defs.len() == self.checks.len()
            && defs.iter().all(|d| self.checks.contains_key(&d.name));
        if self.check_list == defs && results_match {
            return false;
        }
        self.check_list = defs.to_vec();
        self.checks = defs
            .iter()
            .map(|d| (d.name.clone(), CheckResult::waiting()))
            .collect();
        self.is_ready = false;
        true
    }

    /// Put one check back to `Waiting`; returns false for unknown names
    pub fn reset_check(&mut self, name: &str) -> bool {
        match self.checks.get_mut(name) {
            Some(result) => {
                *result = CheckResult::waiting();
                self.is_ready = false;
                true
            }
            None => false,
        }
    }

    /// Render the ready summary: `<bool> (<lastReadyGen>[ -> <gen>][, being deleted])`
    pub fn ready_summary(&self, generation: i64, being_deleted: bool) -> String {
        let mut out = format!("{} ({}", self.is_ready, self.last_ready_generation);
        if generation != self.last_ready_generation {
            out.push_str(&format!(" -> {}", generation));
        }
        if being_deleted {
            out.push_str(", being deleted");
        }
        out.push(')');
        out
    }

    /// Render one glyph per visible check, ordered by name, followed by the
    /// check currently holding the reconcile up.
    pub fn checks_summary(&self) -> String {
        let hidden: Vec<&str> = self
            .check_list
            .iter()
            .filter(|d| d.hide)
            .map(|d| d.name.as_str())
            .collect();

        // BTreeMap iteration is already sorted by name
        let visible = self
            .checks
            .iter()
            .filter(|(name, _)| !hidden.contains(&name.as_str()));

        let glyphs: String = visible.clone().map(|(_, r)| r.state.glyph()).collect();

        let blocking = visible.into_iter().find(|(_, r)| {
            matches!(
                r.state,
                CheckState::Running | CheckState::Errored | CheckState::Failed
            )
        });

        match blocking {
            Some((name, result)) => format!("{} [{}: {}]", glyphs, name, result.state),
            None => glyphs,
        }
    }
}
