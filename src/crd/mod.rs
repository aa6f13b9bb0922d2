//! The contract every Kloudlite custom resource implements
//!
//! Concrete CRD types (App, Router, Workspace, ...) live in their own
//! controller crates. The core only touches their metadata and the shared
//! [`Status`]; spec fields are never interpreted here.

mod status;

use std::collections::BTreeMap;
use std::fmt::Debug;

use kube::api::GroupVersionKind;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use status::{CheckDefinition, CheckResult, CheckState, ResourceRef, Status};

/// A custom resource driven by the reconciliation core
pub trait Resource:
    kube::Resource<DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Current status, `None` before the first status write
    fn status(&self) -> Option<&Status>;

    /// Mutable status, initialized to the default on first access
    fn status_mut(&mut self) -> &mut Status;

    /// Labels the object always carries
    fn ensured_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Annotations the object always carries
    fn ensured_annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// GroupVersionKind of the type, never read from the object itself
    fn gvk() -> GroupVersionKind {
        GroupVersionKind::gvk(
            &Self::group(&()),
            &Self::version(&()),
            &Self::kind(&()),
        )
    }

    /// `<namespace>/<name>` or `<name>` for cluster scoped objects
    fn key(&self) -> String {
        let meta = self.meta();
        let name = meta.name.as_deref().unwrap_or_default();
        match meta.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
            _ => name.to_string(),
        }
    }
}

/// `apiVersion` string for a GroupVersionKind (core group has no prefix)
pub fn api_version(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    }
}

/// Split an `apiVersion` string into group and version
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}
