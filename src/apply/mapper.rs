//! GroupVersionKind to REST resource resolution
//!
//! Kinds applied by controllers include plugin CRDs that may be installed
//! long after the operator started, so lookups are lazy and only successful
//! resolutions are cached.

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{ApiResource, GroupVersionKind};
use kube::discovery::{self, Scope};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use crate::Result;

/// REST resource of a kind and whether it lives in a namespace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceMapping {
    /// Resource coordinates (plural, apiVersion, kind)
    pub resource: ApiResource,
    /// True for namespaced kinds
    pub namespaced: bool,
}

impl ResourceMapping {
    /// Mapping for a namespaced kind, with the plural derived from the kind
    pub fn namespaced(gvk: &GroupVersionKind) -> Self {
        Self {
            resource: ApiResource::from_gvk(gvk),
            namespaced: true,
        }
    }

    /// Mapping for a cluster scoped kind
    pub fn cluster(gvk: &GroupVersionKind) -> Self {
        Self {
            resource: ApiResource::from_gvk(gvk),
            namespaced: false,
        }
    }
}

/// Resolves kinds to REST resources
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RestMapper: Send + Sync {
    /// `None` when the kind is not served by the cluster
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<ResourceMapping>>;
}

/// [`RestMapper`] backed by API discovery with a per-kind cache
pub struct DiscoveryRestMapper {
    client: Client,
    cache: DashMap<String, ResourceMapping>,
}

impl DiscoveryRestMapper {
    /// Create an empty mapper
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: DashMap::new(),
        }
    }

    /// Forget a cached kind, e.g. after its CRD was reinstalled at a new version
    pub fn invalidate(&self, gvk: &GroupVersionKind) {
        self.cache.remove(&cache_key(gvk));
    }
}

fn cache_key(gvk: &GroupVersionKind) -> String {
    format!("{}/{}.{}", gvk.group, gvk.version, gvk.kind)
}

#[async_trait]
impl RestMapper for DiscoveryRestMapper {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<ResourceMapping>> {
        let key = cache_key(gvk);
        if let Some(mapping) = self.cache.get(&key) {
            return Ok(Some(mapping.clone()));
        }

        match discovery::pinned_kind(&self.client, gvk).await {
            Ok((resource, caps)) => {
                let mapping = ResourceMapping {
                    resource,
                    namespaced: caps.scope == Scope::Namespaced,
                };
                info!(
                    kind = %gvk.kind,
                    plural = %mapping.resource.plural,
                    namespaced = mapping.namespaced,
                    "resolved resource mapping"
                );
                self.cache.insert(key, mapping.clone());
                Ok(Some(mapping))
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!(group = %gvk.group, version = %gvk.version, kind = %gvk.kind, "group version not served");
                Ok(None)
            }
            Err(kube::Error::Discovery(e)) => {
                debug!(kind = %gvk.kind, error = %e, "kind not found in discovery");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Mapper over a fixed set of kinds, for callers that know their kinds up front
#[derive(Default)]
pub struct StaticRestMapper {
    mappings: DashMap<String, ResourceMapping>,
}

impl StaticRestMapper {
    /// Register a mapping
    pub fn with(self, mapping: ResourceMapping) -> Self {
        let gvk = GroupVersionKind::gvk(
            &mapping.resource.group,
            &mapping.resource.version,
            &mapping.resource.kind,
        );
        self.mappings.insert(cache_key(&gvk), mapping);
        self
    }
}

#[async_trait]
impl RestMapper for StaticRestMapper {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<ResourceMapping>> {
        Ok(self.mappings.get(&cache_key(gvk)).map(|m| m.clone()))
    }
}
