//! Kubernetes API resource discovery.

use kube::{
	discovery::{verbs, ApiCapabilities, ApiResource, Scope},
	Client, Discovery,
};
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum DiscoveryError {
	#[error("full API discovery failed")]
	FullDiscovery(#[source] kube::Error),
}

/// A resource type served by the cluster, in its preferred version.
#[derive(Debug, Clone)]
pub struct DiscoveredResource {
	pub api_resource: ApiResource,
	pub capabilities: ApiCapabilities,
}

impl DiscoveredResource {
	pub fn namespaced(&self) -> bool {
		matches!(self.capabilities.scope, Scope::Namespaced)
	}

	pub fn listable(&self) -> bool {
		self.capabilities.supports_operation(verbs::LIST)
	}

	/// Whether the resource belongs to a built-in API group rather than a
	/// custom resource definition.
	pub fn is_core_group(&self) -> bool {
		let group = &self.api_resource.group;
		!group.contains('.') || group.contains(".k8s.io")
	}
}

/// Discover every resource type in its preferred version.
///
/// Uses the Aggregated Discovery API (K8s 1.26+), which requires only two API
/// calls, and falls back to per-group discovery on older clusters. Results are
/// ordered by group, then resource name.
#[instrument(skip_all)]
pub async fn discover_resources(client: &Client) -> Result<Vec<DiscoveredResource>, DiscoveryError> {
	let discovery = match Discovery::new(client.clone()).run_aggregated().await {
		Ok(discovery) => {
			tracing::debug!("using aggregated discovery");
			discovery
		}
		Err(e) => {
			tracing::debug!(error = %e, "aggregated discovery not available, using full discovery");
			Discovery::new(client.clone())
				.run()
				.await
				.map_err(DiscoveryError::FullDiscovery)?
		}
	};

	let mut resources: Vec<DiscoveredResource> = discovery
		.groups()
		.flat_map(|group| group.recommended_resources())
		.map(|(api_resource, capabilities)| DiscoveredResource {
			api_resource,
			capabilities,
		})
		.collect();
	resources.sort_by(|a, b| {
		(&a.api_resource.group, &a.api_resource.plural)
			.cmp(&(&b.api_resource.group, &b.api_resource.plural))
	});

	tracing::debug!(resources = resources.len(), "discovered API resources");
	Ok(resources)
}
