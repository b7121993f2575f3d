//! Mock Kubernetes API discovery types.

use std::collections::BTreeMap;

/// Discovery mode for the mock server.
#[derive(Debug, Clone, Copy, Default)]
pub enum DiscoveryMode {
	/// Support aggregated discovery (APIGroupDiscoveryList).
	#[default]
	Aggregated,
	/// Return 406 for aggregated discovery, forcing fallback to legacy endpoints.
	Legacy,
}

const ALL_VERBS: &[&str] = &[
	"create", "delete", "get", "list", "patch", "update", "watch",
];

/// Resources the mock server advertises, by group version.
#[derive(Debug, Clone)]
pub struct MockDiscovery {
	/// Resources of the core `v1` group.
	pub core_resources: Vec<MockApiResource>,
	/// Resources of named groups, keyed by group version (`apps/v1`).
	pub group_resources: BTreeMap<String, Vec<MockApiResource>>,
}

impl Default for MockDiscovery {
	fn default() -> Self {
		Self {
			core_resources: vec![
				MockApiResource::namespaced("configmaps", "ConfigMap"),
				MockApiResource::namespaced("secrets", "Secret"),
				MockApiResource::namespaced("services", "Service"),
				MockApiResource::namespaced("endpoints", "Endpoints"),
				MockApiResource::namespaced("pods", "Pod"),
				MockApiResource::namespaced("persistentvolumeclaims", "PersistentVolumeClaim"),
				MockApiResource::cluster_scoped("persistentvolumes", "PersistentVolume"),
				MockApiResource::cluster_scoped("namespaces", "Namespace"),
				MockApiResource::namespaced("bindings", "Binding").with_verbs(&["create"]),
			],
			group_resources: BTreeMap::from([
				(
					"apps/v1".to_owned(),
					vec![
						MockApiResource::namespaced("deployments", "Deployment"),
						MockApiResource::namespaced("replicasets", "ReplicaSet"),
						MockApiResource::namespaced("statefulsets", "StatefulSet"),
						MockApiResource::namespaced("daemonsets", "DaemonSet"),
					],
				),
				(
					"discovery.k8s.io/v1".to_owned(),
					vec![MockApiResource::namespaced("endpointslices", "EndpointSlice")],
				),
				(
					"argoproj.io/v1alpha1".to_owned(),
					vec![MockApiResource::namespaced("applications", "Application")],
				),
			]),
		}
	}
}

impl MockDiscovery {
	/// Find the resource serving `kind` in `api_version`.
	pub fn find_kind(&self, api_version: &str, kind: &str) -> Option<&MockApiResource> {
		let resources = if api_version.contains('/') {
			self.group_resources.get(api_version)?
		} else {
			&self.core_resources
		};
		resources.iter().find(|r| r.kind == kind)
	}

	/// Whether `plural` names an advertised resource in any group.
	pub fn has_resource(&self, plural: &str) -> bool {
		self.core_resources
			.iter()
			.chain(self.group_resources.values().flatten())
			.any(|r| r.name == plural)
	}
}

/// A mock API resource definition.
#[derive(Debug, Clone)]
pub struct MockApiResource {
	pub name: String,
	pub kind: String,
	pub namespaced: bool,
	pub verbs: Vec<String>,
}

impl MockApiResource {
	pub fn namespaced(name: &str, kind: &str) -> Self {
		Self::new(name, kind, true)
	}

	pub fn cluster_scoped(name: &str, kind: &str) -> Self {
		Self::new(name, kind, false)
	}

	/// Replace the advertised verbs.
	#[must_use]
	pub fn with_verbs(mut self, verbs: &[&str]) -> Self {
		self.verbs = verbs.iter().map(|v| (*v).to_owned()).collect();
		self
	}

	fn new(name: &str, kind: &str, namespaced: bool) -> Self {
		Self {
			name: name.to_owned(),
			kind: kind.to_owned(),
			namespaced,
			verbs: Vec::new(),
		}
		.with_verbs(ALL_VERBS)
	}

	pub(crate) fn scope(&self) -> &'static str {
		if self.namespaced {
			"Namespaced"
		} else {
			"Cluster"
		}
	}
}
