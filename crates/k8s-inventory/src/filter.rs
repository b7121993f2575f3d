//! Post-collection filters.
//!
//! Argo CD deploys Helm charts by rendering them itself, so such releases never
//! show up in the Helm release storage. [`argo_helm_releases`] recovers them
//! from the `Application` objects Argo CD keeps in the cluster.

use serde::Serialize;
use serde_json::Value;

use crate::object::ObjectSet;

const APPLICATION_KIND: &str = "Application";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseStatus {
	Deployed,
	Failed,
	Unknown,
}

impl ReleaseStatus {
	/// Map an Argo CD health status onto a release status.
	fn from_health(health: Option<&str>) -> Self {
		let Some(health) = health else {
			return Self::Unknown;
		};
		match health.to_lowercase().as_str() {
			"degraded" | "missing" => Self::Failed,
			"unknown" => Self::Unknown,
			_ => Self::Deployed,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseInfo {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub first_deployed: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_deployed: Option<String>,
	pub status: ReleaseStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
	pub name: String,
	pub home: String,
	pub version: String,
	pub api_version: String,
	#[serde(rename = "type")]
	pub chart_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChartRecord {
	pub metadata: ChartMetadata,
}

/// A release in the shape Helm stores them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseRecord {
	pub name: String,
	pub namespace: String,
	pub info: ReleaseInfo,
	pub chart: ChartRecord,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub manifest: Option<String>,
	pub version: i64,
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> &'a str {
	value.pointer(pointer).and_then(Value::as_str).unwrap_or_default()
}

/// Build release records for every Argo CD application sourced from a Helm chart.
pub fn argo_helm_releases(objects: &ObjectSet) -> Vec<ReleaseRecord> {
	objects
		.iter()
		.filter(|obj| obj.kind() == APPLICATION_KIND)
		.filter(|obj| str_at(obj.payload(), "/status/sourceType") == "Helm")
		.map(|obj| {
			let release = release_from_application(obj.payload());
			tracing::info!(name = %release.name, "found Helm chart in Argo CD application");
			release
		})
		.collect()
}

fn release_from_application(app: &Value) -> ReleaseRecord {
	let name = str_at(app, "/metadata/name").to_owned();

	let mut version = 0;
	let mut first_deployed = None;
	let mut last_deployed = None;
	if let Some(history) = app.pointer("/status/history").and_then(Value::as_array) {
		version = history
			.last()
			.and_then(|entry| entry.get("id"))
			.and_then(Value::as_i64)
			.unwrap_or_default();
		for deployed_at in history
			.iter()
			.filter_map(|entry| entry.get("deployedAt").and_then(Value::as_str))
		{
			if first_deployed.is_none() {
				first_deployed = Some(deployed_at.to_owned());
			}
			last_deployed = Some(deployed_at.to_owned());
		}
	}

	let mut home = str_at(app, "/spec/source/repoURL");
	if home.starts_with("https://github.com") {
		home = home.strip_suffix(".git").unwrap_or(home);
	}
	let home = home.strip_suffix('/').unwrap_or(home).to_owned();

	let manifest = app
		.pointer("/status/resources")
		.and_then(Value::as_array)
		.and_then(|resources| match render_manifest(&name, resources) {
			Ok(manifest) => Some(manifest),
			Err(e) => {
				tracing::warn!(name = %name, error = %e, "failed rendering application manifest");
				None
			}
		});

	ReleaseRecord {
		namespace: str_at(app, "/metadata/namespace").to_owned(),
		info: ReleaseInfo {
			first_deployed,
			last_deployed,
			status: ReleaseStatus::from_health(
				app.pointer("/status/health/status").and_then(Value::as_str),
			),
		},
		chart: ChartRecord {
			metadata: ChartMetadata {
				name: name.clone(),
				home,
				version: str_at(app, "/spec/source/targetRevision").to_owned(),
				api_version: "v2".to_owned(),
				chart_type: "application".to_owned(),
			},
		},
		manifest,
		version,
		name,
	}
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ManagedResource<'a> {
	api_version: String,
	kind: &'a str,
	metadata: ManagedMetadata<'a>,
}

#[derive(Serialize)]
struct ManagedMetadata<'a> {
	name: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	namespace: Option<&'a str>,
	labels: ReleaseLabels<'a>,
}

#[derive(Serialize)]
struct ReleaseLabels<'a> {
	#[serde(rename = "helm.sh/chart")]
	chart: &'a str,
	#[serde(rename = "argocd.argoproj.io/instance")]
	instance: &'a str,
}

/// Multi-document YAML listing the resources the application manages.
fn render_manifest(release: &str, resources: &[Value]) -> Result<String, serde_yaml::Error> {
	let documents = resources
		.iter()
		.filter(|res| res.is_object())
		.map(|res| {
			let group = str_at(res, "/group");
			let version = str_at(res, "/version");
			let api_version = if group.is_empty() {
				version.to_owned()
			} else {
				format!("{group}/{version}")
			};
			serde_yaml::to_string(&ManagedResource {
				api_version,
				kind: str_at(res, "/kind"),
				metadata: ManagedMetadata {
					name: str_at(res, "/name"),
					namespace: Some(str_at(res, "/namespace")).filter(|ns| !ns.is_empty()),
					labels: ReleaseLabels {
						chart: release,
						instance: release,
					},
				},
			})
		})
		.collect::<Result<Vec<_>, _>>()?;

	Ok(format!("---\n{}", documents.join("---\n")))
}

#[cfg(test)]
mod tests {
	use indoc::indoc;
	use rstest::rstest;
	use serde_json::json;

	use super::*;
	use crate::object::TaggedObject;

	fn application(payload: Value) -> TaggedObject {
		TaggedObject::builder()
			.kind("Application")
			.uid("app")
			.payload(payload)
			.build()
	}

	#[test]
	fn test_helm_application_becomes_release() {
		let objects: ObjectSet = [
			application(json!({
				"metadata": {"name": "grafana", "namespace": "argocd"},
				"spec": {"source": {
					"repoURL": "https://github.com/example/charts.git",
					"targetRevision": "6.1.0"
				}},
				"status": {
					"sourceType": "Helm",
					"health": {"status": "Healthy"},
					"history": [
						{"id": 1, "deployedAt": "2024-01-01T00:00:00Z"},
						{"id": 2},
						{"id": 3, "deployedAt": "2024-02-01T00:00:00Z"}
					],
					"resources": [
						{"group": "apps", "version": "v1", "kind": "Deployment", "name": "grafana", "namespace": "monitoring"},
						{"version": "v1", "kind": "Namespace", "name": "monitoring"}
					]
				}
			})),
			application(json!({"metadata": {"name": "plain"}, "status": {"sourceType": "Kustomize"}})),
			TaggedObject::builder().kind("Pod").uid("pod").build(),
		]
		.into_iter()
		.collect();

		let releases = argo_helm_releases(&objects);
		assert_eq!(releases.len(), 1);
		let release = &releases[0];

		assert_eq!(release.name, "grafana");
		assert_eq!(release.namespace, "argocd");
		assert_eq!(release.version, 3);
		assert_eq!(release.info.status, ReleaseStatus::Deployed);
		assert_eq!(
			release.info.first_deployed.as_deref(),
			Some("2024-01-01T00:00:00Z")
		);
		assert_eq!(
			release.info.last_deployed.as_deref(),
			Some("2024-02-01T00:00:00Z")
		);
		assert_eq!(
			release.chart.metadata,
			ChartMetadata {
				name: "grafana".into(),
				home: "https://github.com/example/charts".into(),
				version: "6.1.0".into(),
				api_version: "v2".into(),
				chart_type: "application".into(),
			}
		);
		assert_eq!(
			release.manifest.as_deref(),
			Some(indoc! {"
				---
				apiVersion: apps/v1
				kind: Deployment
				metadata:
				  name: grafana
				  namespace: monitoring
				  labels:
				    helm.sh/chart: grafana
				    argocd.argoproj.io/instance: grafana
				---
				apiVersion: v1
				kind: Namespace
				metadata:
				  name: monitoring
				  labels:
				    helm.sh/chart: grafana
				    argocd.argoproj.io/instance: grafana
			"})
		);
	}

	#[test]
	fn test_release_wire_shape() {
		let objects: ObjectSet = [application(json!({
			"metadata": {"name": "app"},
			"spec": {"source": {"repoURL": "https://charts.example.com/"}},
			"status": {"sourceType": "Helm"}
		}))]
		.into_iter()
		.collect();

		let releases = argo_helm_releases(&objects);
		assert_eq!(
			serde_json::to_value(&releases[0]).unwrap(),
			json!({
				"name": "app",
				"namespace": "",
				"info": {"status": "unknown"},
				"chart": {"metadata": {
					"name": "app",
					"home": "https://charts.example.com",
					"version": "",
					"apiVersion": "v2",
					"type": "application"
				}},
				"version": 0
			})
		);
	}

	#[test]
	fn test_manifest_quotes_unusual_values() {
		let resources = [
			json!({"kind": "Widget", "name": "no-version"}),
			json!({"version": "v1", "kind": "ConfigMap", "name": "yes", "namespace": "a: b"}),
			json!("not a resource"),
		];
		let manifest = render_manifest("shop", &resources).unwrap();
		assert!(manifest.starts_with("---\napiVersion: ''\n"), "{manifest}");

		let documents: Vec<serde_yaml::Value> = manifest
			.split("---\n")
			.filter(|doc| !doc.is_empty())
			.map(|doc| serde_yaml::from_str(doc).unwrap())
			.collect();
		assert_eq!(documents.len(), 2);
		assert_eq!(documents[0]["apiVersion"].as_str(), Some(""));
		assert_eq!(documents[0]["metadata"]["namespace"], serde_yaml::Value::Null);
		assert_eq!(documents[1]["metadata"]["name"].as_str(), Some("yes"));
		assert_eq!(documents[1]["metadata"]["namespace"].as_str(), Some("a: b"));
		assert_eq!(
			documents[1]["metadata"]["labels"]["argocd.argoproj.io/instance"].as_str(),
			Some("shop")
		);
	}

	#[rstest]
	#[case(Some("Healthy"), ReleaseStatus::Deployed)]
	#[case(Some("Progressing"), ReleaseStatus::Deployed)]
	#[case(Some("Degraded"), ReleaseStatus::Failed)]
	#[case(Some("missing"), ReleaseStatus::Failed)]
	#[case(Some("Unknown"), ReleaseStatus::Unknown)]
	#[case(None, ReleaseStatus::Unknown)]
	fn test_health_mapping(#[case] health: Option<&str>, #[case] expected: ReleaseStatus) {
		assert_eq!(ReleaseStatus::from_health(health), expected);
	}
}
