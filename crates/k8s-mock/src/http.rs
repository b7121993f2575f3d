//! HTTP-based mock Kubernetes server using wiremock.
//!
//! The server is read-only: it answers version and discovery requests and
//! serves GET and LIST requests over a fixed set of manifests, including
//! `limit`/`continue` pagination and equality label selectors.

use std::{
	collections::{BTreeMap, HashSet},
	sync::Arc,
};

use bon::Builder;
use kube::config::{
	AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext,
};
use serde_json::{json, Value};
use tracing::{debug, trace};
use wiremock::{
	matchers::{header_regex, method, path, path_regex},
	Mock, MockServer, Request, ResponseTemplate,
};

use super::discovery::{DiscoveryMode, MockApiResource, MockDiscovery};

const AGGREGATED_DISCOVERY_CONTENT_TYPE: &str =
	"application/json;g=apidiscovery.k8s.io;v=v2;as=APIGroupDiscoveryList";

/// Manifests by collection path (`/api/v1/namespaces/default/pods`), then name.
type Store = BTreeMap<String, BTreeMap<String, Value>>;

/// A mock Kubernetes server exposed over HTTP.
#[derive(Builder)]
pub struct HttpMockK8sServer {
	#[builder(default)]
	discovery_mode: DiscoveryMode,
	#[builder(default)]
	discovery: MockDiscovery,
	/// Resources to serve as raw manifests. API paths are derived from
	/// apiVersion/kind using the discovery data; manifests without a
	/// `metadata.uid` get a generated one.
	#[builder(default)]
	resources: Vec<Value>,
	/// uid of the `kube-system` namespace, which is always present.
	#[builder(into, default = "kube-system-uid".to_owned())]
	kube_system_uid: String,
	/// Plural resource names whose list requests fail with 500.
	#[builder(default)]
	failing_resources: Vec<String>,
}

/// A running HTTP mock server instance.
pub struct RunningHttpMockK8sServer {
	server: MockServer,
}

impl HttpMockK8sServer {
	/// Start the mock server with all configured resources.
	pub async fn start(self) -> RunningHttpMockK8sServer {
		let server = MockServer::start().await;
		debug!(uri = %server.uri(), "started mock K8s server");

		let mut store = Store::new();
		for mut manifest in self.resources {
			let Some((collection, name)) = collection_for_manifest(&manifest, &self.discovery)
			else {
				debug!(manifest = %manifest, "no discovery entry for manifest, skipping");
				continue;
			};
			if manifest.pointer("/metadata/uid").is_none() {
				let uid = format!("{}-{name}", collection.trim_start_matches('/').replace('/', "-"));
				manifest["metadata"]["uid"] = Value::String(uid);
			}
			trace!(collection = %collection, name = %name, "registered resource");
			store.entry(collection).or_default().insert(name, manifest);
		}

		let namespaces = store.entry("/api/v1/namespaces".to_owned()).or_default();
		for (name, uid) in [
			("default", "default-uid"),
			("kube-system", self.kube_system_uid.as_str()),
		] {
			namespaces.entry(name.to_owned()).or_insert_with(|| {
				json!({
					"apiVersion": "v1",
					"kind": "Namespace",
					"metadata": {"name": name, "uid": uid}
				})
			});
		}

		let state = Arc::new(ServerState {
			store,
			discovery: self.discovery,
			failing: self.failing_resources.into_iter().collect(),
		});

		mount_version(&server).await;
		mount_discovery(&server, &state.discovery, self.discovery_mode).await;
		mount_reads(&server, state).await;

		RunningHttpMockK8sServer { server }
	}
}

impl RunningHttpMockK8sServer {
	/// Get the server's URI (e.g., "http://127.0.0.1:12345").
	pub fn uri(&self) -> String {
		self.server.uri()
	}

	/// Requests the server received so far.
	pub async fn received_requests(&self) -> Vec<Request> {
		self.server.received_requests().await.unwrap_or_default()
	}

	/// Create a Kubeconfig pointing to this mock server.
	pub fn kubeconfig(&self) -> Kubeconfig {
		let cluster_name = "mock-cluster";
		let user_name = "mock-user";
		let context_name = "mock-context";

		Kubeconfig {
			clusters: vec![NamedCluster {
				name: cluster_name.to_owned(),
				cluster: Some(Cluster {
					server: Some(self.uri()),
					insecure_skip_tls_verify: Some(true),
					..Default::default()
				}),
			}],
			contexts: vec![NamedContext {
				name: context_name.to_owned(),
				context: Some(Context {
					cluster: cluster_name.to_owned(),
					user: Some(user_name.to_owned()),
					namespace: Some("default".to_owned()),
					..Default::default()
				}),
			}],
			auth_infos: vec![NamedAuthInfo {
				name: user_name.to_owned(),
				auth_info: Some(AuthInfo::default()),
			}],
			current_context: Some(context_name.to_owned()),
			..Default::default()
		}
	}
}

/// Derive the collection path and object name for a manifest.
fn collection_for_manifest(manifest: &Value, discovery: &MockDiscovery) -> Option<(String, String)> {
	let api_version = manifest.get("apiVersion")?.as_str()?;
	let kind = manifest.get("kind")?.as_str()?;
	let name = manifest.pointer("/metadata/name")?.as_str()?.to_owned();
	let namespace = manifest
		.pointer("/metadata/namespace")
		.and_then(Value::as_str)
		.unwrap_or("default");

	let resource = discovery.find_kind(api_version, kind)?;
	let prefix = if api_version.contains('/') {
		format!("/apis/{api_version}")
	} else {
		format!("/api/{api_version}")
	};
	let collection = if resource.namespaced {
		format!("{prefix}/namespaces/{namespace}/{}", resource.name)
	} else {
		format!("{prefix}/{}", resource.name)
	};

	Some((collection, name))
}

/// Strip the `/namespaces/<ns>` segment of a namespaced collection path.
fn cluster_wide(collection: &str) -> Option<String> {
	let (before, after) = collection.split_once("/namespaces/")?;
	let (_, resource) = after.split_once('/')?;
	Some(format!("{before}/{resource}"))
}

struct ServerState {
	store: Store,
	discovery: MockDiscovery,
	failing: HashSet<String>,
}

impl ServerState {
	fn respond(&self, req: &Request) -> ResponseTemplate {
		let path = req.url.path().trim_end_matches('/');
		let (parent, last) = path.rsplit_once('/').unwrap_or(("", path));

		if !self.discovery.has_resource(last) {
			return match self.store.get(parent).and_then(|objects| objects.get(last)) {
				Some(object) => ResponseTemplate::new(200).set_body_json(object),
				None => status(404, "NotFound", &format!("{last} not found")),
			};
		}

		if self.failing.contains(last) {
			return status(500, "InternalError", &format!("listing {last} failed"));
		}

		let mut items: Vec<&Value> = match self.store.get(path) {
			Some(objects) => objects.values().collect(),
			None => self
				.store
				.iter()
				.filter(|(collection, _)| cluster_wide(collection).as_deref() == Some(path))
				.flat_map(|(_, objects)| objects.values())
				.collect(),
		};

		let query: BTreeMap<String, String> = req.url.query_pairs().into_owned().collect();
		if let Some(selector) = query.get("labelSelector").filter(|s| !s.is_empty()) {
			items.retain(|item| matches_selector(item, selector));
		}

		let offset: usize = query
			.get("continue")
			.and_then(|c| c.parse().ok())
			.unwrap_or(0);
		let limit = query
			.get("limit")
			.and_then(|l| l.parse().ok())
			.filter(|&l: &usize| l > 0)
			.unwrap_or(usize::MAX);
		let end = offset.saturating_add(limit).min(items.len());
		let page = items.get(offset.min(end)..end).unwrap_or_default();

		let mut metadata = json!({"resourceVersion": "1"});
		if end < items.len() {
			metadata["continue"] = Value::String(end.to_string());
		}
		ResponseTemplate::new(200).set_body_json(json!({
			"kind": "List",
			"apiVersion": "v1",
			"metadata": metadata,
			"items": page,
		}))
	}
}

/// Equality-based label selector (`a=b,c=d`).
fn matches_selector(item: &Value, selector: &str) -> bool {
	selector.split(',').all(|requirement| {
		let Some((key, expected)) = requirement.split_once('=') else {
			return true;
		};
		item.pointer("/metadata/labels")
			.and_then(|labels| labels.get(key.trim()))
			.and_then(Value::as_str)
			== Some(expected.trim())
	})
}

fn status(code: u16, reason: &str, message: &str) -> ResponseTemplate {
	ResponseTemplate::new(code).set_body_json(json!({
		"kind": "Status",
		"apiVersion": "v1",
		"metadata": {},
		"status": "Failure",
		"message": message,
		"reason": reason,
		"code": code
	}))
}

async fn mount_version(server: &MockServer) {
	Mock::given(method("GET"))
		.and(path("/version"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"major": "1",
			"minor": "31",
			"gitVersion": "v1.31.0",
			"gitCommit": "fake",
			"gitTreeState": "clean",
			"buildDate": "2024-08-13T00:00:00Z",
			"goVersion": "go1.22.5",
			"compiler": "gc",
			"platform": "linux/amd64"
		})))
		.mount(server)
		.await;
}

fn aggregated_resource(resource: &MockApiResource, group: &str, version: &str) -> Value {
	json!({
		"resource": resource.name,
		"responseKind": {"group": group, "version": version, "kind": resource.kind},
		"scope": resource.scope(),
		"verbs": resource.verbs,
	})
}

fn legacy_resource(resource: &MockApiResource) -> Value {
	json!({
		"name": resource.name,
		"singularName": "",
		"namespaced": resource.namespaced,
		"kind": resource.kind,
		"verbs": resource.verbs,
	})
}

fn aggregated_group(group: &str, version: &str, resources: &[MockApiResource]) -> Value {
	let resources: Vec<_> = resources
		.iter()
		.map(|r| aggregated_resource(r, group, version))
		.collect();
	json!({
		"metadata": {"name": group},
		"versions": [{"version": version, "resources": resources, "freshness": "Current"}]
	})
}

async fn mount_discovery(server: &MockServer, discovery: &MockDiscovery, mode: DiscoveryMode) {
	let groups: Vec<(&str, &str, &str, &[MockApiResource])> = discovery
		.group_resources
		.iter()
		.map(|(gv, resources)| {
			let (group, version) = gv.split_once('/').unwrap_or(("", gv));
			(gv.as_str(), group, version, resources.as_slice())
		})
		.collect();

	// Aggregated endpoints only match when the client asks for them, so they
	// are mounted ahead of the legacy ones.
	for (route, body) in [
		(
			"/api",
			json!({
				"kind": "APIGroupDiscoveryList",
				"apiVersion": "apidiscovery.k8s.io/v2",
				"items": [aggregated_group("", "v1", &discovery.core_resources)],
			}),
		),
		(
			"/apis",
			json!({
				"kind": "APIGroupDiscoveryList",
				"apiVersion": "apidiscovery.k8s.io/v2",
				"items": groups
					.iter()
					.map(|(_, group, version, resources)| aggregated_group(group, version, resources))
					.collect::<Vec<_>>(),
			}),
		),
	] {
		let response = match mode {
			// set_body_json would overwrite the discovery content type
			DiscoveryMode::Aggregated => ResponseTemplate::new(200).set_body_raw(
				body.to_string().into_bytes(),
				AGGREGATED_DISCOVERY_CONTENT_TYPE,
			),
			DiscoveryMode::Legacy => ResponseTemplate::new(406),
		};
		Mock::given(method("GET"))
			.and(path(route))
			.and(header_regex("accept", "apidiscovery"))
			.respond_with(response)
			.mount(server)
			.await;
	}

	Mock::given(method("GET"))
		.and(path("/api"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIVersions",
			"versions": ["v1"],
			"serverAddressByClientCIDRs": []
		})))
		.mount(server)
		.await;

	let group_list: Vec<_> = groups
		.iter()
		.map(|(gv, group, version, _)| {
			json!({
				"name": group,
				"versions": [{"groupVersion": gv, "version": version}],
				"preferredVersion": {"groupVersion": gv, "version": version}
			})
		})
		.collect();
	Mock::given(method("GET"))
		.and(path("/apis"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIGroupList",
			"apiVersion": "v1",
			"groups": group_list
		})))
		.mount(server)
		.await;

	let resource_lists = std::iter::once(("v1", discovery.core_resources.as_slice()))
		.chain(groups.iter().map(|(gv, _, _, resources)| (*gv, *resources)));
	for (gv, resources) in resource_lists {
		let route = if gv.contains('/') {
			format!("/apis/{gv}")
		} else {
			format!("/api/{gv}")
		};
		Mock::given(method("GET"))
			.and(path(route))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"kind": "APIResourceList",
				"apiVersion": "v1",
				"groupVersion": gv,
				"resources": resources.iter().map(legacy_resource).collect::<Vec<_>>()
			})))
			.mount(server)
			.await;
	}
}

async fn mount_reads(server: &MockServer, state: Arc<ServerState>) {
	Mock::given(method("GET"))
		.and(path_regex(r"^/api(s)?/.+"))
		.respond_with(move |req: &Request| state.respond(req))
		.mount(server)
		.await;
}
