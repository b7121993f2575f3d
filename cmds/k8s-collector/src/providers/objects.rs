//! Every listable object in the cluster.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_inventory::{
	provider::{Collected, DataProvider, ProviderError},
	Config, TaggedObject,
};
use kube::{
	api::{DynamicObject, ListParams},
	Api, Client,
};
use serde_json::Value;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::instrument;

use crate::k8s::{discover_resources, list_all, DiscoveredResource};

pub const SOURCE: &str = "objects";

/// Lists every resource type that is either allowed by the configuration or
/// comes from a custom resource definition.
pub struct ObjectsProvider {
	client: Client,
}

impl ObjectsProvider {
	pub fn new(client: Client) -> Self {
		Self { client }
	}
}

fn should_list(resource: &DiscoveredResource, config: &Config) -> bool {
	if !resource.listable() {
		return false;
	}
	config.is_resource_allowed(&resource.api_resource.plural) || !resource.is_core_group()
}

#[async_trait]
impl DataProvider for ObjectsProvider {
	fn source_name(&self) -> &str {
		SOURCE
	}

	#[instrument(skip_all)]
	async fn run(&self, config: &Config) -> Result<Collected, ProviderError> {
		let resources = discover_resources(&self.client)
			.await
			.map_err(|e| ProviderError::new(SOURCE, e))?;

		let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
		let mut join_set = JoinSet::new();

		for (index, resource) in resources
			.into_iter()
			.filter(|r| should_list(r, config))
			.enumerate()
		{
			let client = self.client.clone();
			let sem = Arc::clone(&semaphore);
			let namespace = config
				.watch_namespace
				.clone()
				.filter(|_| resource.namespaced());
			let page_size = config.list_page_size;

			join_set.spawn(async move {
				let _permit = sem.acquire().await.expect("semaphore closed");
				let result = list_resource(client, &resource, namespace.as_deref(), page_size).await;
				(index, resource, result)
			});
		}

		let mut listed = Vec::new();
		while let Some(joined) = join_set.join_next().await {
			let (index, resource, result) = joined.map_err(|e| ProviderError::new(SOURCE, e))?;
			match result {
				Ok(items) => listed.push((index, resource, items)),
				Err(e) => tracing::warn!(
					resource = %resource.api_resource.plural,
					api_version = %resource.api_resource.api_version,
					error = %e,
					"failed listing resource, skipping"
				),
			}
		}
		listed.sort_by_key(|(index, _, _)| *index);

		let mut objects = Vec::new();
		for (_, resource, items) in listed {
			let ar = &resource.api_resource;
			let before = objects.len();
			for item in items {
				if !config.should_collect_namespace(item.metadata.namespace.as_deref().unwrap_or_default()) {
					continue;
				}
				match tag(&resource, item) {
					Ok(object) => objects.push(object),
					Err(e) => tracing::warn!(kind = %ar.kind, error = %e, "skipping object"),
				}
			}
			tracing::debug!(
				resource = %ar.plural,
				api_version = %ar.api_version,
				items = objects.len() - before,
				"collected resource"
			);
		}

		tracing::info!(objects = objects.len(), "collected Kubernetes objects");
		Ok(Collected::Objects(objects))
	}
}

async fn list_resource(
	client: Client,
	resource: &DiscoveredResource,
	namespace: Option<&str>,
	page_size: u32,
) -> Result<Vec<DynamicObject>, kube::Error> {
	let ar = &resource.api_resource;
	let api: Api<DynamicObject> = match namespace {
		Some(ns) => Api::namespaced_with(client, ns, ar),
		None => Api::all_with(client, ar),
	};
	list_all(&api, ListParams::default().limit(page_size)).await
}

/// Stamp `apiVersion` and `kind` on a listed item, list responses omit them.
fn tag(
	resource: &DiscoveredResource,
	item: DynamicObject,
) -> Result<TaggedObject, Box<dyn std::error::Error + Send + Sync>> {
	let ar = &resource.api_resource;
	let mut payload = serde_json::to_value(item)?;
	if let Value::Object(map) = &mut payload {
		map.insert("apiVersion".to_owned(), Value::String(ar.api_version.clone()));
		map.insert("kind".to_owned(), Value::String(ar.kind.clone()));
	}
	Ok(TaggedObject::from_manifest(&ar.kind, payload)?)
}
