//! Resource types known to the cluster.

use async_trait::async_trait;
use k8s_inventory::{
	provider::{Collected, DataProvider, ProviderError, ResourceType},
	Config,
};
use kube::Client;

use crate::k8s::discover_resources;

pub const SOURCE: &str = "types";

pub struct TypesProvider {
	client: Client,
}

impl TypesProvider {
	pub fn new(client: Client) -> Self {
		Self { client }
	}
}

#[async_trait]
impl DataProvider for TypesProvider {
	fn source_name(&self) -> &str {
		SOURCE
	}

	async fn run(&self, _config: &Config) -> Result<Collected, ProviderError> {
		let types = discover_resources(&self.client)
			.await
			.map_err(|e| ProviderError::new(SOURCE, e))?
			.into_iter()
			.map(|resource| ResourceType {
				namespaced: resource.namespaced(),
				kind: resource.api_resource.kind,
				api_version: resource.api_resource.api_version,
			})
			.collect();
		Ok(Collected::Types(types))
	}
}
