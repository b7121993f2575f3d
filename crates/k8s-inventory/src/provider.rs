//! Data providers feeding a run.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::{config::Config, filter::ReleaseRecord, object::TaggedObject};

/// A provider failed to collect its data.
#[derive(Debug, Error)]
#[error("{source_name} provider failed")]
pub struct ProviderError {
	pub source_name: String,
	#[source]
	pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl ProviderError {
	pub fn new(
		source_name: impl Into<String>,
		source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
	) -> Self {
		Self {
			source_name: source_name.into(),
			source: source.into(),
		}
	}
}

/// One resource type known to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceType {
	pub kind: String,
	pub namespaced: bool,
	pub api_version: String,
}

/// A packaged release.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Release {
	/// A release record read from the release storage, delivered as is.
	Stored(Value),
	/// A release synthesized from a GitOps application.
	Synthesized(ReleaseRecord),
}

/// What a provider returned.
#[derive(Debug, Clone)]
pub enum Collected {
	Objects(Vec<TaggedObject>),
	Types(Vec<ResourceType>),
	Releases(Vec<Release>),
}

/// Something that collects one kind of data from the cluster.
#[async_trait]
pub trait DataProvider: Send + Sync {
	/// Unique name of the provider, used in logs and errors.
	fn source_name(&self) -> &str;

	async fn run(&self, config: &Config) -> Result<Collected, ProviderError>;
}

/// Resolves the identifier the cluster is known by regardless of its name.
#[async_trait]
pub trait ClusterIdentity: Send + Sync {
	async fn unique_cluster_id(&self) -> Result<String, ProviderError>;
}

#[async_trait]
impl ClusterIdentity for String {
	async fn unique_cluster_id(&self) -> Result<String, ProviderError> {
		Ok(self.clone())
	}
}
