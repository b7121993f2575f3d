//! Kubernetes cluster connection management.

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use k8s_inventory::provider::{ClusterIdentity, ProviderError};
use k8s_openapi::api::core::v1::Namespace;
use kube::{
	config::{InClusterError, KubeConfigOptions, Kubeconfig, KubeconfigError},
	Api, Client, Config,
};
use thiserror::Error;
use tracing::instrument;

/// Default timeout for Kubernetes API requests.
const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

/// Namespace whose uid identifies the cluster.
const IDENTITY_NAMESPACE: &str = "kube-system";

/// Errors that can occur when connecting to a Kubernetes cluster.
#[derive(Debug, Error)]
pub enum ConnectionError {
	#[error("not running inside a cluster, pass --external with a kubeconfig path")]
	InCluster(#[from] InClusterError),

	#[error(transparent)]
	Kubeconfig(#[from] KubeconfigError),

	#[error(transparent)]
	Kube(#[from] kube::Error),
}

#[derive(Debug, Error)]
#[error("namespace {IDENTITY_NAMESPACE} has no uid")]
struct MissingUid;

/// Represents a connection to a Kubernetes cluster.
#[derive(Clone)]
pub struct ClusterConnection {
	client: Client,
	/// Human-readable identifier for the cluster (API server URL).
	cluster_url: String,
}

impl std::fmt::Debug for ClusterConnection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClusterConnection")
			.field("cluster_url", &self.cluster_url)
			.finish_non_exhaustive()
	}
}

impl ClusterConnection {
	/// Connect using the in-cluster service account, or the kubeconfig at
	/// `external` when given.
	#[instrument(skip_all)]
	pub async fn connect(external: Option<&Path>) -> Result<Self, ConnectionError> {
		match external {
			Some(path) => {
				tracing::debug!(kubeconfig = %path.display(), "connecting from outside the cluster");
				Self::from_kubeconfig(Kubeconfig::read_from(path)?).await
			}
			None => Self::from_config(Config::incluster()?),
		}
	}

	/// Connect using the current context of a provided kubeconfig.
	#[instrument(skip_all)]
	pub async fn from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Self, ConnectionError> {
		let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
		Self::from_config(config)
	}

	fn from_config(mut config: Config) -> Result<Self, ConnectionError> {
		config.read_timeout = Some(DEFAULT_API_TIMEOUT);
		let cluster_url = config.cluster_url.to_string();
		let client = Client::try_from(config)?;
		tracing::debug!(cluster_url = %cluster_url, "connected to cluster");
		Ok(Self {
			client,
			cluster_url,
		})
	}

	/// Get a reference to the underlying kube client.
	pub fn client(&self) -> &Client {
		&self.client
	}

	pub fn cluster_url(&self) -> &str {
		&self.cluster_url
	}
}

#[async_trait]
impl ClusterIdentity for ClusterConnection {
	/// The uid of the `kube-system` namespace, which survives renames and
	/// context changes.
	async fn unique_cluster_id(&self) -> Result<String, ProviderError> {
		let namespaces: Api<Namespace> = Api::all(self.client.clone());
		let namespace = namespaces
			.get(IDENTITY_NAMESPACE)
			.await
			.map_err(|e| ProviderError::new("kubernetes", e))?;
		namespace
			.metadata
			.uid
			.ok_or_else(|| ProviderError::new("kubernetes", MissingUid))
	}
}
