//! Run orchestration.
//!
//! A run validates its input, authenticates, opens a fetch session, collects
//! from every provider, reconstructs the ownership forest and delivers the
//! objects, trees and releases families in that order before committing.

use std::io::Write;

use bon::Builder;
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

use crate::{
	chunk::ChunkLimits,
	client::{ClientError, IngestClient},
	config::{Config, ConfigError},
	filter::argo_helm_releases,
	object::{ObjectSet, TaggedObject},
	provider::{ClusterIdentity, Collected, DataProvider, ProviderError, Release, ResourceType},
	session::{ClusterId, Session, SessionState},
	tree::{ObjectTree, TreeBuilder, TreeError},
	upload::{DeliveryError, FamilyPayload, FamilySummary, PayloadFamily, Uploader},
};

/// A run failed. Each variant names the phase that failed.
#[derive(Debug, Error)]
pub enum RunError {
	#[error(transparent)]
	Config(#[from] ConfigError),

	#[error("failed creating the ingestion client")]
	Client(#[source] ClientError),

	#[error("failed authenticating with the ingestion service")]
	Auth(#[source] ClientError),

	#[error("failed finding the unique cluster ID")]
	Identity(#[source] ProviderError),

	#[error("failed starting a new fetch session")]
	OpenSession(#[source] ClientError),

	#[error("all {0} data providers failed")]
	Collect(usize, #[source] ProviderError),

	#[error("failed building the ownership forest")]
	Tree(#[from] TreeError),

	#[error("failed delivering {}", .0.family())]
	Delivery(#[from] DeliveryError),

	#[error("failed writing dry-run output")]
	Output(#[source] serde_json::Error),
}

/// Everything collected during one run.
#[derive(Debug, Default)]
pub struct Inventory {
	pub objects: ObjectSet,
	pub types: Vec<ResourceType>,
	pub releases: Vec<Release>,
	/// Providers that failed and contributed nothing.
	pub failed_providers: Vec<String>,
}

impl Inventory {
	fn absorb(&mut self, collected: Collected) {
		match collected {
			Collected::Objects(objects) => self.objects.extend(objects),
			Collected::Types(types) => self.types.extend(types),
			Collected::Releases(releases) => self.releases.extend(releases),
		}
	}
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DryRunOutput<'a> {
	k8s_objects: &'a [TaggedObject],
	k8s_trees: &'a [ObjectTree],
	helm_releases: &'a [Release],
	k8s_types: &'a [ResourceType],
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
	pub cluster_id: ClusterId,
	/// Absent for dry runs.
	pub fetching_id: Option<String>,
	pub objects: usize,
	pub roots: usize,
	pub releases: usize,
	pub failed_providers: Vec<String>,
	pub families: Vec<FamilySummary>,
	pub state: SessionState,
}

impl RunReport {
	pub fn committed(&self) -> bool {
		self.state == SessionState::Committed
	}
}

/// Orchestrates one collection run.
#[derive(Builder)]
pub struct Collector {
	#[builder(into)]
	cluster_id: String,
	config: Config,
	identity: Box<dyn ClusterIdentity>,
	#[builder(default)]
	providers: Vec<Box<dyn DataProvider>>,
}

struct Lifecycle(SessionState);

impl Lifecycle {
	fn advance(&mut self, next: SessionState) {
		tracing::debug!(from = %self.0, to = %next, "session state");
		self.0 = next;
	}
}

impl Collector {
	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Run collection and delivery.
	///
	/// Nothing is retried. A failure while delivering any family abandons the
	/// session without committing; a failed commit is logged and the run still
	/// succeeds.
	#[instrument(skip_all, fields(cluster_id = %self.cluster_id))]
	pub async fn run(&self) -> Result<RunReport, RunError> {
		let cluster_id = ClusterId::parse(self.cluster_id.as_str())?;
		let mut lifecycle = Lifecycle(SessionState::Unauthenticated);

		let result = self.deliver(cluster_id, &mut lifecycle).await;
		if result.is_err() {
			lifecycle.advance(SessionState::Failed);
		}
		result
	}

	async fn deliver(
		&self,
		cluster_id: ClusterId,
		lifecycle: &mut Lifecycle,
	) -> Result<RunReport, RunError> {
		let client = IngestClient::new(&self.config).map_err(RunError::Client)?;

		tracing::debug!("authenticating with the ingestion service");
		let token = client
			.login(&self.config.credentials)
			.await
			.map_err(RunError::Auth)?;
		lifecycle.advance(SessionState::Authenticated);
		tracing::info!("authenticated with the ingestion service");

		let unique_cluster_id = self
			.identity
			.unique_cluster_id()
			.await
			.map_err(RunError::Identity)?;
		let session = Session::new(cluster_id.clone(), unique_cluster_id, token.access_token);
		client
			.open_session(&session)
			.await
			.map_err(RunError::OpenSession)?;
		lifecycle.advance(SessionState::SessionOpened);
		let fetching_id = session.fetching_id().to_owned();
		tracing::info!(fetching_id = %fetching_id, "started new fetch session");

		let inventory = self.collect().await?;
		let forest = self.tree_builder().build_forest(&inventory.objects)?;

		let uploader = Uploader::builder()
			.client(client)
			.session(session)
			.limits(ChunkLimits::new(
				self.config.page_budget(),
				self.config.item_cap(),
			))
			.max_concurrency(self.config.max_concurrency)
			.build();

		let mut families = Vec::with_capacity(3);

		lifecycle.advance(SessionState::SendingObjects);
		let objects = FamilyPayload::new(PayloadFamily::Objects, inventory.objects.iter())?;
		families.push(uploader.send_family(objects).await?);

		lifecycle.advance(SessionState::SendingTrees);
		let trees = FamilyPayload::new(PayloadFamily::Trees, &forest)?;
		families.push(uploader.send_family(trees).await?);

		lifecycle.advance(SessionState::SendingReleases);
		if inventory.releases.is_empty() {
			tracing::debug!("no releases found, skipping releases family");
		} else {
			let releases = FamilyPayload::new(PayloadFamily::Releases, &inventory.releases)?
				.with_extra("k8sTypes", &inventory.types)?;
			families.push(uploader.send_family(releases).await?);
		}

		match uploader.commit().await {
			Ok(()) => {
				lifecycle.advance(SessionState::Committed);
				tracing::info!("fetch session committed");
			}
			Err(e) => {
				tracing::error!(error = %e, source = %e.source, "failed committing fetch session");
			}
		}

		Ok(RunReport {
			cluster_id,
			fetching_id: Some(fetching_id),
			objects: inventory.objects.len(),
			roots: forest.len(),
			releases: inventory.releases.len(),
			failed_providers: inventory.failed_providers,
			families,
			state: lifecycle.0,
		})
	}

	/// Collect and reconstruct without authenticating or delivering, writing
	/// the result as JSON to `out`.
	#[instrument(skip_all, fields(cluster_id = %self.cluster_id))]
	pub async fn dry_run(&self, out: impl Write) -> Result<RunReport, RunError> {
		let cluster_id = ClusterId::parse(self.cluster_id.as_str())?;

		let inventory = self.collect().await?;
		let forest = self.tree_builder().build_forest(&inventory.objects)?;

		serde_json::to_writer_pretty(
			out,
			&DryRunOutput {
				k8s_objects: inventory.objects.as_slice(),
				k8s_trees: &forest,
				helm_releases: &inventory.releases,
				k8s_types: &inventory.types,
			},
		)
		.map_err(RunError::Output)?;

		Ok(RunReport {
			cluster_id,
			fetching_id: None,
			objects: inventory.objects.len(),
			roots: forest.len(),
			releases: inventory.releases.len(),
			failed_providers: inventory.failed_providers,
			families: Vec::new(),
			state: SessionState::Unauthenticated,
		})
	}

	/// Run every provider in order and apply post-collection filters.
	///
	/// A failing provider is logged and skipped. The run only fails when every
	/// provider failed.
	async fn collect(&self) -> Result<Inventory, RunError> {
		tracing::debug!(amount = self.providers.len(), "running data providers");

		let mut inventory = Inventory::default();
		let mut last_error = None;
		for provider in &self.providers {
			match provider.run(&self.config).await {
				Ok(collected) => inventory.absorb(collected),
				Err(e) => {
					tracing::error!(
						source_name = provider.source_name(),
						error = %e.source,
						"data provider failed"
					);
					inventory.failed_providers.push(provider.source_name().to_owned());
					last_error = Some(e);
				}
			}
		}

		if let Some(e) = last_error {
			if inventory.failed_providers.len() == self.providers.len() {
				return Err(RunError::Collect(self.providers.len(), e));
			}
		}

		let argo = argo_helm_releases(&inventory.objects);
		inventory
			.releases
			.extend(argo.into_iter().map(Release::Synthesized));

		tracing::info!(
			objects = inventory.objects.len(),
			types = inventory.types.len(),
			releases = inventory.releases.len(),
			"collection finished"
		);
		Ok(inventory)
	}

	fn tree_builder(&self) -> TreeBuilder {
		TreeBuilder::builder()
			.include_payloads(self.config.tree_payloads)
			.build()
	}
}
