use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use k8s_collector::{k8s::ClusterConnection, providers::default_providers, telemetry};
use k8s_inventory::{config::DEFAULT_CONFIG_DIR, Collector, Config, Credentials, RunReport};

#[derive(Parser)]
#[command(name = "k8s-collector")]
#[command(about = "Collect the Kubernetes inventory of a cluster and ship it for ingestion", long_about = None)]
#[command(version)]
struct Cli {
	/// Identifier of the cluster in the ingestion service
	#[arg(env = "CLUSTER_ID")]
	cluster_id: String,

	/// Log at debug level with human readable output
	#[arg(long)]
	debug: bool,

	/// Connect using this kubeconfig instead of the in-cluster service account
	#[arg(long, value_name = "KUBECONFIG")]
	external: Option<PathBuf>,

	/// Directory holding one configuration key per file
	#[arg(long, default_value = DEFAULT_CONFIG_DIR)]
	config: PathBuf,

	/// Print the collected inventory as JSON instead of delivering it
	#[arg(long)]
	dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	telemetry::init(cli.debug);

	let config = Config::load(&cli.config, Credentials::from_env(), cli.dry_run)
		.with_context(|| format!("loading configuration from {}", cli.config.display()))?;

	let connection = ClusterConnection::connect(cli.external.as_deref())
		.await
		.context("connecting to the cluster")?;
	tracing::info!(cluster = %connection.cluster_url(), "connected to cluster");

	let collector = Collector::builder()
		.cluster_id(cli.cluster_id)
		.providers(default_providers(connection.client()))
		.identity(Box::new(connection))
		.config(config)
		.build();

	let report = if cli.dry_run {
		collector
			.dry_run(std::io::stdout().lock())
			.await
			.context("dry run failed")?
	} else {
		collector.run().await.context("collection run failed")?
	};
	log_report(&report);
	Ok(())
}

fn log_report(report: &RunReport) {
	for family in &report.families {
		tracing::info!(
			family = %family.family,
			pages = family.pages,
			items = family.items,
			dropped = family.dropped,
			"family delivered"
		);
	}
	tracing::info!(
		cluster_id = %report.cluster_id,
		fetching_id = report.fetching_id.as_deref().unwrap_or_default(),
		objects = report.objects,
		roots = report.roots,
		releases = report.releases,
		failed_providers = ?report.failed_providers,
		committed = report.committed(),
		"run finished"
	);
}
