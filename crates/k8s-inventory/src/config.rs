//! Collector configuration.
//!
//! Settings are read from a directory holding one file per key (the layout a
//! mounted ConfigMap produces) while credentials come from the environment.
//! A missing key falls back to its default; so does a value that fails to
//! parse.

use std::{
	collections::BTreeMap,
	fmt, fs, io,
	path::{Path, PathBuf},
	time::Duration,
};

use phf::phf_set;
use thiserror::Error;

/// Environment variable holding the ingestion service access key.
pub const ACCESS_KEY_ENV: &str = "INFRALIGHT_ACCESS_KEY";
/// Environment variable holding the ingestion service secret key.
pub const SECRET_KEY_ENV: &str = "INFRALIGHT_SECRET_KEY";

pub const DEFAULT_CONFIG_DIR: &str = "/etc/config";
pub const DEFAULT_ENDPOINT: &str = "https://k8s-api.prod.external.api.infralight.cloud";
pub const DEFAULT_LOGIN_ENDPOINT: &str = "https://prod.external.api.infralight.cloud";
/// Endpoint written by old installations, replaced by [`DEFAULT_ENDPOINT`].
const LEGACY_ENDPOINT: &str = "https://prodapi.infralight.cloud/api";

const DEFAULT_PAGE_SIZE_KB: usize = 500;
const DEFAULT_MAX_CONCURRENCY: usize = 50;
const DEFAULT_LIST_PAGE_SIZE: u32 = 500;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const RESOURCE_TOGGLE_PREFIX: &str = "collector.resources.";

/// Resource types collected when `collector.resources` is not configured.
pub static DEFAULT_RESOURCE_TYPES: phf::Set<&'static str> = phf_set! {
	"apiservices",
	"analysistemplates",
	"clusteranalysistemplates",
	"clusterroles",
	"clusterrolebindings",
	"configmaps",
	"controllerrevisions",
	"csinodes",
	"cronjobs",
	"customresourcedefinitions",
	"daemonsets",
	"deployments",
	"endpoints",
	"endpointslices",
	"flowschemas",
	"ingresses",
	"jobs",
	"leases",
	"namespaces",
	"networkpolicies",
	"nodes",
	"persistentvolumeclaims",
	"persistentvolumes",
	"pods",
	"priorityclasses",
	"prioritylevelconfigurations",
	"replicasets",
	"replicationcontrollers",
	"roles",
	"rolebindings",
	"rollouts",
	"rollouts/finalizers",
	"rollouts/status",
	"serviceaccounts",
	"services",
	"services/status",
	"statefulsets",
	"storageclasses",
};

/// Errors raised before any network call is made.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
	#[error("access and secret keys must be provided (set {ACCESS_KEY_ENV} and {SECRET_KEY_ENV})")]
	MissingCredentials,

	#[error("invalid cluster ID `{0}`, must match ^[a-z0-9_-]+$")]
	InvalidClusterId(String),
}

/// Ingestion service credentials.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
	pub access_key: String,
	pub secret_key: String,
}

impl Credentials {
	pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
		Self {
			access_key: access_key.into(),
			secret_key: secret_key.into(),
		}
	}

	/// Read credentials from [`ACCESS_KEY_ENV`] and [`SECRET_KEY_ENV`].
	pub fn from_env() -> Self {
		Self {
			access_key: std::env::var(ACCESS_KEY_ENV).unwrap_or_default(),
			secret_key: std::env::var(SECRET_KEY_ENV).unwrap_or_default(),
		}
	}

	fn is_complete(&self) -> bool {
		!self.access_key.is_empty() && !self.secret_key.is_empty()
	}
}

impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credentials")
			.field("access_key", &self.access_key)
			.field("secret_key", &"<redacted>")
			.finish()
	}
}

/// Configuration shared by the orchestrator, the uploader and the providers.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
	pub config_dir: PathBuf,
	/// Only read from the cluster; no authentication, no delivery.
	pub dry_run: bool,
	pub credentials: Credentials,
	/// Base URL of the ingestion service.
	pub endpoint: String,
	/// Base URL of the authentication service.
	pub login_endpoint: String,
	/// Only collect from this namespace when set.
	pub watch_namespace: Option<String>,
	pub ignore_namespaces: Vec<String>,
	/// Resource names (plural, lowercase) and whether they may be collected.
	pub allowed_resources: BTreeMap<String, bool>,
	pub override_unique_cluster_id: bool,
	pub page_size_kb: usize,
	pub max_concurrency: usize,
	pub max_item_size_kb: usize,
	/// Items requested per list call against the cluster.
	pub list_page_size: u32,
	/// Copy object payloads into tree nodes.
	pub tree_payloads: bool,
	pub request_timeout: Duration,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
			dry_run: false,
			credentials: Credentials::default(),
			endpoint: DEFAULT_ENDPOINT.to_owned(),
			login_endpoint: DEFAULT_LOGIN_ENDPOINT.to_owned(),
			watch_namespace: None,
			ignore_namespaces: Vec::new(),
			allowed_resources: DEFAULT_RESOURCE_TYPES
				.iter()
				.map(|r| ((*r).to_owned(), true))
				.collect(),
			override_unique_cluster_id: false,
			page_size_kb: DEFAULT_PAGE_SIZE_KB,
			max_concurrency: DEFAULT_MAX_CONCURRENCY,
			max_item_size_kb: DEFAULT_PAGE_SIZE_KB,
			list_page_size: DEFAULT_LIST_PAGE_SIZE,
			tree_payloads: false,
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
		}
	}
}

impl Config {
	/// Load configuration from `config_dir`.
	///
	/// Credentials are required unless `dry_run` is set.
	pub fn load(
		config_dir: impl AsRef<Path>,
		credentials: Credentials,
		dry_run: bool,
	) -> Result<Self, ConfigError> {
		if !dry_run && !credentials.is_complete() {
			return Err(ConfigError::MissingCredentials);
		}

		let dir = ConfigDir(config_dir.as_ref());

		let endpoint = dir
			.one("endpoint")
			.map(|e| e.trim_end_matches('/').to_owned())
			.filter(|e| !e.is_empty() && e != LEGACY_ENDPOINT)
			.unwrap_or_else(|| DEFAULT_ENDPOINT.to_owned());
		let login_endpoint = dir
			.one("loginEndpoint")
			.map(|e| e.trim_end_matches('/').to_owned())
			.filter(|e| !e.is_empty())
			.unwrap_or_else(|| DEFAULT_LOGIN_ENDPOINT.to_owned());

		let mut allowed_resources = dir.resource_toggles();
		match dir.many("collector.resources") {
			Some(resources) => {
				for resource in resources {
					allowed_resources.insert(resource, true);
				}
			}
			None => {
				for resource in &DEFAULT_RESOURCE_TYPES {
					allowed_resources.insert((*resource).to_owned(), true);
				}
			}
		}

		let page_size_kb = dir
			.parsed("collector.PageSize")
			.filter(|&size| size > 0)
			.unwrap_or(DEFAULT_PAGE_SIZE_KB);
		let max_concurrency = dir
			.parsed("collector.MaxConcurrency")
			.or_else(|| dir.parsed("collector.MaxGoRoutines"))
			.unwrap_or(DEFAULT_MAX_CONCURRENCY)
			.max(1);

		Ok(Self {
			config_dir: dir.0.to_path_buf(),
			dry_run,
			credentials,
			endpoint,
			login_endpoint,
			watch_namespace: dir.one("collector.watchNamespace"),
			ignore_namespaces: dir.many("collector.ignoreNamespaces").unwrap_or_default(),
			allowed_resources,
			override_unique_cluster_id: dir
				.parsed("collector.OverrideUniqueClusterId")
				.unwrap_or(false),
			page_size_kb,
			max_concurrency,
			max_item_size_kb: dir
				.parsed("collector.MaxItemSizeKB")
				.filter(|&size| size > 0)
				.map_or(page_size_kb, |size: usize| size.min(page_size_kb)),
			list_page_size: dir
				.parsed("collector.ListPageSize")
				.filter(|&size| size > 0)
				.unwrap_or(DEFAULT_LIST_PAGE_SIZE),
			tree_payloads: dir.parsed("collector.TreePayloads").unwrap_or(false),
			request_timeout: dir
				.parsed("collector.RequestTimeoutSecs")
				.map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_secs),
		})
	}

	/// Byte budget of one delivery page.
	pub fn page_budget(&self) -> usize {
		self.page_size_kb * 1000
	}

	/// Largest single item that may be delivered, never more than a page.
	pub fn item_cap(&self) -> usize {
		self.max_item_size_kb.min(self.page_size_kb) * 1000
	}

	pub fn is_resource_allowed(&self, resource: &str) -> bool {
		self.allowed_resources
			.get(resource)
			.copied()
			.unwrap_or(false)
	}

	/// Whether objects from `namespace` should be collected. Cluster-scoped
	/// objects (empty namespace) are always collected.
	pub fn should_collect_namespace(&self, namespace: &str) -> bool {
		if namespace.is_empty() {
			return true;
		}
		if let Some(watched) = &self.watch_namespace {
			return watched == namespace;
		}
		!self.ignore_namespaces.iter().any(|ns| ns == namespace)
	}
}

/// Reader over a directory of single-value configuration files.
struct ConfigDir<'a>(&'a Path);

impl ConfigDir<'_> {
	fn raw(&self, key: &str) -> Option<String> {
		match fs::read_to_string(self.0.join(key)) {
			Ok(contents) => Some(contents),
			Err(e) if e.kind() == io::ErrorKind::NotFound => None,
			Err(e) => {
				tracing::warn!(key, error = %e, "failed loading configuration key");
				None
			}
		}
	}

	fn one(&self, key: &str) -> Option<String> {
		self.raw(key)
			.map(|v| v.trim().to_owned())
			.filter(|v| !v.is_empty())
	}

	/// Newline separated list; blank lines are skipped.
	fn many(&self, key: &str) -> Option<Vec<String>> {
		let values: Vec<String> = self
			.one(key)?
			.lines()
			.map(str::trim)
			.filter(|line| !line.is_empty())
			.map(str::to_owned)
			.collect();
		Some(values)
	}

	fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
		let value = self.one(key)?;
		match value.parse() {
			Ok(parsed) => Some(parsed),
			Err(_) => {
				tracing::warn!(key, value, "ignoring unparseable configuration value");
				None
			}
		}
	}

	/// Legacy `collector.resources.<name>` boolean toggles.
	fn resource_toggles(&self) -> BTreeMap<String, bool> {
		let Ok(entries) = fs::read_dir(self.0) else {
			return BTreeMap::new();
		};

		entries
			.filter_map(Result::ok)
			.filter_map(|entry| {
				let file_name = entry.file_name();
				let key = file_name.to_str()?;
				let resource = key.strip_prefix(RESOURCE_TOGGLE_PREFIX)?;
				if resource.is_empty() {
					return None;
				}
				let enabled = self.parsed::<bool>(key).unwrap_or(false);
				Some((resource.to_lowercase(), enabled))
			})
			.collect()
	}
}
