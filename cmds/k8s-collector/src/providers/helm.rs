//! Deployed Helm releases, read from Helm's own release storage.

use std::io::{self, Read};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::GzDecoder;
use k8s_inventory::{
	provider::{Collected, DataProvider, ProviderError, Release},
	Config,
};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{api::ListParams, Api, Client, Resource};
use serde_json::Value;
use thiserror::Error;
use tracing::instrument;

use crate::k8s::list_all;

pub const SOURCE: &str = "helm";
pub const DRIVER_ENV: &str = "HELM_DRIVER";
const RELEASE_SELECTOR: &str = "owner=helm,status=deployed";
const RELEASE_KEY: &str = "release";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
pub enum ReleaseDecodeError {
	#[error("no release data")]
	Missing,
	#[error("invalid base64")]
	Base64(#[from] base64::DecodeError),
	#[error("invalid gzip stream")]
	Gzip(#[from] io::Error),
	#[error("invalid release json")]
	Json(#[from] serde_json::Error),
}

/// Where Helm keeps its release records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageDriver {
	#[default]
	Secret,
	ConfigMap,
}

impl StorageDriver {
	/// Parse the value of `HELM_DRIVER`. Drivers that do not live in the
	/// cluster fall back to secrets.
	pub fn parse(value: &str) -> Self {
		match value.to_ascii_lowercase().as_str() {
			"configmap" | "configmaps" => Self::ConfigMap,
			"" | "secret" | "secrets" => Self::Secret,
			other => {
				tracing::warn!(driver = other, "unsupported helm driver, using secrets");
				Self::Secret
			}
		}
	}

	pub fn from_env() -> Self {
		std::env::var(DRIVER_ENV).map_or(Self::Secret, |value| Self::parse(&value))
	}
}

/// Decode a stored release: base64 text, optionally gzipped, holding JSON.
pub fn decode_release(encoded: &[u8]) -> Result<Value, ReleaseDecodeError> {
	let trimmed = encoded.trim_ascii();
	if trimmed.is_empty() {
		return Err(ReleaseDecodeError::Missing);
	}
	let raw = STANDARD.decode(trimmed)?;
	if raw.starts_with(&GZIP_MAGIC) {
		let mut json = Vec::new();
		GzDecoder::new(raw.as_slice()).read_to_end(&mut json)?;
		Ok(serde_json::from_slice(&json)?)
	} else {
		Ok(serde_json::from_slice(&raw)?)
	}
}

pub struct HelmProvider {
	client: Client,
	driver: StorageDriver,
}

impl HelmProvider {
	pub fn new(client: Client, driver: StorageDriver) -> Self {
		Self { client, driver }
	}

	async fn stored_releases(&self, config: &Config) -> Result<Vec<StoredRelease>, kube::Error> {
		let params = ListParams::default()
			.labels(RELEASE_SELECTOR)
			.limit(config.list_page_size);
		let namespace = config.watch_namespace.as_deref();
		let stored: Vec<StoredRelease> = match self.driver {
			StorageDriver::Secret => list_all(&api::<Secret>(&self.client, namespace), params)
				.await?
				.into_iter()
				.map(|mut secret| {
					let data = secret
						.data
						.take()
						.and_then(|mut data| data.remove(RELEASE_KEY))
						.map(|bytes| bytes.0);
					StoredRelease::new(&secret, data)
				})
				.collect(),
			StorageDriver::ConfigMap => list_all(&api::<ConfigMap>(&self.client, namespace), params)
				.await?
				.into_iter()
				.map(|mut cm| {
					let data = cm
						.data
						.take()
						.and_then(|mut data| data.remove(RELEASE_KEY))
						.map(String::into_bytes);
					StoredRelease::new(&cm, data)
				})
				.collect(),
		};
		Ok(stored
			.into_iter()
			.filter(|release| config.should_collect_namespace(&release.namespace))
			.collect())
	}
}

/// Raw release data and where it was read from.
struct StoredRelease {
	namespace: String,
	name: String,
	data: Vec<u8>,
}

impl StoredRelease {
	fn new<K: Resource>(object: &K, data: Option<Vec<u8>>) -> Self {
		let meta = object.meta();
		Self {
			namespace: meta.namespace.clone().unwrap_or_default(),
			name: meta.name.clone().unwrap_or_default(),
			data: data.unwrap_or_default(),
		}
	}
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
	K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
	<K as Resource>::DynamicType: Default,
{
	match namespace {
		Some(ns) => Api::namespaced(client.clone(), ns),
		None => Api::all(client.clone()),
	}
}

#[async_trait]
impl DataProvider for HelmProvider {
	fn source_name(&self) -> &str {
		SOURCE
	}

	#[instrument(skip_all, fields(driver = ?self.driver))]
	async fn run(&self, config: &Config) -> Result<Collected, ProviderError> {
		let stored = self
			.stored_releases(config)
			.await
			.map_err(|e| ProviderError::new(SOURCE, e))?;

		let mut releases = Vec::with_capacity(stored.len());
		for release in stored {
			match decode_release(&release.data) {
				Ok(decoded) => releases.push(Release::Stored(decoded)),
				Err(e) => tracing::warn!(
					namespace = %release.namespace,
					name = %release.name,
					error = %e,
					"skipping undecodable helm release"
				),
			}
		}
		tracing::info!(releases = releases.len(), "collected helm releases");
		Ok(Collected::Releases(releases))
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use assert_matches::assert_matches;
	use flate2::{write::GzEncoder, Compression};
	use rstest::rstest;
	use serde_json::json;

	use super::*;

	fn gzipped(data: &[u8]) -> Vec<u8> {
		let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
		encoder.write_all(data).unwrap();
		encoder.finish().unwrap()
	}

	#[test]
	fn test_decode_gzipped_release() {
		let release = json!({"name": "nginx", "version": 2});
		let encoded = STANDARD.encode(gzipped(release.to_string().as_bytes()));
		assert_eq!(decode_release(encoded.as_bytes()).unwrap(), release);
	}

	#[test]
	fn test_decode_plain_release() {
		let encoded = STANDARD.encode(br#"{"name":"redis"}"#);
		assert_eq!(
			decode_release(format!("{encoded}\n").as_bytes()).unwrap(),
			json!({"name": "redis"})
		);
	}

	#[test]
	fn test_decode_errors() {
		assert_matches!(decode_release(b""), Err(ReleaseDecodeError::Missing));
		assert_matches!(decode_release(b"not base64!"), Err(ReleaseDecodeError::Base64(_)));
		let not_json = STANDARD.encode(b"hello");
		assert_matches!(decode_release(not_json.as_bytes()), Err(ReleaseDecodeError::Json(_)));
		let corrupt = STANDARD.encode([0x1f, 0x8b, 0x08, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]);
		assert_matches!(decode_release(corrupt.as_bytes()), Err(ReleaseDecodeError::Gzip(_)));
	}

	#[rstest]
	#[case("", StorageDriver::Secret)]
	#[case("secret", StorageDriver::Secret)]
	#[case("Secrets", StorageDriver::Secret)]
	#[case("configmap", StorageDriver::ConfigMap)]
	#[case("ConfigMaps", StorageDriver::ConfigMap)]
	#[case("sql", StorageDriver::Secret)]
	fn test_storage_driver(#[case] value: &str, #[case] expected: StorageDriver) {
		assert_eq!(StorageDriver::parse(value), expected);
	}
}
