//! HTTP client for the ingestion service.

use std::io::Write as _;

use flate2::{write::GzEncoder, Compression};
use reqwest::{
	header::{HeaderValue, CONTENT_ENCODING, CONTENT_TYPE},
	Method, RequestBuilder, StatusCode,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::{
	config::{Config, Credentials},
	session::Session,
};

const USER_AGENT: &str = concat!("k8s-collector/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ClientError {
	#[error("failed to build HTTP client")]
	Build(#[source] reqwest::Error),

	#[error("request to {url} failed")]
	Request {
		url: String,
		#[source]
		source: reqwest::Error,
	},

	#[error("{method} {url} returned {status}: {body}")]
	Status {
		method: Method,
		url: String,
		status: StatusCode,
		body: String,
	},

	#[error("invalid response from {url}")]
	Decode {
		url: String,
		#[source]
		source: reqwest::Error,
	},
}

impl ClientError {
	/// Status code returned by the service, if the request got that far.
	pub fn status(&self) -> Option<StatusCode> {
		match self {
			Self::Status { status, .. } => Some(*status),
			Self::Request { source, .. } => source.status(),
			_ => None,
		}
	}
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
	access_key: &'a str,
	secret_key: &'a str,
}

/// Token returned by the authentication service.
#[derive(Deserialize)]
pub struct AccessToken {
	pub access_token: String,
	#[serde(default)]
	pub expires_in: u64,
	#[serde(default)]
	pub token_type: String,
}

impl std::fmt::Debug for AccessToken {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AccessToken")
			.field("expires_in", &self.expires_in)
			.field("token_type", &self.token_type)
			.finish_non_exhaustive()
	}
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommitRequest<'a> {
	fetching_id: &'a str,
	cluster_id: &'a str,
}

/// Client for the authentication and ingestion endpoints.
#[derive(Debug, Clone)]
pub struct IngestClient {
	http: reqwest::Client,
	endpoint: String,
	login_endpoint: String,
	override_unique_cluster_id: bool,
}

impl IngestClient {
	pub fn new(config: &Config) -> Result<Self, ClientError> {
		let http = reqwest::Client::builder()
			.timeout(config.request_timeout)
			.user_agent(USER_AGENT)
			.build()
			.map_err(ClientError::Build)?;

		Ok(Self {
			http,
			endpoint: config.endpoint.clone(),
			login_endpoint: config.login_endpoint.clone(),
			override_unique_cluster_id: config.override_unique_cluster_id,
		})
	}

	/// Exchange access keys for a bearer token.
	#[instrument(skip_all)]
	pub async fn login(&self, credentials: &Credentials) -> Result<AccessToken, ClientError> {
		let url = format!("{}/account/access_keys/login", self.login_endpoint);
		let request = self.http.post(&url).json(&LoginRequest {
			access_key: &credentials.access_key,
			secret_key: &credentials.secret_key,
		});
		let response = execute(Method::POST, &url, request).await?;

		let token = response
			.json::<AccessToken>()
			.await
			.map_err(|source| ClientError::Decode { url, source })?;
		tracing::debug!(expires_in = token.expires_in, "authenticated");
		Ok(token)
	}

	/// Announce a new fetch session. The service answers `204 No Content`.
	#[instrument(skip_all, fields(cluster_id = %session.cluster_id(), fetching_id = session.fetching_id()))]
	pub async fn open_session(&self, session: &Session) -> Result<(), ClientError> {
		let mut url = format!(
			"{}?clusterUniqueId={}&fetchingId={}",
			self.fetching_url(session),
			session.unique_cluster_id(),
			session.fetching_id(),
		);
		if self.override_unique_cluster_id {
			url.push_str("&overrideUniqueClusterId=1");
		}

		let request = self.http.head(&url).bearer_auth(session.access_token());
		let response = execute(Method::HEAD, &url, request).await?;
		if response.status() != StatusCode::NO_CONTENT {
			return Err(ClientError::Status {
				method: Method::HEAD,
				url,
				status: response.status(),
				body: String::new(),
			});
		}
		Ok(())
	}

	/// POST a serialized JSON page to `fetching/{path}`.
	pub async fn send_page(
		&self,
		session: &Session,
		path: &str,
		body: Vec<u8>,
	) -> Result<(), ClientError> {
		let url = format!("{}/{path}", self.fetching_url(session));
		let request = self
			.http
			.post(&url)
			.bearer_auth(session.access_token())
			.header(CONTENT_TYPE, HeaderValue::from_static("application/json"));

		let request = match gzip(&body) {
			Ok(compressed) => request
				.header(CONTENT_ENCODING, HeaderValue::from_static("gzip"))
				.body(compressed),
			Err(e) => {
				tracing::warn!(error = %e, "failed compressing page, sending it uncompressed");
				request.body(body)
			}
		};

		execute(Method::POST, &url, request).await?;
		Ok(())
	}

	/// Mark the fetch session complete.
	#[instrument(skip_all, fields(cluster_id = %session.cluster_id(), fetching_id = session.fetching_id()))]
	pub async fn commit(&self, session: &Session) -> Result<(), ClientError> {
		let url = self.fetching_url(session);
		let request = self
			.http
			.patch(&url)
			.bearer_auth(session.access_token())
			.json(&CommitRequest {
				fetching_id: session.fetching_id(),
				cluster_id: session.cluster_id().as_str(),
			});
		execute(Method::PATCH, &url, request).await?;
		Ok(())
	}

	fn fetching_url(&self, session: &Session) -> String {
		format!(
			"{}/integrations/k8s/{}/fetching",
			self.endpoint,
			session.cluster_id()
		)
	}
}

async fn execute(
	method: Method,
	url: &str,
	request: RequestBuilder,
) -> Result<reqwest::Response, ClientError> {
	let response = request.send().await.map_err(|source| ClientError::Request {
		url: url.to_owned(),
		source,
	})?;

	let status = response.status();
	if status.is_success() {
		return Ok(response);
	}

	let body = response.text().await.unwrap_or_default();
	Err(ClientError::Status {
		method,
		url: url.to_owned(),
		status,
		body,
	})
}

fn gzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
	let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 4), Compression::default());
	encoder.write_all(body)?;
	encoder.finish()
}
