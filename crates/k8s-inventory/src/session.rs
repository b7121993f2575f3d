//! The fetch session: one authenticated delivery run.

use std::{fmt, sync::LazyLock};

use regex::Regex;
use uuid::Uuid;

use crate::config::ConfigError;

static CLUSTER_ID: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"^[a-z0-9_-]+$").expect("static regex is valid"));

/// A validated cluster identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterId(String);

impl ClusterId {
	pub fn parse(id: impl Into<String>) -> Result<Self, ConfigError> {
		let id = id.into();
		if CLUSTER_ID.is_match(&id) {
			Ok(Self(id))
		} else {
			Err(ConfigError::InvalidClusterId(id))
		}
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ClusterId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Where a run is in its delivery lifecycle. Any state may move to
/// [`SessionState::Failed`], which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Unauthenticated,
	Authenticated,
	SessionOpened,
	SendingObjects,
	SendingTrees,
	SendingReleases,
	Committed,
	Failed,
}

impl SessionState {
	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Committed | Self::Failed)
	}
}

impl fmt::Display for SessionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::Unauthenticated => "unauthenticated",
			Self::Authenticated => "authenticated",
			Self::SessionOpened => "session opened",
			Self::SendingObjects => "sending objects",
			Self::SendingTrees => "sending trees",
			Self::SendingReleases => "sending releases",
			Self::Committed => "committed",
			Self::Failed => "failed",
		};
		f.write_str(name)
	}
}

/// Identity shared by every request of one run.
#[derive(Clone)]
pub struct Session {
	cluster_id: ClusterId,
	unique_cluster_id: String,
	fetching_id: String,
	access_token: String,
}

impl Session {
	/// Start a session with a freshly generated fetch id.
	pub fn new(
		cluster_id: ClusterId,
		unique_cluster_id: impl Into<String>,
		access_token: impl Into<String>,
	) -> Self {
		Self {
			cluster_id,
			unique_cluster_id: unique_cluster_id.into(),
			fetching_id: Uuid::new_v4().simple().to_string(),
			access_token: access_token.into(),
		}
	}

	pub fn cluster_id(&self) -> &ClusterId {
		&self.cluster_id
	}

	pub fn unique_cluster_id(&self) -> &str {
		&self.unique_cluster_id
	}

	pub fn fetching_id(&self) -> &str {
		&self.fetching_id
	}

	pub fn access_token(&self) -> &str {
		&self.access_token
	}
}

impl fmt::Debug for Session {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Session")
			.field("cluster_id", &self.cluster_id)
			.field("unique_cluster_id", &self.unique_cluster_id)
			.field("fetching_id", &self.fetching_id)
			.field("access_token", &"<redacted>")
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use rstest::rstest;

	use super::*;

	#[rstest]
	#[case("prod-cluster_01")]
	#[case("a")]
	#[case("0-_")]
	fn test_valid_cluster_ids(#[case] id: &str) {
		assert_eq!(ClusterId::parse(id).unwrap().as_str(), id);
	}

	#[rstest]
	#[case("Prod Cluster!")]
	#[case("")]
	#[case("prod.cluster")]
	#[case("PROD")]
	fn test_invalid_cluster_ids(#[case] id: &str) {
		assert_matches!(
			ClusterId::parse(id),
			Err(ConfigError::InvalidClusterId(rejected)) if rejected == id
		);
	}

	#[test]
	fn test_fetching_id_is_fresh_hex() {
		let cluster = ClusterId::parse("prod").unwrap();
		let a = Session::new(cluster.clone(), "uid", "token");
		let b = Session::new(cluster, "uid", "token");

		assert_eq!(a.fetching_id().len(), 32);
		assert!(a
			.fetching_id()
			.chars()
			.all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
		assert_ne!(a.fetching_id(), b.fetching_id());
	}

	#[test]
	fn test_debug_hides_token() {
		let session = Session::new(ClusterId::parse("prod").unwrap(), "uid", "s3cr3t");
		assert!(!format!("{session:?}").contains("s3cr3t"));
	}
}
