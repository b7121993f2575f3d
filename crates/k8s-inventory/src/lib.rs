//! Kubernetes inventory reconstruction and delivery.
//!
//! Objects collected from a cluster are arranged into an ownership forest
//! ([`tree`]), split into size-bounded pages ([`chunk`]) and shipped to the
//! ingestion service under an authenticated fetch session ([`upload`]). The
//! [`collector::Collector`] ties these together for one run.

pub mod chunk;
pub mod client;
pub mod collector;
pub mod config;
pub mod filter;
pub mod object;
pub mod provider;
pub mod session;
pub mod tree;
pub mod upload;

pub use collector::{Collector, RunError, RunReport};
pub use config::{Config, ConfigError, Credentials};
pub use object::{ObjectSet, OwnerRef, TaggedObject};
pub use provider::{ClusterIdentity, Collected, DataProvider, ProviderError, Release, ResourceType};
pub use tree::{ObjectTree, TreeBuilder, TreeError};
