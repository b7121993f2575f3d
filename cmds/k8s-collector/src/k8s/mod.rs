//! Kubernetes API access.

pub mod client;
pub mod discovery;
mod list;

pub use client::{ClusterConnection, ConnectionError};
pub use discovery::{discover_resources, DiscoveredResource, DiscoveryError};
pub use list::list_all;
