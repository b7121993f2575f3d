//! Cluster-backed data providers.

pub mod helm;
pub mod objects;
pub mod types;

use k8s_inventory::DataProvider;
use kube::Client;

pub use helm::{HelmProvider, StorageDriver};
pub use objects::ObjectsProvider;
pub use types::TypesProvider;

/// Providers for a regular run, in the order they are executed.
pub fn default_providers(client: &Client) -> Vec<Box<dyn DataProvider>> {
	vec![
		Box::new(ObjectsProvider::new(client.clone())),
		Box::new(TypesProvider::new(client.clone())),
		Box::new(HelmProvider::new(client.clone(), StorageDriver::from_env())),
	]
}
