//! Kubernetes-backed pieces of the inventory collector: cluster connection,
//! resource discovery and the providers feeding a run.

pub mod k8s;
pub mod providers;
pub mod telemetry;
