//! Inferred ownership for kinds that do not declare owner references.
//!
//! Kubernetes leaves a few well-known relationships implicit: an `Endpoints`
//! object shares its name with the `Service` it belongs to, dynamically
//! provisioned volumes are named after the claim they were created for, and
//! claims created from a `StatefulSet` volume claim template carry the set's
//! name and a pod ordinal.

use std::collections::HashMap;

use serde_json::Value;

use crate::object::TaggedObject;

const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";
const PROVISIONED_VOLUME_PREFIX: &str = "pvc-";

/// Lookup tables over the objects a heuristic parent can point at.
struct ParentIndex<'a> {
	services: HashMap<(&'a str, &'a str), usize>,
	claims_by_uid: HashMap<&'a str, usize>,
	claims_by_name: HashMap<(&'a str, &'a str), usize>,
	stateful_sets: HashMap<&'a str, Vec<(&'a str, usize)>>,
}

impl<'a> ParentIndex<'a> {
	fn new(objects: &'a [TaggedObject]) -> Self {
		let mut index = Self {
			services: HashMap::new(),
			claims_by_uid: HashMap::new(),
			claims_by_name: HashMap::new(),
			stateful_sets: HashMap::new(),
		};

		for (i, obj) in objects.iter().enumerate() {
			let key = (obj.namespace(), obj.name());
			match obj.kind() {
				"Service" => {
					index.services.entry(key).or_insert(i);
				}
				"PersistentVolumeClaim" => {
					index.claims_by_uid.entry(obj.uid()).or_insert(i);
					index.claims_by_name.entry(key).or_insert(i);
				}
				"StatefulSet" => index
					.stateful_sets
					.entry(obj.namespace())
					.or_default()
					.push((obj.name(), i)),
				_ => {}
			}
		}

		index
	}

	fn parent_of(&self, obj: &TaggedObject) -> Option<usize> {
		match obj.kind() {
			"Endpoints" => self.services.get(&(obj.namespace(), obj.name())).copied(),
			"EndpointSlice" => {
				let service = obj.label(SERVICE_NAME_LABEL)?;
				self.services.get(&(obj.namespace(), service)).copied()
			}
			"PersistentVolume" => self.claim_for_volume(obj),
			"PersistentVolumeClaim" => self.stateful_set_for_claim(obj),
			_ => None,
		}
	}

	fn claim_for_volume(&self, volume: &TaggedObject) -> Option<usize> {
		let claim_ref = volume.payload().pointer("/spec/claimRef");
		let field = |name: &str| claim_ref.and_then(|c| c.get(name)).and_then(Value::as_str);

		if let Some(idx) = field("uid").and_then(|uid| self.claims_by_uid.get(uid)) {
			return Some(*idx);
		}
		if let (Some(namespace), Some(name)) = (field("namespace"), field("name")) {
			if let Some(idx) = self.claims_by_name.get(&(namespace, name)) {
				return Some(*idx);
			}
		}

		let claim_uid = volume.name().strip_prefix(PROVISIONED_VOLUME_PREFIX)?;
		self.claims_by_uid.get(claim_uid).copied()
	}

	/// Claims from volume claim templates are named `<template>-<set>-<ordinal>`.
	fn stateful_set_for_claim(&self, claim: &TaggedObject) -> Option<usize> {
		let (base, ordinal) = claim.name().rsplit_once('-')?;
		if ordinal.is_empty() || !ordinal.bytes().all(|b| b.is_ascii_digit()) {
			return None;
		}

		self.stateful_sets
			.get(claim.namespace())?
			.iter()
			.filter(|(name, _)| base_matches(base, name))
			.max_by_key(|(name, _)| name.len())
			.map(|(_, idx)| *idx)
	}
}

fn base_matches(base: &str, set_name: &str) -> bool {
	if set_name.is_empty() {
		return false;
	}
	base == set_name
		|| base
			.strip_prefix(set_name)
			.is_some_and(|rest| rest.starts_with('-'))
		|| base
			.strip_suffix(set_name)
			.is_some_and(|rest| rest.ends_with('-'))
}

/// Compute the inferred parent (as an index into `objects`) for every object
/// that declares no owner references.
pub(super) fn synthetic_owners(objects: &[TaggedObject]) -> Vec<Option<usize>> {
	let index = ParentIndex::new(objects);

	objects
		.iter()
		.enumerate()
		.map(|(i, obj)| {
			if !obj.owner_refs().is_empty() {
				return None;
			}
			index.parent_of(obj).filter(|&parent| parent != i)
		})
		.collect()
}
