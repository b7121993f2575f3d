//! Ownership forest reconstruction.
//!
//! Objects arrive as a flat list where each dependent names its owners by uid.
//! [`TreeBuilder`] turns that list into a forest rooted at the objects nobody
//! owns. Nodes live in an arena addressed by their position in the input, the
//! walk uses an explicit stack so arbitrarily deep ownership chains cannot
//! overflow the call stack.

mod heuristic;

use std::collections::HashMap;

use bon::Builder;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::instrument;

use crate::object::{ObjectSet, TaggedObject};

/// Errors that can occur while reconstructing the ownership forest.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
	#[error("uid `{0}` appears more than once in the collected objects")]
	DuplicateUid(String),

	#[error("ownership of `{uid}` is cyclic (walk reached depth {depth})")]
	CyclicOwnership { uid: String, depth: usize },
}

/// A node of the reconstructed forest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectTree {
	pub uid: String,
	pub kind: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(rename = "object", skip_serializing_if = "Option::is_none")]
	pub payload: Option<Value>,
	pub children: Vec<ObjectTree>,
}

impl ObjectTree {
	/// Number of nodes in this subtree, including the node itself.
	pub fn len(&self) -> usize {
		let mut count = 0;
		let mut stack = vec![self];
		while let Some(node) = stack.pop() {
			count += 1;
			stack.extend(node.children.iter());
		}
		count
	}

	/// Pre-order iterator over the uids in this subtree.
	pub fn uids(&self) -> impl Iterator<Item = &str> {
		let mut stack = vec![self];
		std::iter::from_fn(move || {
			let node = stack.pop()?;
			stack.extend(node.children.iter().rev());
			Some(node.uid.as_str())
		})
	}
}

// Deep chains would otherwise be dropped recursively.
impl Drop for ObjectTree {
	fn drop(&mut self) {
		let mut stack = std::mem::take(&mut self.children);
		while let Some(mut node) = stack.pop() {
			stack.append(&mut node.children);
		}
	}
}

/// Reconstructs ownership forests from flat object sets.
#[derive(Debug, Clone, Default, Builder)]
pub struct TreeBuilder {
	/// Copy each object's payload into its tree node.
	#[builder(default)]
	include_payloads: bool,
	/// Maximum walk depth before the input is considered cyclic. Defaults to
	/// the number of objects.
	max_depth: Option<usize>,
}

/// Counters describing one forest build, logged at debug level.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForestStats {
	pub roots: usize,
	pub inferred_parents: usize,
	pub attached: usize,
	pub dropped: usize,
	pub unresolved_refs: usize,
}

impl TreeBuilder {
	/// Build the ownership forest for `objects`.
	///
	/// Roots are objects with neither a declared nor an inferred owner, in input
	/// order. An object owned by several nodes is attached under the first owner
	/// reached by the depth-first walk; its remaining references are consumed
	/// without duplicating the node. Objects whose owners never appear in the
	/// forest are left out of it.
	#[instrument(skip_all, fields(objects = objects.len()))]
	pub fn build_forest(&self, objects: &ObjectSet) -> Result<Vec<ObjectTree>, TreeError> {
		let (forest, stats) = self.build_forest_with_stats(objects)?;
		tracing::debug!(
			roots = stats.roots,
			inferred_parents = stats.inferred_parents,
			attached = stats.attached,
			dropped = stats.dropped,
			unresolved_refs = stats.unresolved_refs,
			"built ownership forest"
		);
		Ok(forest)
	}

	pub fn build_forest_with_stats(
		&self,
		objects: &ObjectSet,
	) -> Result<(Vec<ObjectTree>, ForestStats), TreeError> {
		let objects = objects.as_slice();
		let n = objects.len();

		let mut by_uid: HashMap<&str, usize> = HashMap::with_capacity(n);
		for (i, obj) in objects.iter().enumerate() {
			if by_uid.insert(obj.uid(), i).is_some() {
				return Err(TreeError::DuplicateUid(obj.uid().to_owned()));
			}
		}

		let synthetic = heuristic::synthetic_owners(objects);
		let mut stats = ForestStats::default();

		// candidates[p]: objects naming p as an owner, in input order.
		// pending[i]: owner references of i that have not been resolved yet.
		let mut candidates: Vec<Vec<usize>> = vec![Vec::new(); n];
		let mut pending: Vec<usize> = vec![0; n];
		let mut roots = Vec::new();

		for (i, obj) in objects.iter().enumerate() {
			if obj.owner_refs().is_empty() {
				match synthetic[i] {
					Some(parent) => {
						stats.inferred_parents += 1;
						candidates[parent].push(i);
						pending[i] = 1;
					}
					None => roots.push(i),
				}
				continue;
			}

			let mut seen: Vec<&str> = Vec::with_capacity(obj.owner_refs().len());
			for owner in obj.owner_refs() {
				if seen.contains(&owner.uid.as_str()) {
					continue;
				}
				seen.push(&owner.uid);
				pending[i] += 1;
				if let Some(&parent) = by_uid.get(owner.uid.as_str()) {
					candidates[parent].push(i);
				}
			}
		}
		stats.roots = roots.len();

		let depth_cap = self.max_depth.unwrap_or(n).max(1);
		let mut attached = vec![false; n];
		let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
		let mut preorder = Vec::with_capacity(n);

		for &root in &roots {
			attached[root] = true;
			preorder.push(root);

			// (node, position of the next candidate to look at)
			let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
			while let Some(&(node, cursor)) = stack.last() {
				let Some(&candidate) = candidates[node].get(cursor) else {
					stack.pop();
					continue;
				};
				let top = stack.len() - 1;
				stack[top].1 += 1;

				pending[candidate] = pending[candidate].saturating_sub(1);
				if attached[candidate] {
					continue;
				}
				if stack.len() >= depth_cap {
					return Err(TreeError::CyclicOwnership {
						uid: objects[candidate].uid().to_owned(),
						depth: stack.len(),
					});
				}

				attached[candidate] = true;
				children[node].push(candidate);
				preorder.push(candidate);
				stack.push((candidate, 0));
			}
		}

		let unattached: Vec<usize> = (0..n).filter(|&i| !attached[i]).collect();
		if let Some(uid) = find_cycle(objects, &by_uid, &synthetic, &attached, &unattached) {
			return Err(TreeError::CyclicOwnership { uid, depth: 0 });
		}

		stats.attached = preorder.len();
		stats.dropped = unattached.len();
		stats.unresolved_refs = preorder.iter().map(|&i| pending[i]).sum();

		// Children always follow their parent in pre-order, so walking it
		// backwards builds every subtree before the node that owns it.
		let mut built: Vec<Option<ObjectTree>> = (0..n).map(|_| None).collect();
		for &i in preorder.iter().rev() {
			let node_children = children[i]
				.iter()
				.filter_map(|&child| built[child].take())
				.collect();
			built[i] = Some(self.node(&objects[i], node_children));
		}

		let forest = roots.iter().filter_map(|&root| built[root].take()).collect();
		Ok((forest, stats))
	}

	fn node(&self, obj: &TaggedObject, children: Vec<ObjectTree>) -> ObjectTree {
		ObjectTree {
			uid: obj.uid().to_owned(),
			kind: obj.kind().to_owned(),
			name: Some(obj.name())
				.filter(|name| !name.is_empty())
				.map(str::to_owned),
			payload: self.include_payloads.then(|| obj.payload().clone()),
			children,
		}
	}
}

/// Build the forest with default settings.
pub fn build_forest(objects: &ObjectSet) -> Result<Vec<ObjectTree>, TreeError> {
	TreeBuilder::default().build_forest(objects)
}

/// Look for an ownership cycle among objects the walk never reached.
///
/// Follows owner edges that stay inside the unattached set; returns the uid of
/// an object on a cycle.
fn find_cycle(
	objects: &[TaggedObject],
	by_uid: &HashMap<&str, usize>,
	synthetic: &[Option<usize>],
	attached: &[bool],
	unattached: &[usize],
) -> Option<String> {
	#[derive(Clone, Copy, PartialEq, Eq)]
	enum Mark {
		New,
		Active,
		Done,
	}

	let owners_of = |i: usize| -> Vec<usize> {
		let obj = &objects[i];
		if obj.owner_refs().is_empty() {
			return synthetic[i].into_iter().collect();
		}
		obj.owner_refs()
			.iter()
			.filter_map(|r| by_uid.get(r.uid.as_str()).copied())
			.filter(|&owner| !attached[owner])
			.collect()
	};

	let mut marks = vec![Mark::New; objects.len()];
	for &start in unattached {
		if marks[start] != Mark::New {
			continue;
		}
		marks[start] = Mark::Active;
		let mut stack = vec![(start, owners_of(start), 0usize)];

		while let Some((node, owners, cursor)) = stack.last_mut() {
			let Some(&owner) = owners.get(*cursor) else {
				marks[*node] = Mark::Done;
				stack.pop();
				continue;
			};
			*cursor += 1;

			match marks[owner] {
				Mark::Active => return Some(objects[owner].uid().to_owned()),
				Mark::Done => {}
				Mark::New => {
					marks[owner] = Mark::Active;
					let next = owners_of(owner);
					stack.push((owner, next, 0));
				}
			}
		}
	}

	None
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use serde_json::json;

	use super::*;
	use crate::object::OwnerRef;

	fn object(kind: &str, uid: &str, owners: &[&str]) -> TaggedObject {
		TaggedObject::builder()
			.kind(kind)
			.uid(uid)
			.name(uid)
			.namespace("default")
			.owner_refs(owners.iter().map(|o| OwnerRef::new(*o, "")).collect())
			.build()
	}

	fn set(objects: Vec<TaggedObject>) -> ObjectSet {
		ObjectSet::new(objects)
	}

	fn shape(tree: &ObjectTree) -> serde_json::Value {
		json!({
			"uid": tree.uid,
			"children": tree.children.iter().map(shape).collect::<Vec<_>>(),
		})
	}

	fn all_uids(forest: &[ObjectTree]) -> Vec<&str> {
		forest.iter().flat_map(ObjectTree::uids).collect()
	}

	#[test]
	fn test_namespace_owns_pod() {
		let forest = build_forest(&set(vec![
			object("Namespace", "a", &[]),
			object("Pod", "b", &["a"]),
		]))
		.unwrap();

		let shapes: Vec<_> = forest.iter().map(shape).collect();
		assert_eq!(
			shapes,
			vec![json!({"uid": "a", "children": [{"uid": "b", "children": []}]})]
		);
	}

	#[test]
	fn test_endpoints_become_child_of_service() {
		let svc = TaggedObject::builder()
			.kind("Service")
			.uid("svc-uid")
			.namespace("ns")
			.name("svc")
			.build();
		let ep = TaggedObject::builder()
			.kind("Endpoints")
			.uid("ep-uid")
			.namespace("ns")
			.name("svc")
			.build();

		let forest = build_forest(&set(vec![ep, svc])).unwrap();
		assert_eq!(forest.len(), 1);
		assert_eq!(forest[0].uid, "svc-uid");
		assert_eq!(forest[0].children.len(), 1);
		assert_eq!(forest[0].children[0].uid, "ep-uid");
	}

	#[test]
	fn test_input_order_is_kept_for_roots_and_siblings() {
		let forest = build_forest(&set(vec![
			object("Pod", "p2", &["rs"]),
			object("Namespace", "ns2", &[]),
			object("ReplicaSet", "rs", &["dep"]),
			object("Pod", "p1", &["rs"]),
			object("Deployment", "dep", &[]),
			object("Namespace", "ns1", &[]),
		]))
		.unwrap();

		let root_uids: Vec<_> = forest.iter().map(|t| t.uid.as_str()).collect();
		assert_eq!(root_uids, vec!["ns2", "dep", "ns1"]);
		assert_eq!(all_uids(&forest), vec!["ns2", "dep", "rs", "p2", "p1", "ns1"]);
	}

	#[test]
	fn test_shared_ownership_is_not_duplicated() {
		let (forest, stats) = TreeBuilder::default()
			.build_forest_with_stats(&set(vec![
				object("Node", "owner-a", &[]),
				object("Node", "owner-b", &[]),
				object("Lease", "shared", &["owner-b", "owner-a"]),
			]))
			.unwrap();

		assert_eq!(all_uids(&forest), vec!["owner-a", "shared", "owner-b"]);
		assert!(forest[1].children.is_empty());
		assert_eq!(stats.unresolved_refs, 0);
	}

	#[test]
	fn test_first_owner_reached_depth_first_claims_child() {
		// `shared` is owned by both the root and its grandchild; the walk reaches
		// the grandchild before coming back to the root's second candidate.
		let forest = build_forest(&set(vec![
			object("Deployment", "root", &[]),
			object("ReplicaSet", "mid", &["root"]),
			object("Pod", "shared", &["root", "mid"]),
		]))
		.unwrap();

		assert_eq!(
			shape(&forest[0]),
			json!({"uid": "root", "children": [
				{"uid": "mid", "children": [{"uid": "shared", "children": []}]}
			]})
		);
	}

	#[test]
	fn test_objects_with_missing_owners_are_dropped() {
		let (forest, stats) = TreeBuilder::default()
			.build_forest_with_stats(&set(vec![
				object("Namespace", "ns", &[]),
				object("Pod", "orphan", &["filtered-out-rs"]),
				object("Container", "orphan-child", &["orphan"]),
			]))
			.unwrap();

		assert_eq!(all_uids(&forest), vec!["ns"]);
		assert_eq!(stats.dropped, 2);
	}

	#[test]
	fn test_partially_resolved_owners_are_counted() {
		let (forest, stats) = TreeBuilder::default()
			.build_forest_with_stats(&set(vec![
				object("Namespace", "ns", &[]),
				object("Pod", "pod", &["ns", "absent"]),
			]))
			.unwrap();

		assert_eq!(all_uids(&forest), vec!["ns", "pod"]);
		assert_eq!(stats.unresolved_refs, 1);
	}

	#[test]
	fn test_duplicate_uid_is_rejected() {
		let result = build_forest(&set(vec![
			object("Pod", "same", &[]),
			object("Service", "same", &[]),
		]));
		assert_eq!(result, Err(TreeError::DuplicateUid("same".into())));
	}

	#[test]
	fn test_cycle_is_reported() {
		let result = build_forest(&set(vec![
			object("Namespace", "ns", &[]),
			object("A", "a", &["b"]),
			object("B", "b", &["c"]),
			object("C", "c", &["a"]),
		]));
		assert_matches!(result, Err(TreeError::CyclicOwnership { .. }));
	}

	#[test]
	fn test_self_ownership_is_a_cycle() {
		let result = build_forest(&set(vec![object("Pod", "me", &["me"])]));
		assert_matches!(result, Err(TreeError::CyclicOwnership { uid, .. }) if uid == "me");
	}

	#[test]
	fn test_depth_cap_fails_fast() {
		let result = TreeBuilder::builder()
			.max_depth(2)
			.build()
			.build_forest(&set(vec![
				object("A", "a", &[]),
				object("B", "b", &["a"]),
				object("C", "c", &["b"]),
			]));
		assert_matches!(result, Err(TreeError::CyclicOwnership { uid, depth: 2 }) if uid == "c");
	}

	#[test]
	fn test_deep_chain_does_not_overflow() {
		let depth = 20_000;
		let mut objects = vec![object("Root", "n0", &[])];
		for i in 1..depth {
			let parent = format!("n{}", i - 1);
			objects.push(object("Link", &format!("n{i}"), &[parent.as_str()]));
		}

		let forest = build_forest(&set(objects)).unwrap();
		assert_eq!(forest.len(), 1);
		assert_eq!(forest[0].len(), depth);
	}

	#[test]
	fn test_every_unowned_object_is_a_root_and_no_uid_repeats() {
		// A wide graph with shared owners and a few dangling references.
		let mut objects = Vec::new();
		for i in 0..20 {
			objects.push(object("Root", &format!("r{i}"), &[]));
		}
		for i in 0..200 {
			let a = format!("r{}", i % 20);
			let b = format!("r{}", (i * 7) % 20);
			let dangling = format!("gone{i}");
			let owners: Vec<&str> = if i % 13 == 0 {
				vec![dangling.as_str()]
			} else {
				vec![a.as_str(), b.as_str()]
			};
			objects.push(object("Leaf", &format!("l{i}"), &owners));
		}

		let forest = build_forest(&set(objects)).unwrap();

		let roots: Vec<_> = forest.iter().map(|t| t.uid.clone()).collect();
		let expected_roots: Vec<_> = (0..20).map(|i| format!("r{i}")).collect();
		assert_eq!(roots, expected_roots);

		let uids = all_uids(&forest);
		let mut deduped = uids.clone();
		deduped.sort_unstable();
		deduped.dedup();
		assert_eq!(uids.len(), deduped.len());
		assert_eq!(uids.len(), 20 + 200 - 16);
	}

	#[test]
	fn test_serialized_node_shape() {
		let root = TaggedObject::builder()
			.kind("Namespace")
			.uid("ns")
			.payload(json!({"metadata": {"uid": "ns"}}))
			.build();

		let forest = build_forest(&set(vec![root.clone()])).unwrap();
		assert_eq!(
			serde_json::to_value(&forest[0]).unwrap(),
			json!({"uid": "ns", "kind": "Namespace", "children": []})
		);

		let forest = TreeBuilder::builder()
			.include_payloads(true)
			.build()
			.build_forest(&set(vec![root]))
			.unwrap();
		assert_eq!(
			forest[0].payload.as_ref(),
			Some(&json!({"metadata": {"uid": "ns"}}))
		);
	}
}
