//! Collected objects and the owner references between them.

use bon::Builder;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur when turning a raw manifest into a [`TaggedObject`].
#[derive(Debug, Error)]
pub enum ObjectError {
	#[error("{kind} object has no metadata.uid")]
	MissingUid { kind: String },

	#[error("manifest has no kind")]
	MissingKind,
}

/// A declared edge from a dependent object to the object managing its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
	pub uid: String,
	pub kind: String,
}

impl OwnerRef {
	pub fn new(uid: impl Into<String>, kind: impl Into<String>) -> Self {
		Self {
			uid: uid.into(),
			kind: kind.into(),
		}
	}
}

/// One collected resource.
///
/// Serializes to the wire shape expected by the ingestion service:
/// `{"kind": ..., "object": ...}`. Identity fields are derived from the payload
/// and are not repeated on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Builder)]
pub struct TaggedObject {
	#[builder(into)]
	kind: String,
	#[serde(skip)]
	#[builder(into)]
	uid: String,
	#[serde(skip)]
	#[builder(into, default)]
	namespace: String,
	#[serde(skip)]
	#[builder(into, default)]
	name: String,
	#[serde(skip)]
	#[builder(default)]
	owner_refs: Vec<OwnerRef>,
	#[serde(rename = "object")]
	#[builder(default)]
	payload: Value,
}

impl TaggedObject {
	/// Build an object from a raw resource body.
	///
	/// `kind` overrides the manifest's own `kind` field when non-empty, list
	/// responses do not always carry it on every item.
	pub fn from_manifest(kind: &str, payload: Value) -> Result<Self, ObjectError> {
		let kind = if kind.is_empty() {
			payload
				.get("kind")
				.and_then(Value::as_str)
				.filter(|k| !k.is_empty())
				.ok_or(ObjectError::MissingKind)?
				.to_owned()
		} else {
			kind.to_owned()
		};

		let metadata = payload.get("metadata");
		let meta_str = |field: &str| {
			metadata
				.and_then(|m| m.get(field))
				.and_then(Value::as_str)
				.unwrap_or_default()
				.to_owned()
		};

		let uid = meta_str("uid");
		if uid.is_empty() {
			return Err(ObjectError::MissingUid { kind });
		}

		let owner_refs = metadata
			.and_then(|m| m.get("ownerReferences"))
			.and_then(Value::as_array)
			.map(|refs| {
				refs.iter()
					.filter_map(|r| {
						let uid = r.get("uid")?.as_str()?;
						let kind = r.get("kind").and_then(Value::as_str).unwrap_or_default();
						Some(OwnerRef::new(uid, kind))
					})
					.collect()
			})
			.unwrap_or_default();

		Ok(Self {
			namespace: meta_str("namespace"),
			name: meta_str("name"),
			kind,
			uid,
			owner_refs,
			payload,
		})
	}

	pub fn kind(&self) -> &str {
		&self.kind
	}

	pub fn uid(&self) -> &str {
		&self.uid
	}

	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn owner_refs(&self) -> &[OwnerRef] {
		&self.owner_refs
	}

	pub fn payload(&self) -> &Value {
		&self.payload
	}

	/// Look up a label from `metadata.labels`.
	pub fn label(&self, key: &str) -> Option<&str> {
		self.payload
			.get("metadata")?
			.get("labels")?
			.get(key)?
			.as_str()
	}
}

/// The flat collection of objects gathered during one run.
#[derive(Debug, Clone, Default)]
pub struct ObjectSet {
	objects: Vec<TaggedObject>,
}

impl ObjectSet {
	pub fn new(objects: Vec<TaggedObject>) -> Self {
		Self { objects }
	}

	pub fn len(&self) -> usize {
		self.objects.len()
	}

	pub fn is_empty(&self) -> bool {
		self.objects.is_empty()
	}

	pub fn iter(&self) -> std::slice::Iter<'_, TaggedObject> {
		self.objects.iter()
	}

	pub fn as_slice(&self) -> &[TaggedObject] {
		&self.objects
	}

	pub fn into_inner(self) -> Vec<TaggedObject> {
		self.objects
	}
}

impl FromIterator<TaggedObject> for ObjectSet {
	fn from_iter<I: IntoIterator<Item = TaggedObject>>(iter: I) -> Self {
		Self::new(iter.into_iter().collect())
	}
}

impl Extend<TaggedObject> for ObjectSet {
	fn extend<I: IntoIterator<Item = TaggedObject>>(&mut self, iter: I) {
		self.objects.extend(iter);
	}
}

impl<'a> IntoIterator for &'a ObjectSet {
	type Item = &'a TaggedObject;
	type IntoIter = std::slice::Iter<'a, TaggedObject>;

	fn into_iter(self) -> Self::IntoIter {
		self.objects.iter()
	}
}
