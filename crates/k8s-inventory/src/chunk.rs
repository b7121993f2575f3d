//! Size-bounded paging of delivery items.

/// An ordered batch of items sent as one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk<T> {
	items: Vec<T>,
	bytes: usize,
}

impl<T> Chunk<T> {
	fn new() -> Self {
		Self {
			items: Vec::new(),
			bytes: 0,
		}
	}

	pub fn items(&self) -> &[T] {
		&self.items
	}

	pub fn into_items(self) -> Vec<T> {
		self.items
	}

	pub fn len(&self) -> usize {
		self.items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	/// Sum of the serialized sizes of the items in this chunk.
	pub fn bytes(&self) -> usize {
		self.bytes
	}
}

/// An item that was left out because it exceeded the per-item cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DroppedItem {
	/// Position of the item in the input sequence.
	pub index: usize,
	pub bytes: usize,
}

/// Result of paging a sequence of items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunked<T> {
	pub chunks: Vec<Chunk<T>>,
	pub dropped: Vec<DroppedItem>,
}

impl<T> Chunked<T> {
	/// True when there is nothing to send.
	pub fn is_empty(&self) -> bool {
		self.chunks.is_empty()
	}
}

/// Limits applied while paging.
///
/// The per-item cap never exceeds the budget, so no chunk is ever larger than
/// the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
	budget: usize,
	item_cap: usize,
}

impl ChunkLimits {
	/// `item_cap` is lowered to `budget` when larger.
	pub fn new(budget: usize, item_cap: usize) -> Self {
		Self {
			budget,
			item_cap: item_cap.min(budget),
		}
	}

	/// Limit on the cumulative size of one chunk.
	pub fn budget(&self) -> usize {
		self.budget
	}

	/// Limit on a single item; larger items are dropped.
	pub fn item_cap(&self) -> usize {
		self.item_cap
	}

	/// Limits left for items once `overhead` bytes of every chunk are spent
	/// elsewhere.
	#[must_use]
	pub fn shrink(self, overhead: usize) -> Self {
		Self::new(
			self.budget.saturating_sub(overhead),
			self.item_cap.saturating_sub(overhead),
		)
	}
}

/// Split `items` into chunks whose cumulative size stays within the budget.
///
/// An item that would push a non-empty chunk over the budget starts a new
/// chunk. Items over the per-item cap never reach a chunk. Empty input yields
/// no chunks.
pub fn chunk<T, F>(items: impl IntoIterator<Item = T>, limits: ChunkLimits, size_of: F) -> Chunked<T>
where
	F: Fn(&T) -> usize,
{
	let mut chunks = Vec::new();
	let mut dropped = Vec::new();
	let mut current = Chunk::new();

	for (index, item) in items.into_iter().enumerate() {
		let bytes = size_of(&item);
		if bytes > limits.item_cap {
			tracing::warn!(
				index,
				bytes,
				cap = limits.item_cap,
				"dropping item larger than the per-item cap"
			);
			dropped.push(DroppedItem { index, bytes });
			continue;
		}

		if !current.is_empty() && current.bytes + bytes > limits.budget {
			chunks.push(std::mem::replace(&mut current, Chunk::new()));
		}
		current.bytes += bytes;
		current.items.push(item);
	}

	if !current.is_empty() {
		chunks.push(current);
	}

	Chunked { chunks, dropped }
}

#[cfg(test)]
mod tests {
	use rstest::rstest;

	use super::*;
	use crate::config::Config;

	fn sizes(chunked: &Chunked<usize>) -> Vec<Vec<usize>> {
		chunked
			.chunks
			.iter()
			.map(|c| c.items().to_vec())
			.collect()
	}

	#[test]
	fn test_each_item_over_remaining_budget_starts_a_chunk() {
		let chunked = chunk([300, 300, 300], ChunkLimits::new(500, 10_000), |s| *s);
		assert_eq!(sizes(&chunked), vec![vec![300], vec![300], vec![300]]);
		assert!(chunked.dropped.is_empty());
	}

	#[rstest]
	#[case(vec![100, 200, 200, 100], 500, vec![vec![100, 200, 200], vec![100]])]
	#[case(vec![500, 1], 500, vec![vec![500], vec![1]])]
	#[case(vec![1, 499, 1], 500, vec![vec![1, 499], vec![1]])]
	#[case(vec![250, 250, 250, 250], 500, vec![vec![250, 250], vec![250, 250]])]
	fn test_boundaries(
		#[case] items: Vec<usize>,
		#[case] budget: usize,
		#[case] expected: Vec<Vec<usize>>,
	) {
		let chunked = chunk(items, ChunkLimits::new(budget, 10_000), |s| *s);
		assert_eq!(sizes(&chunked), expected);
	}

	#[test]
	fn test_empty_input_yields_no_chunks() {
		let chunked = chunk(Vec::<usize>::new(), ChunkLimits::new(500, 500), |s| *s);
		assert!(chunked.is_empty());
	}

	#[test]
	fn test_item_over_budget_is_dropped_even_under_cap() {
		let limits = ChunkLimits::new(500, 5_000);
		assert_eq!(limits.item_cap(), 500);

		let chunked = chunk([1, 700, 1], limits, |s| *s);
		assert_eq!(sizes(&chunked), vec![vec![1, 1]]);
		assert_eq!(chunked.dropped, vec![DroppedItem { index: 1, bytes: 700 }]);
	}

	#[test]
	fn test_shrink_reserves_overhead() {
		let limits = ChunkLimits::new(500, 400).shrink(50);
		assert_eq!((limits.budget(), limits.item_cap()), (450, 350));
		assert_eq!(ChunkLimits::new(10, 10).shrink(50).budget(), 0);
	}

	#[test]
	fn test_oversized_items_are_dropped() {
		let chunked = chunk([10, 5_000, 20], ChunkLimits::new(100, 1_000), |s| *s);
		assert_eq!(sizes(&chunked), vec![vec![10, 20]]);
		assert_eq!(
			chunked.dropped,
			vec![DroppedItem {
				index: 1,
				bytes: 5_000
			}]
		);
	}

	#[test]
	fn test_only_dropped_items_is_nothing_to_send() {
		let chunked = chunk([5_000], ChunkLimits::new(100, 1_000), |s| *s);
		assert!(chunked.is_empty());
		assert_eq!(chunked.dropped.len(), 1);
	}

	#[rstest]
	#[case(ChunkLimits::new(400, 400))]
	#[case(ChunkLimits::new(400, 10_000))]
	#[case(ChunkLimits::new(Config::default().page_budget(), Config::default().item_cap()))]
	fn test_budget_and_order_hold_for_mixed_sizes(#[case] limits: ChunkLimits) {
		let budget = limits.budget();
		// sizes span well past the budget so some items are dropped
		let items: Vec<usize> = (0..500).map(|i| (i * 7_919) % (budget * 2) + 1).collect();
		let chunked = chunk(items.clone(), limits, |s| *s);

		for c in &chunked.chunks {
			assert!(c.bytes() <= budget, "chunk of {} bytes over {budget}", c.bytes());
			assert_eq!(c.bytes(), c.items().iter().sum::<usize>());
		}

		let kept: Vec<usize> = items.iter().copied().filter(|&s| s <= budget).collect();
		let flattened: Vec<usize> = chunked
			.chunks
			.into_iter()
			.flat_map(Chunk::into_items)
			.collect();
		assert_eq!(flattened, kept);
		assert_eq!(chunked.dropped.len(), items.len() - kept.len());
	}
}
