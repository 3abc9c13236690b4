use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lru::LruCache;

use crate::catalog::DataSource;

/// Resource name to data source resolutions.
///
/// Every invalidation bumps a generation counter. A resolution fetched from
/// the catalog is only stored if no invalidation happened while it was in
/// flight, so an invalidated snapshot can never be re-inserted.
#[derive(Debug)]
pub struct ResolutionCache {
	state: Mutex<CacheState>,
}

#[derive(Debug)]
struct CacheState {
	entries: LruCache<String, DataSource>,
	generation: u64,
}

impl ResolutionCache {
	/// Cache holding at most `capacity` resolutions
	pub fn new(capacity: NonZeroUsize) -> Self {
		Self {
			state: Mutex::new(CacheState {
				entries: LruCache::new(capacity),
				generation: 0,
			}),
		}
	}

	/// Cached resolution for `name`
	pub fn get(&self, name: &str) -> Option<DataSource> {
		self.lock().entries.get(name).cloned()
	}

	/// Current generation, to be passed to [`insert`](Self::insert)
	pub fn generation(&self) -> u64 {
		self.lock().generation
	}

	/// Store a resolution fetched while the cache was at `generation`.
	///
	/// Returns false (and stores nothing) if the cache was invalidated since.
	pub fn insert(&self, name: String, ds: DataSource, generation: u64) -> bool {
		let mut state = self.lock();
		if state.generation != generation {
			return false;
		}
		state.entries.put(name, ds);
		true
	}

	/// Drop every resolution
	pub fn invalidate_all(&self) {
		let mut state = self.lock();
		state.entries.clear();
		state.generation = state.generation.wrapping_add(1);
	}

	/// Drop the resolution of one resource name
	pub fn remove(&self, name: &str) {
		let mut state = self.lock();
		state.entries.pop(name);
		state.generation = state.generation.wrapping_add(1);
	}

	/// Number of cached resolutions
	pub fn len(&self) -> usize {
		self.lock().entries.len()
	}

	/// True when nothing is cached
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn lock(&self) -> MutexGuard<'_, CacheState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::catalog::DataType;

	fn cache() -> ResolutionCache {
		ResolutionCache::new(NonZeroUsize::new(2).unwrap())
	}

	#[test]
	fn test_insert_and_get() {
		let cache = cache();
		let generation = cache.generation();
		assert!(cache.insert(
			"a".into(),
			DataSource::new("a", DataType::Float),
			generation
		));
		assert_eq!(cache.get("a").unwrap().resource, "a");
		assert!(cache.get("b").is_none());
	}

	#[test]
	fn test_stale_insert_is_rejected() {
		let cache = cache();
		let generation = cache.generation();
		cache.invalidate_all();
		assert!(!cache.insert(
			"a".into(),
			DataSource::new("a", DataType::Float),
			generation
		));
		assert!(cache.is_empty());
	}

	#[test]
	fn test_remove_and_invalidate() {
		let cache = cache();
		let generation = cache.generation();
		cache.insert("a".into(), DataSource::new("a", DataType::Float), generation);
		cache.insert("b".into(), DataSource::new("b", DataType::Bool), generation);
		cache.remove("a");
		assert!(cache.get("a").is_none());
		assert_eq!(cache.len(), 1);
		cache.invalidate_all();
		assert!(cache.is_empty());
	}

	#[test]
	fn test_capacity_evicts_least_recent() {
		let cache = cache();
		let generation = cache.generation();
		for name in ["a", "b", "c"] {
			cache.insert(
				name.into(),
				DataSource::new(name, DataType::Float),
				generation,
			);
		}
		assert_eq!(cache.len(), 2);
		assert!(cache.get("a").is_none());
	}
}
