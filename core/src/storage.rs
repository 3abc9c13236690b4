//! Storage sink contract

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

use crate::catalog::DataSource;
use crate::payload::Entry;

/// Errors reported by a storage sink
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
	/// The storage backend rejected or failed the write
	#[error("Storage backend error: {0}")]
	Backend(String),
}

/// A typed point accepted for storage
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataPoint {
	/// Resource name
	pub name: String,
	/// Seconds since the epoch
	pub time: f64,
	/// Unit, if any
	pub unit: Option<String>,
	/// Numeric value
	pub value: Option<f64>,
	/// String value
	pub string_value: Option<String>,
	/// Boolean value
	pub bool_value: Option<bool>,
	/// Integrated sum
	pub sum: Option<f64>,
}

impl From<Entry> for DataPoint {
	fn from(entry: Entry) -> Self {
		Self {
			name: entry.name,
			time: entry.time,
			unit: entry.unit,
			value: entry.value,
			string_value: entry.string_value,
			bool_value: entry.bool_value,
			sum: entry.sum,
		}
	}
}

/// Points grouped by data source id
pub type Batch = HashMap<String, Vec<DataPoint>>;

/// Data sources referenced by a [`Batch`], keyed by id
pub type BatchSources = HashMap<String, DataSource>;

/// Destination of validated points
///
/// Called concurrently from every subscription's message handler.
pub trait StorageSink: Send + Sync + 'static {
	/// Store one batch
	fn submit(
		&self,
		data: Batch,
		sources: BatchSources,
	) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// Sink that keeps every submitted point in memory
#[derive(Debug, Default)]
pub struct MemorySink {
	points: Mutex<Batch>,
	submissions: Mutex<usize>,
}

impl MemorySink {
	/// Empty sink
	pub fn new() -> Self {
		Self::default()
	}

	/// Points stored for data source `id`
	pub fn points(&self, id: &str) -> Vec<DataPoint> {
		self.points
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.get(id)
			.cloned()
			.unwrap_or_default()
	}

	/// Total number of stored points
	pub fn total_points(&self) -> usize {
		self.points
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.values()
			.map(Vec::len)
			.sum()
	}

	/// Number of `submit` calls received
	pub fn submissions(&self) -> usize {
		*self.submissions.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

impl StorageSink for MemorySink {
	async fn submit(
		&self,
		data: Batch,
		_sources: BatchSources,
	) -> Result<(), StorageError> {
		*self.submissions.lock().unwrap_or_else(PoisonError::into_inner) += 1;
		let mut points =
			self.points.lock().unwrap_or_else(PoisonError::into_inner);
		for (id, batch) in data {
			debug!(id = %id, points = batch.len(), "Storing points");
			points.entry(id).or_default().extend(batch);
		}
		Ok(())
	}
}
