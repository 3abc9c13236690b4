//! Validation and routing of inbound broker messages

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::cache::ResolutionCache;
use super::error::MessageError;
use super::manager::SubscriptionKey;
use crate::broker::InboundMessage;
use crate::catalog::{CatalogClient, DataSource, DataType};
use crate::payload::{Entry, PayloadParser};
use crate::storage::{Batch, BatchSources, DataPoint, StorageSink};

/// Why a single entry of a message was not stored
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DropReason {
	/// Entry carries no resource name
	#[error("Resource name not specified")]
	MissingName,

	/// No data source is registered for the name
	#[error("Resource not found")]
	NotFound,

	/// The catalog lookup itself failed
	#[error("Error finding resource: {0}")]
	LookupFailed(String),

	/// The data source has no broker subscription
	#[error("Ignoring unwanted message for resource")]
	UnwantedSource,

	/// The data source expects another broker
	#[error("Ignoring message from unwanted broker {0}")]
	WrongBroker(String),

	/// The data source expects another topic
	#[error("Ignoring message with unwanted topic {0}")]
	WrongTopic(String),

	/// The carried value kind does not fit the declared type
	#[error("Entry type is incompatible with source type {expected}")]
	TypeMismatch {
		/// Declared type of the data source
		expected: DataType,
	},
}

/// A dropped entry and the reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedEntry {
	/// Resource name as it appeared in the message
	pub name: String,
	/// Why it was dropped
	pub reason: DropReason,
}

/// Result of processing one inbound message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageOutcome {
	/// Number of points handed to the storage sink
	pub accepted: usize,
	/// Number of distinct data sources in the submitted batch
	pub sources: usize,
	/// Entries that were dropped
	pub dropped: Vec<DroppedEntry>,
}

/// Validates inbound messages against the catalog and forwards them to
/// the storage sink
pub struct MessageHandler<C, S> {
	catalog: Arc<C>,
	storage: Arc<S>,
	cache: Arc<ResolutionCache>,
	parser: Arc<dyn PayloadParser>,
}

impl<C, S> Clone for MessageHandler<C, S> {
	fn clone(&self) -> Self {
		Self {
			catalog: Arc::clone(&self.catalog),
			storage: Arc::clone(&self.storage),
			cache: Arc::clone(&self.cache),
			parser: Arc::clone(&self.parser),
		}
	}
}

impl<C, S> MessageHandler<C, S>
where
	C: CatalogClient,
	S: StorageSink,
{
	/// Create a handler sharing `cache` with its connector
	pub fn new(
		catalog: Arc<C>,
		storage: Arc<S>,
		cache: Arc<ResolutionCache>,
		parser: Arc<dyn PayloadParser>,
	) -> Self {
		Self {
			catalog,
			storage,
			cache,
			parser,
		}
	}

	/// The resolution cache used by this handler
	pub fn cache(&self) -> &ResolutionCache {
		&self.cache
	}

	/// Process one payload received through `subscription`.
	///
	/// Invalid entries are dropped individually; the remaining ones are
	/// submitted to storage in a single call.
	pub async fn handle(
		&self,
		subscription: &SubscriptionKey,
		payload: &[u8],
	) -> Result<MessageOutcome, MessageError> {
		let entries = self.parser.parse(payload)?;

		let mut outcome = MessageOutcome::default();
		let mut data = Batch::new();
		let mut sources = BatchSources::new();
		for entry in entries {
			let ds = match self.validate(subscription, &entry).await {
				| Ok(ds) => ds,
				| Err(reason) => {
					outcome.dropped.push(DroppedEntry {
						name: entry.name,
						reason,
					});
					continue;
				}
			};
			data.entry(ds.id.clone())
				.or_default()
				.push(DataPoint::from(entry));
			sources.entry(ds.id.clone()).or_insert(ds);
		}

		if data.is_empty() {
			return Ok(outcome);
		}
		outcome.accepted = data.values().map(Vec::len).sum();
		outcome.sources = data.len();
		self.storage.submit(data, sources).await?;
		Ok(outcome)
	}

	/// Run [`handle`](Self::handle) and log the outcome
	pub(crate) async fn dispatch(
		&self,
		subscription: &SubscriptionKey,
		message: &InboundMessage,
	) {
		let started = Instant::now();
		let header = format!("\"SUB {} MQTT/QOS{}\"", message.topic, message.qos as u8);
		match self.handle(subscription, &message.payload).await {
			| Ok(outcome) => {
				for dropped in &outcome.dropped {
					warn!(
						request = %header,
						entry = %dropped.name,
						reason = %dropped.reason,
						subscription = %subscription,
						"Dropping entry"
					);
				}
				if outcome.accepted > 0 {
					info!(
						request = %header,
						points = outcome.accepted,
						sources = outcome.sources,
						elapsed = ?started.elapsed(),
						"Accepted"
					);
				} else {
					debug!(request = %header, "Nothing to store");
				}
			}
			| Err(MessageError::Payload(err)) => {
				warn!(
					request = %header,
					error = %err,
					payload = %String::from_utf8_lossy(&message.payload),
					"Dropping malformed message"
				);
			}
			| Err(err @ MessageError::Storage(_)) => {
				error!(
					request = %header,
					error = %err,
					elapsed = ?started.elapsed(),
					"Batch lost"
				);
			}
		}
	}

	async fn validate(
		&self,
		subscription: &SubscriptionKey,
		entry: &Entry,
	) -> Result<DataSource, DropReason> {
		if entry.name.is_empty() {
			return Err(DropReason::MissingName);
		}
		let ds = self.resolve(&entry.name).await?;
		let Some(broker) = &ds.broker else {
			return Err(DropReason::UnwantedSource);
		};
		if broker.url != subscription.url.as_str() {
			return Err(DropReason::WrongBroker(subscription.url.to_string()));
		}
		if broker.topic != subscription.topic.as_str() {
			return Err(DropReason::WrongTopic(subscription.topic.to_string()));
		}
		if !value_matches(ds.data_type, entry) {
			return Err(DropReason::TypeMismatch {
				expected: ds.data_type,
			});
		}
		Ok(ds)
	}

	async fn resolve(&self, name: &str) -> Result<DataSource, DropReason> {
		if let Some(ds) = self.cache.get(name) {
			return Ok(ds);
		}
		let generation = self.cache.generation();
		match self.catalog.lookup(name).await {
			| Ok(Some(ds)) => {
				self.cache.insert(name.to_string(), ds.clone(), generation);
				Ok(ds)
			}
			| Ok(None) => Err(DropReason::NotFound),
			| Err(err) if err.is_not_found() => Err(DropReason::NotFound),
			| Err(err) => Err(DropReason::LookupFailed(err.to_string())),
		}
	}
}

/// Check the carried value kind against the declared type.
///
/// Empty string values are tolerated for non-string sources.
fn value_matches(data_type: DataType, entry: &Entry) -> bool {
	match data_type {
		| DataType::Float => entry.bool_value.is_none() && !entry.has_string(),
		| DataType::String => entry.value.is_none() && entry.bool_value.is_none(),
		| DataType::Bool => entry.value.is_none() && !entry.has_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_value_kind_rules() {
		assert!(value_matches(DataType::Float, &Entry::float("a", 1.0)));
		assert!(!value_matches(DataType::Float, &Entry::boolean("a", true)));
		assert!(!value_matches(DataType::Float, &Entry::string("a", "x")));
		assert!(value_matches(DataType::Float, &Entry::string("a", "")));

		assert!(value_matches(DataType::String, &Entry::string("a", "x")));
		assert!(!value_matches(DataType::String, &Entry::float("a", 1.0)));
		assert!(!value_matches(DataType::String, &Entry::boolean("a", false)));

		assert!(value_matches(DataType::Bool, &Entry::boolean("a", true)));
		assert!(!value_matches(DataType::Bool, &Entry::float("a", 0.0)));
		assert!(!value_matches(DataType::Bool, &Entry::string("a", "on")));
	}
}
