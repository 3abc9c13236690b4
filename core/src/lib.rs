//! # MQTT Ingest
//!
//! Bridges MQTT brokers into a measurement store, driven by a catalog of
//! data sources.
//!
//! ## Features
//!
//! - **Catalog-driven subscriptions**: broker connections and topic
//!   subscriptions follow the data sources of a catalog
//! - **Shared subscriptions**: data sources with the same broker config share
//!   one connection and one broker-level SUBSCRIBE
//! - **Acknowledged notifications**: every catalog change is applied before
//!   the catalog owner continues
//! - **Automatic recovery**: failed registrations are retried on a fixed
//!   interval, reconnected sessions are resubscribed
//! - **Validated ingestion**: SenML entries are checked against the catalog
//!   before they reach storage
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use mqtt_ingest_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let catalog = Arc::new(MemoryCatalog::new());
//!     let storage = Arc::new(MemorySink::new());
//!
//!     let (connector, notifications) =
//!         IngestionConnector::start(catalog.clone(), storage, RumqttBroker::default())
//!             .await?;
//!     catalog.register_observer(notifications).await;
//!
//!     let temperature = DataSource::new("kitchen/temperature", DataType::Float)
//!         .with_broker(BrokerConfig::new("mqtt://localhost:1883", "home/#", 1));
//!     catalog.add(temperature).await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     connector.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Topic Filters
//!
//! Subscriptions accept MQTT wildcard filters:
//!
//! - `+` matches a single topic level (e.g., `sensors/+/temperature`)
//! - `#` matches any number of trailing levels (e.g., `sensors/#`)

#![warn(missing_docs)]

pub mod broker;
pub mod catalog;
pub mod connector;
pub mod notification;
pub mod payload;
pub mod storage;
pub mod topic;

#[cfg(test)]
mod testing;

// === Core Public API ===
pub use broker::{Broker, BrokerError, BrokerSession, RumqttBroker, RumqttSettings};
pub use catalog::{
	BrokerConfig, CatalogClient, CatalogError, Credentials, DataSource,
	DataType, MemoryCatalog,
};
pub use connector::{
	ConnectorBuilder, ConnectorError, ConnectorSettings, ConnectorSnapshot,
	IngestionConnector,
};
pub use notification::{Notification, NotificationError, NotificationSender};
pub use storage::{DataPoint, MemorySink, StorageError, StorageSink};
// Essential external types
pub use rumqttc::QoS;

/// Result type alias for connector operations
pub type Result<T> = std::result::Result<T, ConnectorError>;

/// Prelude module for convenient imports
///
/// ```rust
/// use mqtt_ingest_core::prelude::*;
/// ```
pub mod prelude {
	pub use crate::{
		BrokerConfig, CatalogClient, ConnectorError, ConnectorSettings,
		DataSource, DataType, IngestionConnector, MemoryCatalog, MemorySink,
		NotificationSender, QoS, Result, RumqttBroker, StorageSink,
	};
}

/// Types for custom brokers, parsers and diagnostics
///
/// ```rust
/// use mqtt_ingest_core::advanced::*;
/// ```
pub mod advanced {
	pub use crate::broker::{InboundMessage, SessionEvent, SessionEvents};
	pub use crate::connector::{
		DropReason, DroppedEntry, MessageHandler, MessageOutcome,
		ResolutionCache, SubscriptionKey,
	};
	pub use crate::notification::{AckResult, NotificationEnvelope, Notifier};
	pub use crate::payload::{Entry, PayloadParser, SenmlJsonParser};
	pub use crate::storage::{Batch, BatchSources};
	pub use crate::topic::{filter_matches, validate_filter};
}

/// Error types used throughout the library
///
/// ```rust
/// use mqtt_ingest_core::errors::*;
/// ```
pub mod errors {
	pub use crate::connector::MessageError;
	pub use crate::payload::PayloadError;
	pub use crate::topic::TopicFilterError;
	pub use crate::{
		BrokerError, CatalogError, ConnectorError, NotificationError,
		StorageError,
	};
}
