use thiserror::Error;

use crate::broker::BrokerError;
use crate::catalog::CatalogError;
use crate::payload::PayloadError;
use crate::storage::StorageError;
use crate::topic::TopicFilterError;

/// Errors of connector operations
#[derive(Debug, Error)]
pub enum ConnectorError {
	/// Broker communication failed (connect, subscribe, unsubscribe)
	#[error("Broker error: {0}")]
	Broker(#[from] BrokerError),

	/// The catalog could not be read
	#[error("Catalog error: {0}")]
	Catalog(#[from] CatalogError),

	/// The broker config requests an unsupported QoS
	#[error("Unsupported QoS {qos} for topic {topic} on {url}")]
	InvalidQos {
		/// Broker url
		url: String,
		/// Topic filter
		topic: String,
		/// Requested QoS level
		qos: u8,
	},

	/// The broker config carries a malformed topic filter
	#[error("Invalid topic filter: {0}")]
	InvalidTopic(#[from] TopicFilterError),

	/// Invalid settings value
	#[error("Invalid configuration value: {0}")]
	ConfigurationValue(String),
}

/// Errors that make a whole inbound message unusable
#[derive(Debug, Error)]
pub enum MessageError {
	/// Payload could not be decoded
	#[error(transparent)]
	Payload(#[from] PayloadError),

	/// The storage sink rejected the batch
	#[error("Error writing data to the database: {0}")]
	Storage(#[from] StorageError),
}
