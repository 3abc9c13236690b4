use rumqttc::{ClientError, ConnectReturnCode, OptionError};
use thiserror::Error;

/// Errors talking to a broker
#[derive(Debug, Error)]
pub enum BrokerError {
	/// The broker URL could not be turned into connection options
	#[error("Invalid broker url '{url}': {source}")]
	InvalidUrl {
		/// Broker url
		url: String,
		/// Parse failure
		#[source]
		source: OptionError,
	},

	/// Network connection failed
	#[error("Error connecting to broker {url}: {reason}")]
	Connect {
		/// Broker url
		url: String,
		/// Failure description
		reason: String,
	},

	/// Broker refused the connection
	#[error("Broker {url} rejected connection: {code:?}")]
	Rejected {
		/// Broker url
		url: String,
		/// CONNACK return code
		code: ConnectReturnCode,
	},

	/// No acknowledgment within the configured time
	#[error("{operation} on {url} timed out after {timeout_millis}ms")]
	Timeout {
		/// Broker url
		url: String,
		/// Operation that timed out
		operation: &'static str,
		/// Configured timeout
		timeout_millis: u64,
	},

	/// Broker refused or failed a subscription
	#[error("Error subscribing to {topic}: {reason}")]
	Subscribe {
		/// Topic filter
		topic: String,
		/// Failure description
		reason: String,
	},

	/// Broker failed an unsubscription
	#[error("Error unsubscribing from {topic}: {reason}")]
	Unsubscribe {
		/// Topic filter
		topic: String,
		/// Failure description
		reason: String,
	},

	/// The request could not be queued on the client
	#[error("Client operation failed: {0}")]
	Client(#[from] ClientError),

	/// The session ended before the operation completed
	#[error("Broker session {url} closed")]
	SessionClosed {
		/// Broker url
		url: String,
	},
}

impl BrokerError {
	/// Connection failure with a textual reason
	pub fn connect(url: impl Into<String>, reason: impl ToString) -> Self {
		Self::Connect {
			url: url.into(),
			reason: reason.to_string(),
		}
	}

	/// Subscription failure with a textual reason
	pub fn subscribe(topic: impl Into<String>, reason: impl ToString) -> Self {
		Self::Subscribe {
			topic: topic.into(),
			reason: reason.to_string(),
		}
	}

	/// Unsubscription failure with a textual reason
	pub fn unsubscribe(
		topic: impl Into<String>,
		reason: impl ToString,
	) -> Self {
		Self::Unsubscribe {
			topic: topic.into(),
			reason: reason.to_string(),
		}
	}
}
