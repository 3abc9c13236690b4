//! Broker transport contract
//!
//! The connector talks to brokers only through [`Broker`] and
//! [`BrokerSession`]. [`RumqttBroker`] is the production implementation.

pub mod error;
pub mod rumqtt;

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use rumqttc::QoS;
use tokio::sync::mpsc;

pub use error::BrokerError;
pub use rumqtt::{RumqttBroker, RumqttSession, RumqttSettings};

use crate::catalog::BrokerConfig;

/// A message published on a subscribed topic
#[derive(Debug, Clone)]
pub struct InboundMessage {
	/// Concrete topic the message was published on
	pub topic: String,
	/// Raw payload
	pub payload: Bytes,
	/// Delivery QoS
	pub qos: QoS,
}

/// Events delivered by a live session
#[derive(Debug, Clone)]
pub enum SessionEvent {
	/// The session (re)connected after a transport loss
	Connected {
		/// Broker kept the previous session state
		session_present: bool,
	},
	/// The transport failed; the session keeps reconnecting
	ConnectionLost(String),
	/// An inbound publish
	Message(InboundMessage),
}

/// Receive side of a session's event stream
pub type SessionEvents = mpsc::Receiver<SessionEvent>;

/// Factory for broker sessions
pub trait Broker: Send + Sync + 'static {
	/// Session handle type
	type Session: BrokerSession;

	/// Connect to `config.url` with `config.credentials`.
	///
	/// Resolves once the broker accepted the connection. The returned event
	/// stream ends after the session is disconnected.
	fn connect(
		&self,
		config: &BrokerConfig,
	) -> impl Future<Output = Result<(Self::Session, SessionEvents), BrokerError>>
	+ Send;
}

/// A connected broker session
pub trait BrokerSession: Send + Sync + 'static {
	/// Subscribe and wait for the broker's acknowledgment
	fn subscribe(
		&self,
		topic: &str,
		qos: QoS,
	) -> impl Future<Output = Result<(), BrokerError>> + Send;

	/// Unsubscribe and wait for the broker's acknowledgment
	fn unsubscribe(
		&self,
		topic: &str,
	) -> impl Future<Output = Result<(), BrokerError>> + Send;

	/// Disconnect, giving in-flight work at most `grace` to finish
	fn disconnect(
		&self,
		grace: Duration,
	) -> impl Future<Output = Result<(), BrokerError>> + Send;
}
