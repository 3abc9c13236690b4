//! [`Broker`] implementation over rumqttc

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rumqttc::Packet::{self, Disconnect, Publish};
use rumqttc::{
	AsyncClient, ConnAck, ConnectReturnCode, EventLoop, MqttOptions, QoS,
	SubAck, SubscribeReasonCode,
};
use rumqttc::{Event::Incoming, Event::Outgoing};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
	Broker, BrokerError, BrokerSession, InboundMessage, SessionEvent,
	SessionEvents,
};
use crate::catalog::BrokerConfig;

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Connection behaviour of [`RumqttBroker`]
#[derive(Debug, Clone)]
pub struct RumqttSettings {
	/// Client ids are `<prefix>-<uuid>`
	pub client_id_prefix: String,
	/// MQTT keep-alive interval
	pub keep_alive: Duration,
	/// Start every connection with a clean session
	pub clean_session: bool,
	/// Maximum wait for the initial CONNACK
	pub connection_timeout: Duration,
	/// Maximum wait for SUBACK / UNSUBACK
	pub operation_timeout: Duration,
	/// Capacity of the rumqttc request channel
	pub request_channel_capacity: usize,
	/// Capacity of the session event channel
	pub event_channel_capacity: usize,
	/// Upper bound of the reconnect backoff
	pub max_reconnect_delay: Duration,
}

impl Default for RumqttSettings {
	fn default() -> Self {
		Self {
			client_id_prefix: "hds".to_string(),
			keep_alive: Duration::from_secs(30),
			clean_session: true,
			connection_timeout: Duration::from_secs(10),
			operation_timeout: Duration::from_secs(10),
			request_channel_capacity: 10,
			event_channel_capacity: 100,
			max_reconnect_delay: Duration::from_secs(30),
		}
	}
}

/// Broker factory creating one rumqttc client per connection
#[derive(Debug, Clone, Default)]
pub struct RumqttBroker {
	settings: RumqttSettings,
}

impl RumqttBroker {
	/// Broker factory with custom settings
	pub fn new(settings: RumqttSettings) -> Self {
		Self { settings }
	}

	/// Current settings
	pub fn settings(&self) -> &RumqttSettings {
		&self.settings
	}

	fn options(&self, config: &BrokerConfig) -> Result<MqttOptions, BrokerError> {
		let client_id =
			format!("{}-{}", self.settings.client_id_prefix, Uuid::new_v4());
		let mut options =
			MqttOptions::parse_url(with_client_id(&config.url, &client_id))
				.map_err(|source| BrokerError::InvalidUrl {
					url: config.url.clone(),
					source,
				})?;
		options.set_keep_alive(self.settings.keep_alive);
		options.set_clean_session(self.settings.clean_session);
		if let Some(credentials) = &config.credentials {
			if !credentials.username.is_empty() {
				options.set_credentials(
					credentials.username.clone(),
					credentials.password.clone(),
				);
			}
		}
		Ok(options)
	}
}

impl Broker for RumqttBroker {
	type Session = RumqttSession;

	async fn connect(
		&self,
		config: &BrokerConfig,
	) -> Result<(RumqttSession, SessionEvents), BrokerError> {
		let options = self.options(config)?;
		let (client, event_loop) =
			AsyncClient::new(options, self.settings.request_channel_capacity);

		let timeout_millis = millis(self.settings.connection_timeout);
		let event_loop = time::timeout(
			self.settings.connection_timeout,
			establish_connection(&config.url, event_loop),
		)
		.await
		.map_err(|_| BrokerError::Timeout {
			url: config.url.clone(),
			operation: "connect",
			timeout_millis,
		})??;
		info!(url = %config.url, "MQTT connection established");

		let (events_tx, events_rx) =
			mpsc::channel(self.settings.event_channel_capacity.max(1));
		let acks = Arc::new(Mutex::new(AckTracker::default()));
		let event_loop_handle = tokio::spawn(run(
			config.url.clone(),
			event_loop,
			events_tx,
			Arc::clone(&acks),
			self.settings.max_reconnect_delay,
		));
		let session = RumqttSession {
			url: config.url.clone(),
			client,
			acks,
			operation_timeout: self.settings.operation_timeout,
			event_loop_handle: Mutex::new(Some(event_loop_handle)),
		};
		Ok((session, events_rx))
	}
}

/// Live rumqttc connection
#[derive(Debug)]
pub struct RumqttSession {
	url: String,
	client: AsyncClient,
	acks: Arc<Mutex<AckTracker>>,
	operation_timeout: Duration,
	event_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttSession {
	async fn wait_for_ack(
		&self,
		operation: &'static str,
		ack: oneshot::Receiver<AckOutcome>,
	) -> Result<AckOutcome, BrokerError> {
		match time::timeout(self.operation_timeout, ack).await {
			| Ok(Ok(outcome)) => Ok(outcome),
			| Ok(Err(_)) => Err(BrokerError::SessionClosed {
				url: self.url.clone(),
			}),
			| Err(_) => Err(BrokerError::Timeout {
				url: self.url.clone(),
				operation,
				timeout_millis: millis(self.operation_timeout),
			}),
		}
	}

	fn closed(&self) -> BrokerError {
		BrokerError::SessionClosed {
			url: self.url.clone(),
		}
	}
}

impl BrokerSession for RumqttSession {
	async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
		let ack = {
			let mut acks = lock(&self.acks);
			if acks.closed {
				return Err(self.closed());
			}
			// Queue and request under one lock so the event loop assigns
			// packet ids in request order.
			self.client.try_subscribe(topic, qos)?;
			acks.subscribe.enqueue()
		};
		self.wait_for_ack("subscribe", ack)
			.await?
			.map_err(|reason| BrokerError::subscribe(topic, reason))?;
		debug!(url = %self.url, topic = %topic, "Subscription acknowledged");
		Ok(())
	}

	async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
		let ack = {
			let mut acks = lock(&self.acks);
			if acks.closed {
				return Err(self.closed());
			}
			self.client.try_unsubscribe(topic)?;
			acks.unsubscribe.enqueue()
		};
		self.wait_for_ack("unsubscribe", ack)
			.await?
			.map_err(|reason| BrokerError::unsubscribe(topic, reason))?;
		debug!(url = %self.url, topic = %topic, "Unsubscription acknowledged");
		Ok(())
	}

	async fn disconnect(&self, grace: Duration) -> Result<(), BrokerError> {
		let Some(mut handle) = lock(&self.event_loop_handle).take() else {
			return Ok(());
		};
		// Sending Disconnect makes the event loop terminate on its own
		let requested = self.client.try_disconnect();
		if let Err(err) = &requested {
			warn!(url = %self.url, error = %err, "Failed to request MQTT disconnect");
		}
		if time::timeout(grace, &mut handle).await.is_err() {
			warn!(
				url = %self.url,
				grace_ms = millis(grace),
				"Event loop still running after grace period, aborting"
			);
			handle.abort();
		}
		requested.map_err(BrokerError::from)
	}
}

impl Drop for RumqttSession {
	fn drop(&mut self) {
		if let Some(handle) = lock(&self.event_loop_handle).take() {
			debug!(url = %self.url, "Session dropped without disconnect, aborting event loop");
			handle.abort();
		}
	}
}

async fn establish_connection(
	url: &str,
	mut event_loop: EventLoop,
) -> Result<EventLoop, BrokerError> {
	loop {
		match event_loop.poll().await {
			| Ok(Incoming(Packet::ConnAck(ConnAck { code, .. }))) => {
				if code == ConnectReturnCode::Success {
					return Ok(event_loop);
				}
				debug!(url = %url, code = ?code, "MQTT connection rejected by broker");
				return Err(BrokerError::Rejected {
					url: url.to_string(),
					code,
				});
			}
			| Ok(notification) => {
				debug!(notification = ?notification, "Bootstrap phase notification");
			}
			| Err(connection_err) => {
				debug!(url = %url, error = %connection_err, "MQTT connection error during bootstrap phase");
				return Err(BrokerError::connect(url, connection_err));
			}
		}
	}
}

/// Drives the rumqttc event loop until the session is disconnected.
///
/// Transport errors and server DISCONNECTs are retried forever with capped
/// exponential backoff; rumqttc reconnects on the next poll. Only our own
/// DISCONNECT ends the loop.
async fn run(
	url: String,
	mut event_loop: EventLoop,
	events: mpsc::Sender<SessionEvent>,
	acks: Arc<Mutex<AckTracker>>,
	max_delay: Duration,
) {
	let mut error_count: u32 = 0;
	loop {
		match event_loop.poll().await {
			| Ok(Incoming(Packet::ConnAck(ConnAck {
				session_present,
				code: ConnectReturnCode::Success,
			}))) => {
				error_count = 0;
				info!(url = %url, session_present, "MQTT reconnected");
				forward(&events, SessionEvent::Connected { session_present })
					.await;
			}
			| Ok(Incoming(Publish(p))) => {
				error_count = 0;
				debug!(url = %url, topic = %p.topic, payload_size = p.payload.len(), "Received MQTT message");
				let message = InboundMessage {
					topic: p.topic,
					payload: p.payload,
					qos: p.qos,
				};
				forward(&events, SessionEvent::Message(message)).await;
			}
			| Ok(Incoming(Packet::SubAck(ack))) => {
				lock(&acks).subscribe.complete(ack.pkid, suback_outcome(&ack));
			}
			| Ok(Incoming(Packet::UnsubAck(ack))) => {
				lock(&acks).unsubscribe.complete(ack.pkid, Ok(()));
			}
			| Ok(Outgoing(rumqttc::Outgoing::Subscribe(pkid))) => {
				lock(&acks).subscribe.assign(pkid);
			}
			| Ok(Outgoing(rumqttc::Outgoing::Unsubscribe(pkid))) => {
				lock(&acks).unsubscribe.assign(pkid);
			}
			| Ok(Incoming(Disconnect)) => {
				// Server-initiated: the next poll reconnects like after any
				// transport loss
				warn!(url = %url, "Received MQTT Disconnect packet from server");
				lock(&acks).fail_in_flight("server sent DISCONNECT");
				forward(
					&events,
					SessionEvent::ConnectionLost("server sent DISCONNECT".into()),
				)
				.await;
				error_count = 1;
			}
			| Ok(Outgoing(rumqttc::Outgoing::Disconnect)) => {
				info!(url = %url, "Sent MQTT Disconnect packet to server");
				break;
			}
			| Ok(notification) => {
				error_count = 0;
				debug!(url = %url, notification = ?notification, "Received other MQTT notification");
			}
			| Err(err) => {
				error_count = error_count.saturating_add(1);
				error!(url = %url, error_count, error = %err, "MQTT event loop error");
				if error_count == 1 {
					lock(&acks).fail_in_flight(&err.to_string());
					forward(&events, SessionEvent::ConnectionLost(err.to_string()))
						.await;
				}
				let delay = INITIAL_RETRY_DELAY
					.saturating_mul(2_u32.pow((error_count - 1).min(10)))
					.min(max_delay);
				warn!(url = %url, delay = ?delay, error_count, "Retrying MQTT connection");
				time::sleep(delay).await;
			}
		}
	}
	lock(&acks).close();
	info!(url = %url, "MQTT event loop terminated");
}

async fn forward(events: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
	if events.send(event).await.is_err() {
		debug!("Session event receiver dropped, event discarded");
	}
}

fn suback_outcome(ack: &SubAck) -> AckOutcome {
	if ack
		.return_codes
		.iter()
		.any(|code| matches!(code, SubscribeReasonCode::Failure))
	{
		Err("broker refused subscription".to_string())
	} else {
		Ok(())
	}
}

/// Append `client_id` to the URL query, as rumqttc requires it there
fn with_client_id(url: &str, client_id: &str) -> String {
	if url.contains('?') {
		format!("{url}&client_id={client_id}")
	} else {
		format!("{url}?client_id={client_id}")
	}
}

fn millis(duration: Duration) -> u64 {
	u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type AckOutcome = Result<(), String>;

/// Waiters for one acknowledgment kind.
///
/// Requests leave the client in order, so the n-th queued waiter belongs to
/// the n-th outgoing packet; the packet id is learnt from the outgoing event.
#[derive(Debug, Default)]
struct AckQueue {
	queued: VecDeque<oneshot::Sender<AckOutcome>>,
	in_flight: HashMap<u16, oneshot::Sender<AckOutcome>>,
}

impl AckQueue {
	fn enqueue(&mut self) -> oneshot::Receiver<AckOutcome> {
		let (tx, rx) = oneshot::channel();
		self.queued.push_back(tx);
		rx
	}

	fn assign(&mut self, pkid: u16) {
		if let Some(waiter) = self.queued.pop_front() {
			self.in_flight.insert(pkid, waiter);
		}
	}

	fn complete(&mut self, pkid: u16, outcome: AckOutcome) {
		if let Some(waiter) = self.in_flight.remove(&pkid) {
			let _ = waiter.send(outcome);
		}
	}

	fn fail_in_flight(&mut self, reason: &str) {
		for (_, waiter) in self.in_flight.drain() {
			let _ = waiter.send(Err(format!("connection lost: {reason}")));
		}
	}
}

#[derive(Debug, Default)]
struct AckTracker {
	subscribe: AckQueue,
	unsubscribe: AckQueue,
	closed: bool,
}

impl AckTracker {
	fn fail_in_flight(&mut self, reason: &str) {
		self.subscribe.fail_in_flight(reason);
		self.unsubscribe.fail_in_flight(reason);
	}

	/// Drops every waiter; their receivers observe a closed session
	fn close(&mut self) {
		*self = Self {
			closed: true,
			..Self::default()
		};
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::{TcpListener, TcpStream};

	use super::*;

	#[test]
	fn test_client_id_is_appended_to_query() {
		assert_eq!(
			with_client_id("tcp://localhost:1883", "hds-1"),
			"tcp://localhost:1883?client_id=hds-1"
		);
		assert_eq!(
			with_client_id("mqtt://b:1883?keep_alive_secs=5", "hds-1"),
			"mqtt://b:1883?keep_alive_secs=5&client_id=hds-1"
		);
	}

	#[test]
	fn test_options_from_config() {
		let broker = RumqttBroker::default();
		let config = BrokerConfig::new("tcp://localhost:1883", "a/#", 1)
			.with_credentials("user", "secret");
		let options = broker.options(&config).unwrap();
		assert!(options.client_id().starts_with("hds-"));
		assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
		assert_eq!(options.keep_alive(), Duration::from_secs(30));
		assert_eq!(
			options.credentials(),
			Some(("user".to_string(), "secret".to_string()))
		);
	}

	#[test]
	fn test_invalid_url_is_reported() {
		let broker = RumqttBroker::default();
		let config = BrokerConfig::new("not a url", "a", 0);
		assert!(matches!(
			broker.options(&config),
			Err(BrokerError::InvalidUrl { .. })
		));
	}

	#[tokio::test]
	async fn test_ack_queue_matches_packet_ids_in_order() {
		let mut queue = AckQueue::default();
		let first = queue.enqueue();
		let second = queue.enqueue();
		queue.assign(7);
		queue.assign(8);
		queue.complete(8, Err("refused".into()));
		queue.complete(7, Ok(()));
		assert_eq!(first.await.unwrap(), Ok(()));
		assert_eq!(second.await.unwrap(), Err("refused".to_string()));
	}

	#[tokio::test]
	async fn test_connection_loss_fails_in_flight_waiters() {
		let mut tracker = AckTracker::default();
		let waiting = tracker.subscribe.enqueue();
		let queued = tracker.unsubscribe.enqueue();
		tracker.subscribe.assign(1);
		tracker.fail_in_flight("reset by peer");
		assert!(waiting.await.unwrap().unwrap_err().contains("reset by peer"));

		tracker.close();
		assert!(tracker.closed);
		assert!(queued.await.is_err());
	}

	const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
	const SERVER_DISCONNECT: [u8; 2] = [0xE0, 0x00];

	async fn accept_and_ack(listener: &TcpListener) -> TcpStream {
		let (mut stream, _) = listener.accept().await.unwrap();
		let mut connect = [0_u8; 256];
		let read = stream.read(&mut connect).await.unwrap();
		assert!(read > 0 && connect[0] == 0x10, "expected CONNECT");
		stream.write_all(&CONNACK).await.unwrap();
		stream
	}

	#[tokio::test]
	async fn test_server_disconnect_triggers_reconnect() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let port = listener.local_addr().unwrap().port();
		let server = tokio::spawn(async move {
			let mut first = accept_and_ack(&listener).await;
			time::sleep(Duration::from_millis(50)).await;
			first.write_all(&SERVER_DISCONNECT).await.unwrap();
			drop(first);
			let second = accept_and_ack(&listener).await;
			time::sleep(Duration::from_secs(10)).await;
			drop(second);
		});

		let broker = RumqttBroker::new(RumqttSettings {
			connection_timeout: Duration::from_secs(2),
			..RumqttSettings::default()
		});
		let config =
			BrokerConfig::new(format!("mqtt://127.0.0.1:{port}"), "a/#", 0);
		let (session, mut events) = broker.connect(&config).await.unwrap();

		let lost = time::timeout(Duration::from_secs(5), events.recv())
			.await
			.unwrap();
		assert!(matches!(lost, Some(SessionEvent::ConnectionLost(_))));
		let reconnected = time::timeout(Duration::from_secs(5), events.recv())
			.await
			.unwrap();
		assert!(matches!(
			reconnected,
			Some(SessionEvent::Connected {
				session_present: false
			})
		));
		// The session survived and still accepts requests
		assert!(!lock(&session.acks).closed);

		session.disconnect(Duration::from_secs(1)).await.unwrap();
		server.abort();
	}
}
