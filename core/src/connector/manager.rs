//! Per-broker connection state
//!
//! One [`ConnectionManager`] exists per broker url. It owns the broker
//! session, the table of topic [`Subscription`]s and the router task that
//! delivers the session's events.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use arcstr::ArcStr;
use rumqttc::QoS;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use super::handler::MessageHandler;
use crate::broker::{BrokerError, BrokerSession, SessionEvent, SessionEvents};
use crate::catalog::CatalogClient;
use crate::storage::StorageSink;
use crate::topic::filter_matches;

/// Identity of a broker-level subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
	/// Broker url
	pub url: ArcStr,
	/// Topic filter
	pub topic: ArcStr,
}

impl SubscriptionKey {
	/// Key for `topic` on `url`
	pub fn new(url: impl Into<ArcStr>, topic: impl Into<ArcStr>) -> Self {
		Self {
			url: url.into(),
			topic: topic.into(),
		}
	}
}

impl Display for SubscriptionKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{} {}", self.url, self.topic)
	}
}

/// One broker-level SUBSCRIBE shared by `receivers` data sources
#[derive(Debug, Clone)]
pub(crate) struct Subscription {
	key: SubscriptionKey,
	qos: QoS,
	receivers: usize,
}

impl Subscription {
	pub(crate) fn new(key: SubscriptionKey, qos: QoS) -> Self {
		Self {
			key,
			qos,
			receivers: 1,
		}
	}
}

type SubscriptionTable = Arc<RwLock<HashMap<ArcStr, Subscription>>>;

/// Serializes SUBSCRIBE and UNSUBSCRIBE round-trips on one session
type OpsLock = Arc<Mutex<()>>;

pub(crate) struct ConnectionManager<S> {
	url: ArcStr,
	session: Arc<S>,
	subscriptions: SubscriptionTable,
	ops: OpsLock,
	router: Option<JoinHandle<()>>,
}

impl<S> ConnectionManager<S>
where S: BrokerSession
{
	/// Take ownership of a freshly connected session and start routing
	/// its events
	pub(crate) fn spawn<C, St>(
		url: ArcStr,
		session: S,
		events: SessionEvents,
		handler: MessageHandler<C, St>,
	) -> Self
	where
		C: CatalogClient,
		St: StorageSink,
	{
		let session = Arc::new(session);
		let subscriptions = SubscriptionTable::default();
		let ops = OpsLock::default();
		let router = tokio::spawn(route_events(
			url.clone(),
			Arc::clone(&session),
			Arc::clone(&subscriptions),
			Arc::clone(&ops),
			events,
			handler,
		));
		Self {
			url,
			session,
			subscriptions,
			ops,
			router: Some(router),
		}
	}

	/// SUBSCRIBE on the broker, then track the subscription.
	///
	/// The table only gains the entry once the broker acknowledged it.
	pub(crate) async fn subscribe(
		&self,
		subscription: Subscription,
	) -> Result<(), BrokerError> {
		let _ops = self.ops.lock().await;
		self.session
			.subscribe(&subscription.key.topic, subscription.qos)
			.await?;
		write(&self.subscriptions)
			.insert(subscription.key.topic.clone(), subscription);
		Ok(())
	}

	/// UNSUBSCRIBE on the broker. The caller already dropped the table
	/// entry through [`Self::decrement`].
	pub(crate) async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
		let _ops = self.ops.lock().await;
		self.session.unsubscribe(topic).await
	}

	/// Add a receiver to an existing subscription; `None` if absent
	pub(crate) fn increment(&self, topic: &str) -> Option<usize> {
		write(&self.subscriptions).get_mut(topic).map(|subscription| {
			subscription.receivers += 1;
			subscription.receivers
		})
	}

	/// Remove a receiver. A subscription reaching zero receivers is
	/// removed from the table in the same critical section.
	///
	/// Returns the remaining receiver count, `None` if absent.
	pub(crate) fn decrement(&self, topic: &str) -> Option<usize> {
		let mut table = write(&self.subscriptions);
		let subscription = table.get_mut(topic)?;
		subscription.receivers = subscription.receivers.saturating_sub(1);
		let remaining = subscription.receivers;
		if remaining == 0 {
			table.remove(topic);
		}
		Some(remaining)
	}

	pub(crate) fn is_empty(&self) -> bool {
		read(&self.subscriptions).is_empty()
	}

	/// Topic filters with their receiver counts
	pub(crate) fn receivers(&self) -> Vec<(ArcStr, usize)> {
		read(&self.subscriptions)
			.values()
			.map(|subscription| {
				(subscription.key.topic.clone(), subscription.receivers)
			})
			.collect()
	}

	/// Disconnect the session and wait for the router to drain
	pub(crate) async fn shutdown(
		mut self,
		grace: Duration,
	) -> Result<(), BrokerError> {
		let result = self.session.disconnect(grace).await;
		if let Some(mut router) = self.router.take() {
			if time::timeout(grace, &mut router).await.is_err() {
				warn!(url = %self.url, "Message router still busy after disconnect, aborting");
				router.abort();
			}
		}
		info!(url = %self.url, "Disconnected");
		result
	}
}

impl<S> Drop for ConnectionManager<S> {
	fn drop(&mut self) {
		if let Some(router) = self.router.take() {
			debug!(url = %self.url, "Connection manager dropped without shutdown");
			router.abort();
		}
	}
}

async fn route_events<S, C, St>(
	url: ArcStr,
	session: Arc<S>,
	subscriptions: SubscriptionTable,
	ops: OpsLock,
	mut events: SessionEvents,
	handler: MessageHandler<C, St>,
) where
	S: BrokerSession,
	C: CatalogClient,
	St: StorageSink,
{
	while let Some(event) = events.recv().await {
		match event {
			| SessionEvent::Message(message) => {
				let matching: Vec<SubscriptionKey> = read(&subscriptions)
					.values()
					.filter(|subscription| {
						filter_matches(&subscription.key.topic, &message.topic)
					})
					.map(|subscription| subscription.key.clone())
					.collect();
				if matching.is_empty() {
					debug!(url = %url, topic = %message.topic, "No subscription for message");
					continue;
				}
				for key in &matching {
					handler.dispatch(key, &message).await;
				}
			}
			| SessionEvent::Connected {
				session_present: false,
			} => {
				info!(url = %url, "Connected without session, resubscribing to all topics");
				resubscribe_all(&url, &session, &subscriptions, &ops);
			}
			| SessionEvent::Connected {
				session_present: true,
			} => {
				info!(url = %url, "Connected with session preserved, subscriptions maintained by broker");
			}
			| SessionEvent::ConnectionLost(reason) => {
				warn!(url = %url, reason = %reason, "Connection lost");
			}
		}
	}
	debug!(url = %url, "Session event stream ended");
}

/// Re-issue SUBSCRIBE for every tracked topic.
///
/// Runs detached so the router keeps draining events while the session
/// waits for the acknowledgments. Each topic is looked up again under the
/// ops lock, so a topic unregistered in the meantime is skipped and an
/// UNSUBSCRIBE queued behind it is never overtaken.
fn resubscribe_all<S>(
	url: &ArcStr,
	session: &Arc<S>,
	subscriptions: &SubscriptionTable,
	ops: &OpsLock,
) where
	S: BrokerSession,
{
	let topics: Vec<ArcStr> = read(subscriptions).keys().cloned().collect();
	let url = url.clone();
	let session = Arc::clone(session);
	let subscriptions = Arc::clone(subscriptions);
	let ops = Arc::clone(ops);
	tokio::spawn(async move {
		for topic in topics {
			let _ops = ops.lock().await;
			let qos = read(&subscriptions)
				.get(&topic)
				.map(|subscription| subscription.qos);
			let Some(qos) = qos else {
				debug!(url = %url, topic = %topic, "Unsubscribed before resubscribe, skipping");
				continue;
			};
			match session.subscribe(&topic, qos).await {
				| Ok(()) => info!(url = %url, topic = %topic, "Subscribed"),
				| Err(err) => {
					error!(url = %url, topic = %topic, error = %err, "Error subscribing")
				}
			}
		}
	});
}

fn read(
	table: &SubscriptionTable,
) -> RwLockReadGuard<'_, HashMap<ArcStr, Subscription>> {
	table.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(
	table: &SubscriptionTable,
) -> RwLockWriteGuard<'_, HashMap<ArcStr, Subscription>> {
	table.write().unwrap_or_else(PoisonError::into_inner)
}
