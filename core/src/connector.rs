//! Catalog-driven subscription orchestration
//!
//! The [`IngestionConnector`] keeps one broker connection per url and one
//! broker-level subscription per topic in sync with the data sources of a
//! catalog. Catalog changes arrive as [`Notification`]s; inbound messages are
//! validated by a [`MessageHandler`] and forwarded to a storage sink.
//!
//! All registration state lives behind a single lock, held for the whole of
//! each register, unregister and notification. Message handling never takes
//! that lock.

mod builder;
mod cache;
mod config;
mod error;
mod handler;
mod manager;


use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use arcstr::ArcStr;
use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

pub use builder::ConnectorBuilder;
pub use cache::ResolutionCache;
pub use config::ConnectorSettings;
pub use error::{ConnectorError, MessageError};
pub use handler::{DropReason, DroppedEntry, MessageHandler, MessageOutcome};
pub use manager::SubscriptionKey;

use manager::{ConnectionManager, Subscription};

use crate::broker::Broker;
use crate::catalog::{BrokerConfig, CatalogClient, DataSource};
use crate::notification::{
	AckResult, Notification, NotificationEnvelope, NotificationError,
	NotificationSender,
};
use crate::payload::PayloadParser;
use crate::storage::StorageSink;
use crate::topic::validate_filter;

/// Keeps broker subscriptions in sync with a catalog and ingests the
/// received measurements.
///
/// Created with [`IngestionConnector::start`] or through a
/// [`ConnectorBuilder`]. Call [`shutdown`](Self::shutdown) before dropping.
pub struct IngestionConnector<C, S, B>
where B: Broker
{
	shared: Arc<Shared<C, S, B>>,
	shutdown_tx: Option<watch::Sender<bool>>,
	listener_handle: Option<JoinHandle<()>>,
	retry_handle: Option<JoinHandle<()>>,
}

/// Point-in-time view of the connector's registration state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectorSnapshot {
	/// Receiver count per topic, per broker url
	pub managers: BTreeMap<String, BTreeMap<String, usize>>,
	/// Ids of data sources waiting for a registration retry
	pub pending: BTreeSet<String>,
}

impl ConnectorSnapshot {
	/// Receiver count of `topic` on `url`, `None` if not subscribed
	pub fn receiver_count(&self, url: &str, topic: &str) -> Option<usize> {
		self.managers.get(url)?.get(topic).copied()
	}

	/// True if a connection to `url` is open
	pub fn has_manager(&self, url: &str) -> bool {
		self.managers.contains_key(url)
	}

	/// True if the data source `id` is queued for retry
	pub fn is_pending(&self, id: &str) -> bool {
		self.pending.contains(id)
	}
}

impl<C, S, B> IngestionConnector<C, S, B>
where
	C: CatalogClient,
	S: StorageSink,
	B: Broker,
{
	/// Start with default settings
	pub async fn start(
		catalog: Arc<C>,
		storage: Arc<S>,
		broker: B,
	) -> Result<(Self, NotificationSender), ConnectorError> {
		Self::builder(catalog, storage, broker).start().await
	}

	/// Configure before starting
	pub fn builder(
		catalog: Arc<C>,
		storage: Arc<S>,
		broker: B,
	) -> ConnectorBuilder<C, S, B> {
		ConnectorBuilder::new(catalog, storage, broker)
	}

	pub(crate) async fn launch(
		catalog: Arc<C>,
		storage: Arc<S>,
		broker: B,
		settings: ConnectorSettings,
		parser: Arc<dyn PayloadParser>,
	) -> Result<(Self, NotificationSender), ConnectorError> {
		let cache_capacity = NonZeroUsize::new(settings.resolution_cache_size)
			.ok_or_else(|| {
				ConnectorError::ConfigurationValue(
					"resolution_cache_size must be greater than 0".to_string(),
				)
			})?;
		let cache = Arc::new(ResolutionCache::new(cache_capacity));
		let handler =
			MessageHandler::new(Arc::clone(&catalog), storage, cache, parser);
		let shared = Arc::new(Shared {
			broker,
			catalog,
			handler,
			settings,
			state: Mutex::new(State::default()),
		});

		shared.replay_catalog().await?;

		let (sender, notifications) = NotificationSender::channel(
			shared.settings.notification_channel_capacity,
		);
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let listener_handle = tokio::spawn(listen(
			Arc::clone(&shared),
			notifications,
			shutdown_rx.clone(),
		));
		let retry_handle =
			tokio::spawn(retry_loop(Arc::clone(&shared), shutdown_rx));

		let connector = Self {
			shared,
			shutdown_tx: Some(shutdown_tx),
			listener_handle: Some(listener_handle),
			retry_handle: Some(retry_handle),
		};
		Ok((connector, sender))
	}

	/// Add one receiver for `config`'s topic.
	///
	/// Connects and subscribes only on the first receiver of a url or topic.
	pub async fn register(
		&self,
		config: &BrokerConfig,
	) -> Result<(), ConnectorError> {
		let mut state = self.shared.state.lock().await;
		self.shared.register_locked(&mut state, config).await
	}

	/// Remove one receiver for `config`'s topic.
	///
	/// Unsubscribes on the last receiver of a topic and disconnects on the
	/// last topic of a url. Unknown configs are ignored.
	pub async fn unregister(
		&self,
		config: &BrokerConfig,
	) -> Result<(), ConnectorError> {
		let mut state = self.shared.state.lock().await;
		self.shared.unregister_locked(&mut state, config).await
	}

	/// Run one retry sweep now; returns the number of registrations still
	/// pending
	pub async fn retry_pending(&self) -> usize {
		self.shared.retry_failed().await
	}

	/// Current registration state
	pub async fn snapshot(&self) -> ConnectorSnapshot {
		let state = self.shared.state.lock().await;
		let managers = state
			.managers
			.iter()
			.map(|(url, manager)| {
				let topics = manager
					.receivers()
					.into_iter()
					.map(|(topic, count)| (topic.to_string(), count))
					.collect();
				(url.to_string(), topics)
			})
			.collect();
		let pending = state.failed_registrations.keys().cloned().collect();
		ConnectorSnapshot { managers, pending }
	}

	/// The handler used for inbound messages
	pub fn message_handler(&self) -> &MessageHandler<C, S> {
		&self.shared.handler
	}

	/// Stop accepting notifications, let the in-flight one finish and
	/// disconnect every broker within the grace period
	pub async fn shutdown(mut self) {
		if let Some(shutdown_tx) = self.shutdown_tx.take() {
			let _ = shutdown_tx.send(true);
		}
		for handle in [self.listener_handle.take(), self.retry_handle.take()]
			.into_iter()
			.flatten()
		{
			if let Err(err) = handle.await {
				warn!(error = %err, "Connector task failed");
			}
		}
		self.shared.disconnect_all().await;
		info!("Connector stopped");
	}
}

impl<C, S, B> Drop for IngestionConnector<C, S, B>
where B: Broker
{
	fn drop(&mut self) {
		if let Some(shutdown_tx) = self.shutdown_tx.take() {
			error!(
				"IngestionConnector dropped without calling shutdown(). Please \
				 call shutdown() and await its completion before dropping."
			);
			let _ = shutdown_tx.send(true);
		}
	}
}

struct State<T> {
	managers: HashMap<ArcStr, ConnectionManager<T>>,
	failed_registrations: BTreeMap<String, BrokerConfig>,
}

impl<T> Default for State<T> {
	fn default() -> Self {
		Self {
			managers: HashMap::new(),
			failed_registrations: BTreeMap::new(),
		}
	}
}

struct Shared<C, S, B>
where B: Broker
{
	broker: B,
	catalog: Arc<C>,
	handler: MessageHandler<C, S>,
	settings: ConnectorSettings,
	state: Mutex<State<B::Session>>,
}

impl<C, S, B> Shared<C, S, B>
where
	C: CatalogClient,
	S: StorageSink,
	B: Broker,
{
	async fn replay_catalog(&self) -> Result<(), ConnectorError> {
		let per_page = self.settings.catalog_page_size;
		let mut state = self.state.lock().await;
		let mut page = 1;
		loop {
			let (sources, total) = self.catalog.enumerate(page, per_page).await?;
			if sources.is_empty() {
				break;
			}
			for ds in &sources {
				let Some(config) = &ds.broker else { continue };
				if let Err(err) = self.register_locked(&mut state, config).await {
					warn!(
						id = %ds.id,
						error = %err,
						"Error registering subscription, will retry"
					);
					state
						.failed_registrations
						.insert(ds.id.clone(), config.clone());
				}
			}
			if page * per_page >= total {
				break;
			}
			page += 1;
		}
		info!(
			managers = state.managers.len(),
			pending = state.failed_registrations.len(),
			"Catalog replayed"
		);
		Ok(())
	}

	async fn register_locked(
		&self,
		state: &mut State<B::Session>,
		config: &BrokerConfig,
	) -> Result<(), ConnectorError> {
		let qos = config.mqtt_qos().ok_or_else(|| ConnectorError::InvalidQos {
			url: config.url.clone(),
			topic: config.topic.clone(),
			qos: config.qos,
		})?;
		validate_filter(&config.topic)?;
		let key = SubscriptionKey::new(config.url.as_str(), config.topic.as_str());

		if let Some(manager) = state.managers.get(&key.url) {
			if let Some(receivers) = manager.increment(&key.topic) {
				debug!(subscription = %key, receivers, "Added receiver");
				return Ok(());
			}
			manager.subscribe(Subscription::new(key.clone(), qos)).await?;
			info!(subscription = %key, "Subscribed");
			return Ok(());
		}

		let (session, events) = self.broker.connect(config).await?;
		info!(url = %key.url, "Connected");
		let manager = ConnectionManager::spawn(
			key.url.clone(),
			session,
			events,
			self.handler.clone(),
		);
		if let Err(err) = manager.subscribe(Subscription::new(key.clone(), qos)).await
		{
			if let Err(disconnect_err) =
				manager.shutdown(self.settings.disconnect_grace).await
			{
				warn!(url = %key.url, error = %disconnect_err, "Error disconnecting");
			}
			return Err(err.into());
		}
		info!(subscription = %key, "Subscribed");
		state.managers.insert(key.url, manager);
		Ok(())
	}

	async fn unregister_locked(
		&self,
		state: &mut State<B::Session>,
		config: &BrokerConfig,
	) -> Result<(), ConnectorError> {
		let Some(manager) = state.managers.get(config.url.as_str()) else {
			debug!(url = %config.url, "Unregister without connection, ignoring");
			return Ok(());
		};
		match manager.decrement(&config.topic) {
			| None => {
				debug!(url = %config.url, topic = %config.topic, "Unregister without subscription, ignoring");
				return Ok(());
			}
			| Some(receivers @ 1..) => {
				debug!(url = %config.url, topic = %config.topic, receivers, "Removed receiver");
				return Ok(());
			}
			| Some(0) => {}
		}

		let result = manager.unsubscribe(&config.topic).await;
		match &result {
			| Ok(()) => {
				info!(url = %config.url, topic = %config.topic, "Unsubscribed")
			}
			| Err(err) => {
				warn!(url = %config.url, topic = %config.topic, error = %err, "Error unsubscribing")
			}
		}
		if manager.is_empty() {
			if let Some(manager) = state.managers.remove(config.url.as_str()) {
				if let Err(err) =
					manager.shutdown(self.settings.disconnect_grace).await
				{
					warn!(url = %config.url, error = %err, "Error disconnecting");
				}
			}
		}
		result.map_err(Into::into)
	}

	async fn apply(&self, notification: Notification) -> Result<(), ConnectorError> {
		let mut state = self.state.lock().await;
		match notification {
			| Notification::Created(ds) => self.source_created(&mut state, ds).await,
			| Notification::Updated { old, new } => {
				self.source_updated(&mut state, old, new).await
			}
			| Notification::Deleted(ds) => self.source_deleted(&mut state, ds).await,
		}
	}

	async fn source_created(
		&self,
		state: &mut State<B::Session>,
		ds: DataSource,
	) -> Result<(), ConnectorError> {
		let Some(config) = ds.broker else {
			return Ok(());
		};
		if let Err(err) = self.register_locked(state, &config).await {
			state.failed_registrations.insert(ds.id, config);
			return Err(err);
		}
		Ok(())
	}

	async fn source_updated(
		&self,
		state: &mut State<B::Session>,
		old: DataSource,
		new: DataSource,
	) -> Result<(), ConnectorError> {
		let cache = self.handler.cache();
		if old.retention != new.retention {
			cache.invalidate_all();
		}
		cache.remove(&old.resource);
		cache.remove(&new.resource);

		if old.broker == new.broker {
			return Ok(());
		}
		let was_pending = state.failed_registrations.remove(&old.id).is_some();
		let mut result = Ok(());
		if let (false, Some(config)) = (was_pending, &old.broker) {
			if let Err(err) = self.unregister_locked(state, config).await {
				result = Err(err);
			}
		}
		if let Some(config) = new.broker {
			if let Err(err) = self.register_locked(state, &config).await {
				state.failed_registrations.insert(new.id, config);
				if result.is_ok() {
					result = Err(err);
				}
			}
		}
		result
	}

	async fn source_deleted(
		&self,
		state: &mut State<B::Session>,
		ds: DataSource,
	) -> Result<(), ConnectorError> {
		self.handler.cache().invalidate_all();
		let was_pending = state.failed_registrations.remove(&ds.id).is_some();
		match (&ds.broker, was_pending) {
			| (Some(config), false) => self.unregister_locked(state, config).await,
			| _ => Ok(()),
		}
	}

	/// One retry sweep; returns the number of registrations still pending
	async fn retry_failed(&self) -> usize {
		let mut state = self.state.lock().await;
		let pending: Vec<(String, BrokerConfig)> = state
			.failed_registrations
			.iter()
			.map(|(id, config)| (id.clone(), config.clone()))
			.collect();
		for (id, config) in pending {
			match self.register_locked(&mut state, &config).await {
				| Ok(()) => {
					info!(id = %id, url = %config.url, topic = %config.topic, "Registration retry succeeded");
					state.failed_registrations.remove(&id);
				}
				| Err(err) => {
					warn!(id = %id, error = %err, "Registration retry failed");
				}
			}
		}
		state.failed_registrations.len()
	}

	async fn disconnect_all(&self) {
		let mut state = self.state.lock().await;
		let grace = self.settings.disconnect_grace;
		let shutdowns = state.managers.drain().map(|(url, manager)| async move {
			if let Err(err) = manager.shutdown(grace).await {
				warn!(url = %url, error = %err, "Error disconnecting");
			}
		});
		join_all(shutdowns).await;
	}

	/// Apply one notification inside the fault boundary
	async fn acknowledge(&self, notification: Notification) -> AckResult {
		let kind = notification.kind();
		let id = notification.source_id().to_string();
		match AssertUnwindSafe(self.apply(notification)).catch_unwind().await {
			| Ok(Ok(())) => {
				debug!(kind, id = %id, "Notification applied");
				Ok(())
			}
			| Ok(Err(err)) => {
				error!(kind, id = %id, error = %err, "Error applying notification");
				Err(NotificationError::Rejected(err.to_string()))
			}
			| Err(panic) => {
				let reason = panic_message(panic.as_ref());
				error!(kind, id = %id, reason = %reason, "Recovered from fault while applying notification");
				Err(NotificationError::Fault(reason))
			}
		}
	}
}

async fn listen<C, S, B>(
	shared: Arc<Shared<C, S, B>>,
	mut notifications: mpsc::Receiver<NotificationEnvelope>,
	mut shutdown: watch::Receiver<bool>,
) where
	C: CatalogClient,
	S: StorageSink,
	B: Broker,
{
	loop {
		let envelope = tokio::select! {
			biased;
			_ = shutdown.changed() => break,
			envelope = notifications.recv() => match envelope {
				| Some(envelope) => envelope,
				| None => break,
			},
		};
		let (notification, ack) = envelope.into_parts();
		let result = shared.acknowledge(notification).await;
		if ack.send(result).is_err() {
			debug!("Notification sender stopped waiting for acknowledgment");
		}
	}
	debug!("Notification listener stopped");
}

async fn retry_loop<C, S, B>(
	shared: Arc<Shared<C, S, B>>,
	mut shutdown: watch::Receiver<bool>,
) where
	C: CatalogClient,
	S: StorageSink,
	B: Broker,
{
	let interval = shared.settings.retry_interval;
	loop {
		tokio::select! {
			biased;
			_ = shutdown.changed() => break,
			_ = time::sleep(interval) => {}
		}
		let remaining = shared.retry_failed().await;
		if remaining > 0 {
			debug!(remaining, "Registrations still pending");
		}
	}
	debug!("Retry loop stopped");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
	if let Some(message) = panic.downcast_ref::<&str>() {
		message.to_string()
	} else if let Some(message) = panic.downcast_ref::<String>() {
		message.clone()
	} else {
		"unknown fault".to_string()
	}
}
