//! Test doubles shared by the unit tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use rumqttc::QoS;
use tokio::sync::mpsc;

use crate::broker::{
	Broker, BrokerError, BrokerSession, InboundMessage, SessionEvent,
	SessionEvents,
};
use crate::catalog::{
	BrokerConfig, CatalogClient, CatalogError, DataSource, MemoryCatalog,
};
use crate::storage::{Batch, BatchSources, StorageError, StorageSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BrokerCall {
	Connect(String),
	Subscribe { url: String, topic: String },
	Unsubscribe { url: String, topic: String },
	Disconnect(String),
}

#[derive(Debug, Default)]
struct MockState {
	calls: Vec<BrokerCall>,
	sessions: HashMap<String, (u64, mpsc::Sender<SessionEvent>)>,
	next_session: u64,
	refused_urls: HashSet<String>,
	refused_topics: HashSet<String>,
	refused_unsubscribes: HashSet<String>,
	panic_on_connect: bool,
	panic_on_subscribe: bool,
	subscribe_delay: Option<Duration>,
}

/// Broker that records every call and lets tests inject session events
#[derive(Debug, Clone, Default)]
pub(crate) struct MockBroker {
	state: Arc<Mutex<MockState>>,
}

impl MockBroker {
	pub(crate) fn new() -> Self {
		Self::default()
	}

	pub(crate) fn refuse_connect(&self, url: &str, refuse: bool) {
		let mut state = self.lock();
		if refuse {
			state.refused_urls.insert(url.to_string());
		} else {
			state.refused_urls.remove(url);
		}
	}

	pub(crate) fn refuse_subscribe(&self, topic: &str, refuse: bool) {
		let mut state = self.lock();
		if refuse {
			state.refused_topics.insert(topic.to_string());
		} else {
			state.refused_topics.remove(topic);
		}
	}

	pub(crate) fn refuse_unsubscribe(&self, topic: &str, refuse: bool) {
		let mut state = self.lock();
		if refuse {
			state.refused_unsubscribes.insert(topic.to_string());
		} else {
			state.refused_unsubscribes.remove(topic);
		}
	}

	pub(crate) fn panic_on_connect(&self, panic: bool) {
		self.lock().panic_on_connect = panic;
	}

	pub(crate) fn panic_on_subscribe(&self, panic: bool) {
		self.lock().panic_on_subscribe = panic;
	}

	/// Hold every SUBACK back for `delay`
	pub(crate) fn delay_subscribe(&self, delay: Option<Duration>) {
		self.lock().subscribe_delay = delay;
	}

	pub(crate) fn calls(&self) -> Vec<BrokerCall> {
		self.lock().calls.clone()
	}

	pub(crate) fn count(&self, expected: &BrokerCall) -> usize {
		self.lock().calls.iter().filter(|call| *call == expected).count()
	}

	pub(crate) fn is_connected(&self, url: &str) -> bool {
		self.lock().sessions.contains_key(url)
	}

	/// Inject a publish on `url`; false if no session is open
	pub(crate) async fn publish(
		&self,
		url: &str,
		topic: &str,
		payload: &str,
	) -> bool {
		let message = InboundMessage {
			topic: topic.to_string(),
			payload: Bytes::copy_from_slice(payload.as_bytes()),
			qos: QoS::AtLeastOnce,
		};
		self.emit(url, SessionEvent::Message(message)).await
	}

	/// Simulate a transport loss followed by a reconnect
	pub(crate) async fn reconnect(&self, url: &str, session_present: bool) -> bool {
		self.emit(url, SessionEvent::ConnectionLost("reset by peer".into()))
			.await && self.emit(url, SessionEvent::Connected { session_present }).await
	}

	async fn emit(&self, url: &str, event: SessionEvent) -> bool {
		let sender = self.lock().sessions.get(url).map(|(_, tx)| tx.clone());
		match sender {
			| Some(tx) => tx.send(event).await.is_ok(),
			| None => false,
		}
	}

	fn lock(&self) -> MutexGuard<'_, MockState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

impl Broker for MockBroker {
	type Session = MockSession;

	async fn connect(
		&self,
		config: &BrokerConfig,
	) -> Result<(MockSession, SessionEvents), BrokerError> {
		let (id, rx, panic) = {
			let mut state = self.lock();
			state.calls.push(BrokerCall::Connect(config.url.clone()));
			if state.refused_urls.contains(&config.url) {
				return Err(BrokerError::connect(&config.url, "connection refused"));
			}
			let (tx, rx) = mpsc::channel(16);
			state.next_session += 1;
			let id = state.next_session;
			state.sessions.insert(config.url.clone(), (id, tx));
			(id, rx, state.panic_on_connect)
		};
		if panic {
			panic!("mock broker fault");
		}
		let session = MockSession {
			id,
			url: config.url.clone(),
			state: Arc::clone(&self.state),
		};
		Ok((session, rx))
	}
}

#[derive(Debug)]
pub(crate) struct MockSession {
	id: u64,
	url: String,
	state: Arc<Mutex<MockState>>,
}

impl MockSession {
	fn lock(&self) -> MutexGuard<'_, MockState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

impl BrokerSession for MockSession {
	async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), BrokerError> {
		let (refused, panic, delay) = {
			let mut state = self.lock();
			state.calls.push(BrokerCall::Subscribe {
				url: self.url.clone(),
				topic: topic.to_string(),
			});
			(
				state.refused_topics.contains(topic),
				state.panic_on_subscribe,
				state.subscribe_delay,
			)
		};
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}
		if panic {
			panic!("mock subscribe fault");
		}
		if refused {
			return Err(BrokerError::subscribe(topic, "not authorized"));
		}
		Ok(())
	}

	async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
		let mut state = self.lock();
		state.calls.push(BrokerCall::Unsubscribe {
			url: self.url.clone(),
			topic: topic.to_string(),
		});
		if state.refused_unsubscribes.contains(topic) {
			return Err(BrokerError::unsubscribe(topic, "not authorized"));
		}
		Ok(())
	}

	async fn disconnect(&self, _grace: Duration) -> Result<(), BrokerError> {
		let mut state = self.lock();
		state.calls.push(BrokerCall::Disconnect(self.url.clone()));
		if matches!(state.sessions.get(&self.url), Some((id, _)) if *id == self.id)
		{
			state.sessions.remove(&self.url);
		}
		Ok(())
	}
}

/// Catalog counting lookups, optionally failing them
#[derive(Debug, Default)]
pub(crate) struct CountingCatalog {
	pub(crate) inner: MemoryCatalog,
	lookups: AtomicUsize,
	fail_lookups: AtomicBool,
}

impl CountingCatalog {
	pub(crate) fn new() -> Self {
		Self::default()
	}

	pub(crate) fn lookups(&self) -> usize {
		self.lookups.load(Ordering::SeqCst)
	}

	pub(crate) fn fail_lookups(&self, fail: bool) {
		self.fail_lookups.store(fail, Ordering::SeqCst);
	}
}

impl CatalogClient for CountingCatalog {
	async fn lookup(
		&self,
		resource: &str,
	) -> Result<Option<DataSource>, CatalogError> {
		self.lookups.fetch_add(1, Ordering::SeqCst);
		if self.fail_lookups.load(Ordering::SeqCst) {
			return Err(CatalogError::Backend("catalog unavailable".into()));
		}
		self.inner.lookup(resource).await
	}

	async fn enumerate(
		&self,
		page: usize,
		per_page: usize,
	) -> Result<(Vec<DataSource>, usize), CatalogError> {
		self.inner.enumerate(page, per_page).await
	}
}

/// Sink rejecting every batch
#[derive(Debug, Default)]
pub(crate) struct FailingSink {
	attempts: AtomicUsize,
}

impl FailingSink {
	pub(crate) fn attempts(&self) -> usize {
		self.attempts.load(Ordering::SeqCst)
	}
}

impl StorageSink for FailingSink {
	async fn submit(
		&self,
		_data: Batch,
		_sources: BatchSources,
	) -> Result<(), StorageError> {
		self.attempts.fetch_add(1, Ordering::SeqCst);
		Err(StorageError::Backend("disk full".into()))
	}
}

/// Poll `condition` until it holds or about a second passed
pub(crate) async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
	for _ in 0..200 {
		if condition() {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	condition()
}
