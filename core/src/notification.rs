//! Catalog change notifications
//!
//! The catalog owner pushes [`Notification`]s through a [`NotificationSender`]
//! and waits until the listener acknowledged each one. A [`Notifier`] fans a
//! change out to every registered observer, each with its own
//! acknowledgment channel.

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::catalog::DataSource;

/// A change to the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
	/// A data source was added
	Created(DataSource),
	/// A data source was replaced
	Updated {
		/// State before the update
		old: DataSource,
		/// State after the update
		new: DataSource,
	},
	/// A data source was removed
	Deleted(DataSource),
}

impl Notification {
	/// Short name of the notification kind, for logs
	pub fn kind(&self) -> &'static str {
		match self {
			| Notification::Created(_) => "create",
			| Notification::Updated { .. } => "update",
			| Notification::Deleted(_) => "delete",
		}
	}

	/// Id of the data source this notification is about
	pub fn source_id(&self) -> &str {
		match self {
			| Notification::Created(ds) | Notification::Deleted(ds) => &ds.id,
			| Notification::Updated { new, .. } => &new.id,
		}
	}
}

/// Errors delivered back to the sender of a notification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotificationError {
	/// The listener is gone
	#[error("Notification listener closed")]
	ListenerClosed,

	/// The listener dropped the acknowledgment channel
	#[error("Notification acknowledgment lost")]
	AckLost,

	/// The listener could not apply the change
	#[error("{0}")]
	Rejected(String),

	/// The listener hit an internal fault while applying the change
	#[error("Notification handler fault: {0}")]
	Fault(String),
}

/// Acknowledgment result sent back by the listener
pub type AckResult = Result<(), NotificationError>;

/// A notification together with its acknowledgment channel
#[derive(Debug)]
pub struct NotificationEnvelope {
	notification: Notification,
	ack: oneshot::Sender<AckResult>,
}

impl NotificationEnvelope {
	/// Wrap a notification with a fresh acknowledgment channel
	pub fn new(
		notification: Notification,
	) -> (Self, oneshot::Receiver<AckResult>) {
		let (ack, ack_rx) = oneshot::channel();
		(Self { notification, ack }, ack_rx)
	}

	/// The carried notification
	pub fn notification(&self) -> &Notification {
		&self.notification
	}

	/// Split into the notification and its acknowledgment channel
	pub fn into_parts(self) -> (Notification, oneshot::Sender<AckResult>) {
		(self.notification, self.ack)
	}
}

/// Send side of a notification listener
#[derive(Debug, Clone)]
pub struct NotificationSender {
	tx: mpsc::Sender<NotificationEnvelope>,
}

impl NotificationSender {
	/// Create a bounded channel and return both ends
	pub fn channel(
		capacity: usize,
	) -> (Self, mpsc::Receiver<NotificationEnvelope>) {
		let (tx, rx) = mpsc::channel(capacity.max(1));
		(Self { tx }, rx)
	}

	/// Deliver a notification and wait until the listener applied it
	pub async fn notify(&self, notification: Notification) -> AckResult {
		let (envelope, ack_rx) = NotificationEnvelope::new(notification);
		self.tx
			.send(envelope)
			.await
			.map_err(|_| NotificationError::ListenerClosed)?;
		ack_rx.await.map_err(|_| NotificationError::AckLost)?
	}

	/// True once the listener dropped its receiver
	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

/// Observer registration list owned by the catalog
#[derive(Debug, Clone, Default)]
pub struct Notifier {
	observers: Vec<NotificationSender>,
}

impl Notifier {
	/// Empty observer list
	pub fn new() -> Self {
		Self::default()
	}

	/// Add an observer
	pub fn register(&mut self, observer: NotificationSender) {
		self.observers.push(observer);
	}

	/// Number of registered observers
	pub fn len(&self) -> usize {
		self.observers.len()
	}

	/// True when nobody listens
	pub fn is_empty(&self) -> bool {
		self.observers.is_empty()
	}

	/// Deliver `notification` to every observer concurrently.
	///
	/// Returns the failures reported by individual observers. Observers whose
	/// listener has shut down are skipped with a warning.
	pub async fn broadcast(
		&self,
		notification: &Notification,
	) -> Vec<NotificationError> {
		let deliveries = self
			.observers
			.iter()
			.map(|observer| observer.notify(notification.clone()));
		join_all(deliveries)
			.await
			.into_iter()
			.filter_map(|result| match result {
				| Ok(()) => None,
				| Err(NotificationError::ListenerClosed) => {
					warn!(
						kind = notification.kind(),
						"Skipping closed notification observer"
					);
					None
				}
				| Err(err) => Some(err),
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;
	use crate::catalog::DataType;

	fn spawn_listener(
		reply: AckResult,
		delay: Duration,
	) -> NotificationSender {
		let (sender, mut rx) = NotificationSender::channel(1);
		tokio::spawn(async move {
			while let Some(envelope) = rx.recv().await {
				tokio::time::sleep(delay).await;
				let (_, ack) = envelope.into_parts();
				let _ = ack.send(reply.clone());
			}
		});
		sender
	}

	#[tokio::test]
	async fn test_notify_waits_for_ack() {
		let sender = spawn_listener(
			Err(NotificationError::Rejected("nope".into())),
			Duration::ZERO,
		);
		let ds = DataSource::new("a", DataType::Float).with_id("1");
		let result = sender.notify(Notification::Created(ds)).await;
		assert_eq!(result, Err(NotificationError::Rejected("nope".into())));
	}

	#[tokio::test]
	async fn test_notify_closed_listener() {
		let (sender, rx) = NotificationSender::channel(1);
		drop(rx);
		let ds = DataSource::new("a", DataType::Float);
		assert_eq!(
			sender.notify(Notification::Deleted(ds)).await,
			Err(NotificationError::ListenerClosed)
		);
	}

	#[tokio::test]
	async fn test_dropped_ack_is_reported() {
		let (sender, mut rx) = NotificationSender::channel(1);
		tokio::spawn(async move {
			while let Some(envelope) = rx.recv().await {
				drop(envelope);
			}
		});
		let ds = DataSource::new("a", DataType::Float);
		assert_eq!(
			sender.notify(Notification::Created(ds)).await,
			Err(NotificationError::AckLost)
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_broadcast_is_concurrent() {
		let mut notifier = Notifier::new();
		notifier.register(spawn_listener(Ok(()), Duration::from_secs(5)));
		notifier.register(spawn_listener(
			Err(NotificationError::Rejected("broker down".into())),
			Duration::from_secs(5),
		));
		let started = tokio::time::Instant::now();
		let ds = DataSource::new("a", DataType::Bool);
		let errors = notifier.broadcast(&Notification::Created(ds)).await;
		assert_eq!(errors.len(), 1);
		assert!(started.elapsed() < Duration::from_secs(10));
	}

	#[test]
	fn test_notification_accessors() {
		let old = DataSource::new("a", DataType::Float).with_id("7");
		let new = old.clone().with_retention("1w");
		let ntf = Notification::Updated { old, new };
		assert_eq!(ntf.kind(), "update");
		assert_eq!(ntf.source_id(), "7");
	}
}
