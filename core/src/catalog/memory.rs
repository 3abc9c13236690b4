//! In-memory catalog with change notification

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CatalogClient, CatalogError, DataSource, is_supported_period};
use crate::notification::{Notification, NotificationSender, Notifier};

/// Upper bound for `per_page` requests
pub const MAX_PER_PAGE: usize = 1000;

/// In-memory catalog that notifies observers after every mutation.
///
/// Mutations are serialized: a mutation returns only after every observer
/// acknowledged its notification, so observers see the changes of one entry
/// in the order they happened.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
	entries: RwLock<BTreeMap<String, DataSource>>,
	notifier: Mutex<Notifier>,
}

impl MemoryCatalog {
	/// Empty catalog without observers
	pub fn new() -> Self {
		Self::default()
	}

	/// Register an observer that receives every subsequent change
	pub async fn register_observer(&self, observer: NotificationSender) {
		self.notifier.lock().await.register(observer);
	}

	/// Add a data source and return its newly assigned id
	pub async fn add(&self, mut ds: DataSource) -> Result<String, CatalogError> {
		let notifier = self.notifier.lock().await;
		validate(&ds)?;
		ds.id = Uuid::new_v4().to_string();
		{
			let mut entries = self.write_entries();
			ensure_unique_resource(&entries, &ds)?;
			entries.insert(ds.id.clone(), ds.clone());
		}
		info!(id = %ds.id, resource = %ds.resource, "Data source added");
		let id = ds.id.clone();
		deliver(&notifier, Notification::Created(ds)).await?;
		Ok(id)
	}

	/// Replace the writable fields of an existing data source
	pub async fn update(
		&self,
		id: &str,
		mut ds: DataSource,
	) -> Result<(), CatalogError> {
		let notifier = self.notifier.lock().await;
		validate(&ds)?;
		ds.id = id.to_string();
		let old = {
			let mut entries = self.write_entries();
			let old = entries
				.get(id)
				.cloned()
				.ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
			ensure_unique_resource(&entries, &ds)?;
			entries.insert(id.to_string(), ds.clone());
			old
		};
		info!(id = %id, "Data source updated");
		deliver(&notifier, Notification::Updated { old, new: ds }).await
	}

	/// Remove a data source
	pub async fn delete(&self, id: &str) -> Result<(), CatalogError> {
		let notifier = self.notifier.lock().await;
		let removed = self
			.write_entries()
			.remove(id)
			.ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
		info!(id = %id, "Data source deleted");
		deliver(&notifier, Notification::Deleted(removed)).await
	}

	/// Get a data source by id
	pub fn get(&self, id: &str) -> Result<DataSource, CatalogError> {
		self.read_entries()
			.get(id)
			.cloned()
			.ok_or_else(|| CatalogError::NotFound(id.to_string()))
	}

	/// Number of stored data sources
	pub fn len(&self) -> usize {
		self.read_entries().len()
	}

	/// True when the catalog holds no data sources
	pub fn is_empty(&self) -> bool {
		self.read_entries().is_empty()
	}

	fn read_entries(
		&self,
	) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, DataSource>> {
		self.entries.read().unwrap_or_else(PoisonError::into_inner)
	}

	fn write_entries(
		&self,
	) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, DataSource>> {
		self.entries.write().unwrap_or_else(PoisonError::into_inner)
	}
}

impl CatalogClient for MemoryCatalog {
	async fn lookup(
		&self,
		resource: &str,
	) -> Result<Option<DataSource>, CatalogError> {
		Ok(self
			.read_entries()
			.values()
			.find(|ds| ds.resource == resource)
			.cloned())
	}

	async fn enumerate(
		&self,
		page: usize,
		per_page: usize,
	) -> Result<(Vec<DataSource>, usize), CatalogError> {
		let page = page.max(1);
		let per_page = per_page.clamp(1, MAX_PER_PAGE);
		let entries = self.read_entries();
		let total = entries.len();
		let items = entries
			.values()
			.skip((page - 1).saturating_mul(per_page))
			.take(per_page)
			.cloned()
			.collect();
		debug!(page, per_page, total, "Enumerated catalog page");
		Ok((items, total))
	}
}

async fn deliver(
	notifier: &Notifier,
	notification: Notification,
) -> Result<(), CatalogError> {
	let errors = notifier.broadcast(&notification).await;
	if errors.is_empty() {
		return Ok(());
	}
	let reasons = errors
		.iter()
		.map(ToString::to_string)
		.collect::<Vec<_>>()
		.join("; ");
	warn!(
		kind = notification.kind(),
		id = %notification.source_id(),
		errors = %reasons,
		"Observers failed to apply catalog change"
	);
	Err(CatalogError::Observer(reasons))
}

fn validate(ds: &DataSource) -> Result<(), CatalogError> {
	if ds.resource.trim().is_empty() {
		return Err(CatalogError::Invalid("resource name is empty".into()));
	}
	if !is_supported_period(&ds.retention) {
		return Err(CatalogError::Invalid(format!(
			"unsupported retention period '{}'",
			ds.retention
		)));
	}
	if let Some(broker) = &ds.broker {
		if broker.url.is_empty() || broker.topic.is_empty() {
			return Err(CatalogError::Invalid(
				"broker url and topic are required".into(),
			));
		}
		if broker.mqtt_qos().is_none() {
			return Err(CatalogError::Invalid(format!(
				"unsupported QoS {}",
				broker.qos
			)));
		}
	}
	Ok(())
}

fn ensure_unique_resource(
	entries: &BTreeMap<String, DataSource>,
	ds: &DataSource,
) -> Result<(), CatalogError> {
	let taken = entries
		.values()
		.any(|other| other.resource == ds.resource && other.id != ds.id);
	if taken {
		return Err(CatalogError::Conflict(format!(
			"resource '{}' is already registered",
			ds.resource
		)));
	}
	Ok(())
}
