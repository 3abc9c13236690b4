use std::sync::Arc;

use super::config::ConnectorSettings;
use super::error::ConnectorError;
use super::IngestionConnector;
use crate::broker::Broker;
use crate::catalog::CatalogClient;
use crate::notification::NotificationSender;
use crate::payload::{PayloadParser, SenmlJsonParser};
use crate::storage::StorageSink;

/// Configures an [`IngestionConnector`] before starting it
///
/// ```no_run
/// # use std::sync::Arc;
/// # use mqtt_ingest_core::prelude::*;
/// # async fn run() -> std::result::Result<(), ConnectorError> {
/// let catalog = Arc::new(MemoryCatalog::new());
/// let storage = Arc::new(MemorySink::new());
/// let (connector, notifications) =
/// 	IngestionConnector::builder(catalog.clone(), storage, RumqttBroker::default())
/// 		.settings(ConnectorSettings::default())
/// 		.start()
/// 		.await?;
/// catalog.register_observer(notifications).await;
/// // ...
/// connector.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectorBuilder<C, S, B> {
	catalog: Arc<C>,
	storage: Arc<S>,
	broker: B,
	settings: ConnectorSettings,
	parser: Arc<dyn PayloadParser>,
}

impl<C, S, B> ConnectorBuilder<C, S, B>
where
	C: CatalogClient,
	S: StorageSink,
	B: Broker,
{
	/// Builder with default settings and the SenML JSON parser
	pub fn new(catalog: Arc<C>, storage: Arc<S>, broker: B) -> Self {
		Self {
			catalog,
			storage,
			broker,
			settings: ConnectorSettings::default(),
			parser: Arc::new(SenmlJsonParser),
		}
	}

	/// Replace the connector settings
	pub fn settings(mut self, settings: ConnectorSettings) -> Self {
		self.settings = settings;
		self
	}

	/// Decode payloads with `parser`
	pub fn parser(mut self, parser: impl PayloadParser) -> Self {
		self.parser = Arc::new(parser);
		self
	}

	/// Replay the catalog, then start the notification listener and the
	/// retry loop.
	///
	/// Registrations that fail during the replay are queued for retry. Only
	/// invalid settings or a failing catalog enumeration abort the start.
	pub async fn start(
		self,
	) -> Result<(IngestionConnector<C, S, B>, NotificationSender), ConnectorError>
	{
		self.settings.validate()?;
		IngestionConnector::launch(
			self.catalog,
			self.storage,
			self.broker,
			self.settings,
			self.parser,
		)
		.await
	}
}
