mod logging;
mod settings;

use std::sync::Arc;

use mqtt_ingest::{
	IngestionConnector, MemoryCatalog, MemorySink, RumqttBroker,
};
use settings::Settings;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let settings = Settings::from_env()?;
	logging::setup(&settings.log_level);

	let catalog = Arc::new(MemoryCatalog::new());
	for ds in settings.seed_sources()? {
		let resource = ds.resource.clone();
		match catalog.add(ds).await {
			| Ok(id) => info!(id = %id, resource = %resource, "Seeded data source"),
			| Err(err) => {
				warn!(resource = %resource, error = %err, "Skipping data source")
			}
		}
	}

	let storage = Arc::new(MemorySink::new());
	let broker = RumqttBroker::new(settings.broker.clone());
	let (connector, notifications) = IngestionConnector::builder(
		Arc::clone(&catalog),
		Arc::clone(&storage),
		broker,
	)
	.settings(settings.connector.clone())
	.start()
	.await?;
	catalog.register_observer(notifications).await;

	let snapshot = connector.snapshot().await;
	info!(
		sources = catalog.len(),
		brokers = snapshot.managers.len(),
		pending = snapshot.pending.len(),
		"Ingestion running, press Ctrl-C to stop"
	);

	if let Err(err) = tokio::signal::ctrl_c().await {
		error!(error = %err, "Cannot listen for shutdown signal");
	}
	info!("Shutting down");
	connector.shutdown().await;
	info!(points = storage.total_points(), "Stored points");
	Ok(())
}
