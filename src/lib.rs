//! # MQTT Ingest
//!
//! Catalog-driven bridge from MQTT brokers to a measurement store.
//!
//! This crate re-exports [`mqtt_ingest_core`] and ships the `mqtt-ingest`
//! service binary. See the core crate for the connector itself.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use mqtt_ingest::prelude::*;
//!
//! # async fn run() -> Result<()> {
//! let catalog = Arc::new(MemoryCatalog::new());
//! let (connector, notifications) = IngestionConnector::start(
//!     catalog.clone(),
//!     Arc::new(MemorySink::new()),
//!     RumqttBroker::default(),
//! )
//! .await?;
//! catalog.register_observer(notifications).await;
//! connector.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub use mqtt_ingest_core::*;
