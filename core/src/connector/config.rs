//! Connector-level behaviour settings

use std::time::Duration;

use super::error::ConnectorError;

/// Timing and sizing knobs of the [`IngestionConnector`](super::IngestionConnector)
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
	/// Page size used to replay the catalog at startup (must be > 0)
	pub catalog_page_size: usize,
	/// Fixed delay between retry sweeps of failed registrations
	pub retry_interval: Duration,
	/// Grace period given to a broker session when disconnecting
	pub disconnect_grace: Duration,
	/// Maximum number of cached resource resolutions (must be > 0)
	pub resolution_cache_size: usize,
	/// Capacity of the notification channel
	pub notification_channel_capacity: usize,
}

impl Default for ConnectorSettings {
	fn default() -> Self {
		Self {
			catalog_page_size: 100,
			retry_interval: Duration::from_secs(10),
			disconnect_grace: Duration::from_millis(250),
			resolution_cache_size: 1000,
			notification_channel_capacity: 1,
		}
	}
}

impl ConnectorSettings {
	pub(crate) fn validate(&self) -> Result<(), ConnectorError> {
		if self.catalog_page_size == 0 {
			return Err(ConnectorError::ConfigurationValue(
				"catalog_page_size must be greater than 0".to_string(),
			));
		}
		if self.resolution_cache_size == 0 {
			return Err(ConnectorError::ConfigurationValue(
				"resolution_cache_size must be greater than 0".to_string(),
			));
		}
		if self.retry_interval.is_zero() {
			return Err(ConnectorError::ConfigurationValue(
				"retry_interval must not be zero".to_string(),
			));
		}
		Ok(())
	}
}
