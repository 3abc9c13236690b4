//! Data source catalog model and client contract
//!
//! The catalog owns the set of data sources. This crate only reads it:
//! lookups by resource name on the message path and paged enumeration at
//! startup. Mutations arrive as notifications (see [`crate::notification`]).

pub mod memory;

use std::fmt::Display;
use std::future::Future;

use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryCatalog;

/// Errors reported by a catalog implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
	/// The requested data source does not exist
	#[error("Data source '{0}' not found")]
	NotFound(String),

	/// The mutation conflicts with an existing data source
	#[error("Conflict: {0}")]
	Conflict(String),

	/// The data source failed validation
	#[error("Invalid data source: {0}")]
	Invalid(String),

	/// The catalog backend failed
	#[error("Catalog backend error: {0}")]
	Backend(String),

	/// A notification observer failed to apply the change
	#[error("Observer failed to apply change: {0}")]
	Observer(String),
}

impl CatalogError {
	/// Returns true for errors that mean "no such data source"
	pub fn is_not_found(&self) -> bool {
		matches!(self, CatalogError::NotFound(_))
	}
}

/// Declared value type of a data source
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
	/// Numeric measurements (`v`)
	#[default]
	Float,
	/// Textual measurements (`vs`)
	String,
	/// Boolean measurements (`vb`)
	Bool,
}

impl Display for DataType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			| DataType::Float => "float",
			| DataType::String => "string",
			| DataType::Bool => "bool",
		};
		f.write_str(name)
	}
}

/// Username/password pair used when connecting to a broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
	/// Broker username
	pub username: String,
	/// Broker password
	#[serde(default)]
	pub password: String,
}

/// Desired broker subscription of one data source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerConfig {
	/// Broker endpoint, e.g. `tcp://localhost:1883`
	pub url: String,
	/// Topic filter to subscribe to
	pub topic: String,
	/// Requested QoS level (0, 1 or 2)
	#[serde(default)]
	pub qos: u8,
	/// Optional credentials for the broker
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub credentials: Option<Credentials>,
}

impl BrokerConfig {
	/// Create a config without credentials
	pub fn new(url: impl Into<String>, topic: impl Into<String>, qos: u8) -> Self {
		Self {
			url: url.into(),
			topic: topic.into(),
			qos,
			credentials: None,
		}
	}

	/// Attach credentials
	pub fn with_credentials(
		mut self,
		username: impl Into<String>,
		password: impl Into<String>,
	) -> Self {
		self.credentials = Some(Credentials {
			username: username.into(),
			password: password.into(),
		});
		self
	}

	/// Requested QoS as a rumqttc value, `None` when out of range
	pub fn mqtt_qos(&self) -> Option<QoS> {
		match self.qos {
			| 0 => Some(QoS::AtMostOnce),
			| 1 => Some(QoS::AtLeastOnce),
			| 2 => Some(QoS::ExactlyOnce),
			| _ => None,
		}
	}
}

/// A catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
	/// Catalog-assigned identifier
	#[serde(default)]
	pub id: String,
	/// Resource name used by measurements (`bn` + `n` in SenML)
	pub resource: String,
	/// Retention period such as `4w`; empty keeps data forever
	#[serde(default)]
	pub retention: String,
	/// Declared value type
	#[serde(rename = "type", default)]
	pub data_type: DataType,
	/// Broker subscription feeding this data source
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub broker: Option<BrokerConfig>,
}

impl DataSource {
	/// Create a data source without a broker subscription
	pub fn new(resource: impl Into<String>, data_type: DataType) -> Self {
		Self {
			id: String::new(),
			resource: resource.into(),
			retention: String::new(),
			data_type,
			broker: None,
		}
	}

	/// Set the catalog id
	pub fn with_id(mut self, id: impl Into<String>) -> Self {
		self.id = id.into();
		self
	}

	/// Set the retention period
	pub fn with_retention(mut self, retention: impl Into<String>) -> Self {
		self.retention = retention.into();
		self
	}

	/// Attach a broker subscription
	pub fn with_broker(mut self, broker: BrokerConfig) -> Self {
		self.broker = Some(broker);
		self
	}
}

/// Read-only access to the catalog
///
/// Implementations must be safe to call concurrently from several
/// subscription handlers.
pub trait CatalogClient: Send + Sync + 'static {
	/// Find the data source registered for `resource`.
	///
	/// `Ok(None)` and `Err(CatalogError::NotFound)` mean the same thing to
	/// callers.
	fn lookup(
		&self,
		resource: &str,
	) -> impl Future<Output = Result<Option<DataSource>, CatalogError>> + Send;

	/// Return one page (1-based) of data sources and the total count
	fn enumerate(
		&self,
		page: usize,
		per_page: usize,
	) -> impl Future<Output = Result<(Vec<DataSource>, usize), CatalogError>> + Send;
}

/// Check a retention period against `^[0-9]*(m|h|d|w)$`; empty is allowed
pub fn is_supported_period(period: &str) -> bool {
	if period.is_empty() {
		return true;
	}
	let Some(unit) = period.chars().last() else {
		return true;
	};
	let count = &period[.. period.len() - unit.len_utf8()];
	matches!(unit, 'm' | 'h' | 'd' | 'w')
		&& count.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_supported_periods() {
		assert!(is_supported_period(""));
		assert!(is_supported_period("1w"));
		assert!(is_supported_period("30d"));
		assert!(is_supported_period("h"));
		assert!(!is_supported_period("10"));
		assert!(!is_supported_period("1y"));
		assert!(!is_supported_period("w1"));
	}

	#[test]
	fn test_qos_conversion() {
		assert_eq!(
			BrokerConfig::new("tcp://b:1883", "t", 1).mqtt_qos(),
			Some(QoS::AtLeastOnce)
		);
		assert_eq!(BrokerConfig::new("tcp://b:1883", "t", 3).mqtt_qos(), None);
	}

	#[test]
	fn test_data_source_json_shape() {
		let json = r#"{
			"id": "ds-1",
			"resource": "kitchen/temp",
			"type": "float",
			"broker": {"url": "tcp://localhost:1883", "topic": "sensors/#", "qos": 1}
		}"#;
		let ds: DataSource = serde_json::from_str(json).unwrap();
		assert_eq!(ds.data_type, DataType::Float);
		assert_eq!(ds.retention, "");
		let broker = ds.broker.unwrap();
		assert_eq!(broker.topic, "sensors/#");
		assert!(broker.credentials.is_none());
	}
}
