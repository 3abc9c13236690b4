//! Service configuration from the environment
//!
//! `.env` is loaded first, then `.env.local` overrides it. Every variable is
//! optional:
//!
//! - `MQTT_INGEST_CATALOG_FILE`: JSON array of data sources to seed the catalog
//! - `MQTT_INGEST_RETRY_INTERVAL_SECS`: delay between registration retries
//! - `MQTT_INGEST_PAGE_SIZE`: catalog replay page size
//! - `MQTT_INGEST_CACHE_SIZE`: resolution cache capacity
//! - `MQTT_INGEST_CLIENT_ID_PREFIX`: MQTT client id prefix
//! - `MQTT_INGEST_KEEP_ALIVE_SECS`: MQTT keep-alive
//! - `MQTT_INGEST_LOG_LEVEL`: log filter used when `RUST_LOG` is unset

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use mqtt_ingest::{ConnectorSettings, DataSource, RumqttSettings};
use thiserror::Error;

const PREFIX: &str = "MQTT_INGEST_";

#[derive(Debug, Error)]
pub enum SettingsError {
	#[error("Invalid value '{value}' for {name}: {reason}")]
	InvalidValue {
		name: String,
		value: String,
		reason: String,
	},

	#[error("Cannot read catalog file {path}: {source}")]
	CatalogFile {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("Malformed catalog file {path}: {source}")]
	CatalogJson {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},
}

#[derive(Debug, Clone)]
pub struct Settings {
	pub connector: ConnectorSettings,
	pub broker: RumqttSettings,
	pub catalog_file: Option<PathBuf>,
	pub log_level: String,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			connector: ConnectorSettings::default(),
			broker: RumqttSettings::default(),
			catalog_file: None,
			log_level: "info".to_string(),
		}
	}
}

impl Settings {
	pub fn from_env() -> Result<Self, SettingsError> {
		load_env_files();
		let mut settings = Self::default();

		if let Some(secs) = parse_var::<u64>("RETRY_INTERVAL_SECS")? {
			if secs == 0 {
				return Err(invalid("RETRY_INTERVAL_SECS", "0", "must be positive"));
			}
			settings.connector.retry_interval = Duration::from_secs(secs);
		}
		if let Some(size) = parse_var::<usize>("PAGE_SIZE")? {
			settings.connector.catalog_page_size = size;
		}
		if let Some(size) = parse_var::<usize>("CACHE_SIZE")? {
			settings.connector.resolution_cache_size = size;
		}
		if let Some(secs) = parse_var::<u64>("KEEP_ALIVE_SECS")? {
			settings.broker.keep_alive = Duration::from_secs(secs);
		}
		if let Some(prefix) = var("CLIENT_ID_PREFIX") {
			settings.broker.client_id_prefix = prefix;
		}
		if let Some(level) = var("LOG_LEVEL") {
			settings.log_level = level;
		}
		settings.catalog_file = var("CATALOG_FILE").map(PathBuf::from);
		Ok(settings)
	}

	/// Data sources from the seed file, empty without one
	pub fn seed_sources(&self) -> Result<Vec<DataSource>, SettingsError> {
		match &self.catalog_file {
			| Some(path) => read_sources(path),
			| None => Ok(Vec::new()),
		}
	}
}

fn read_sources(path: &Path) -> Result<Vec<DataSource>, SettingsError> {
	let raw =
		std::fs::read(path).map_err(|source| SettingsError::CatalogFile {
			path: path.to_path_buf(),
			source,
		})?;
	serde_json::from_slice(&raw).map_err(|source| SettingsError::CatalogJson {
		path: path.to_path_buf(),
		source,
	})
}

fn load_env_files() {
	dotenv::dotenv().ok();
	if Path::new(".env.local").exists() {
		dotenv::from_filename(".env.local").ok();
	}
}

fn var(name: &str) -> Option<String> {
	env::var(format!("{PREFIX}{name}"))
		.ok()
		.filter(|value| !value.trim().is_empty())
}

fn parse_var<T>(name: &str) -> Result<Option<T>, SettingsError>
where
	T: FromStr,
	T::Err: std::fmt::Display,
{
	let Some(value) = var(name) else {
		return Ok(None);
	};
	value
		.trim()
		.parse()
		.map(Some)
		.map_err(|err: T::Err| invalid(name, &value, err))
}

fn invalid(name: &str, value: &str, reason: impl ToString) -> SettingsError {
	SettingsError::InvalidValue {
		name: format!("{PREFIX}{name}"),
		value: value.to_string(),
		reason: reason.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_seed_file_is_parsed() {
		let path = env::temp_dir().join(format!(
			"mqtt-ingest-seed-{}.json",
			std::process::id()
		));
		std::fs::write(
			&path,
			r#"[
				{"resource": "kitchen/temp", "type": "float",
				 "broker": {"url": "tcp://localhost:1883", "topic": "home/#", "qos": 1}},
				{"resource": "door", "type": "bool", "retention": "4w"}
			]"#,
		)
		.unwrap();
		let settings = Settings {
			catalog_file: Some(path.clone()),
			..Settings::default()
		};
		let sources = settings.seed_sources().unwrap();
		std::fs::remove_file(&path).ok();

		assert_eq!(sources.len(), 2);
		assert_eq!(sources[0].broker.as_ref().unwrap().topic, "home/#");
		assert_eq!(sources[1].retention, "4w");
	}

	#[test]
	fn test_missing_seed_file_is_reported() {
		let settings = Settings {
			catalog_file: Some(PathBuf::from("/nonexistent/catalog.json")),
			..Settings::default()
		};
		assert!(matches!(
			settings.seed_sources(),
			Err(SettingsError::CatalogFile { .. })
		));
	}

	#[test]
	fn test_invalid_value_names_the_variable() {
		let err = invalid("PAGE_SIZE", "ten", "invalid digit");
		assert_eq!(
			err.to_string(),
			"Invalid value 'ten' for MQTT_INGEST_PAGE_SIZE: invalid digit"
		);
	}
}
