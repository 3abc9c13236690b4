//! Inbound payload parsing
//!
//! Broker payloads are decoded into flat [`Entry`] lists. The bundled
//! [`SenmlJsonParser`] reads SenML JSON packs; other formats plug in through
//! [`PayloadParser`].

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use thiserror::Error;

/// Times below this value are relative to "now" (RFC 8428, section 4.5.3)
pub const RELATIVE_TIME_LIMIT: f64 = 268_435_456.0;

/// Errors produced while decoding a payload
#[derive(Debug, Error)]
pub enum PayloadError {
	/// Payload is not valid JSON of the expected shape
	#[error("Error parsing json: {0}")]
	Json(#[from] serde_json::Error),

	/// Payload decoded but violates the format rules
	#[error("Invalid SenML: {0}")]
	Invalid(String),
}

/// One measurement with all base values resolved
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Entry {
	/// Full resource name (`bn` + `n`)
	pub name: String,
	/// Absolute time in seconds since the epoch
	pub time: f64,
	/// Unit, if any
	pub unit: Option<String>,
	/// Numeric value
	pub value: Option<f64>,
	/// String value
	pub string_value: Option<String>,
	/// Boolean value
	pub bool_value: Option<bool>,
	/// Integrated sum
	pub sum: Option<f64>,
}

impl Entry {
	/// Numeric entry, handy for building fixtures
	pub fn float(name: impl Into<String>, value: f64) -> Self {
		Self {
			name: name.into(),
			value: Some(value),
			..Self::default()
		}
	}

	/// String entry
	pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			string_value: Some(value.into()),
			..Self::default()
		}
	}

	/// Boolean entry
	pub fn boolean(name: impl Into<String>, value: bool) -> Self {
		Self {
			name: name.into(),
			bool_value: Some(value),
			..Self::default()
		}
	}

	/// True when a non-empty string value is carried
	pub fn has_string(&self) -> bool {
		self.string_value.as_deref().is_some_and(|s| !s.is_empty())
	}
}

/// Decoder for inbound broker payloads
pub trait PayloadParser: Send + Sync + 'static {
	/// Decode `payload` into entries with resolved names and times
	fn parse(&self, payload: &[u8]) -> Result<Vec<Entry>, PayloadError>;
}

/// SenML JSON pack decoder
#[derive(Debug, Clone, Copy, Default)]
pub struct SenmlJsonParser;

#[derive(Debug, Deserialize)]
struct Record {
	bn: Option<String>,
	bt: Option<f64>,
	bu: Option<String>,
	n: Option<String>,
	u: Option<String>,
	v: Option<f64>,
	vs: Option<String>,
	vb: Option<bool>,
	s: Option<f64>,
	t: Option<f64>,
}

impl PayloadParser for SenmlJsonParser {
	fn parse(&self, payload: &[u8]) -> Result<Vec<Entry>, PayloadError> {
		let records: Vec<Record> = serde_json::from_slice(payload)?;
		if records.is_empty() {
			return Err(PayloadError::Invalid("pack has no records".into()));
		}
		let now = unix_now();
		let mut base_name = String::new();
		let mut base_time = 0.0;
		let mut base_unit: Option<String> = None;
		records
			.into_iter()
			.enumerate()
			.map(|(index, record)| {
				if let Some(bn) = record.bn {
					base_name = bn;
				}
				if let Some(bt) = record.bt {
					base_time = bt;
				}
				if let Some(bu) = record.bu {
					base_unit = Some(bu);
				}
				let values = [
					record.v.is_some(),
					record.vs.is_some(),
					record.vb.is_some(),
				];
				if values.iter().filter(|present| **present).count() > 1 {
					return Err(PayloadError::Invalid(format!(
						"record {index} carries more than one value"
					)));
				}
				let mut time = base_time + record.t.unwrap_or(0.0);
				if time < RELATIVE_TIME_LIMIT {
					time += now;
				}
				Ok(Entry {
					name: format!(
						"{base_name}{}",
						record.n.as_deref().unwrap_or_default()
					),
					time,
					unit: record.u.or_else(|| base_unit.clone()),
					value: record.v,
					string_value: record.vs,
					bool_value: record.vb,
					sum: record.s,
				})
			})
			.collect()
	}
}

fn unix_now() -> f64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|elapsed| elapsed.as_secs_f64())
		.unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse(json: &str) -> Result<Vec<Entry>, PayloadError> {
		SenmlJsonParser.parse(json.as_bytes())
	}

	#[test]
	fn test_base_values_are_carried_forward() {
		let entries = parse(
			r#"[
				{"bn": "home/", "bt": 1700000000, "bu": "Cel", "n": "temp", "v": 21.5},
				{"n": "hum", "u": "%RH", "v": 40, "t": 10},
				{"bn": "door/", "n": "open", "vb": true}
			]"#,
		)
		.unwrap();
		assert_eq!(entries.len(), 3);
		assert_eq!(entries[0].name, "home/temp");
		assert_eq!(entries[0].unit.as_deref(), Some("Cel"));
		assert_eq!(entries[0].time, 1_700_000_000.0);
		assert_eq!(entries[1].name, "home/hum");
		assert_eq!(entries[1].unit.as_deref(), Some("%RH"));
		assert_eq!(entries[1].time, 1_700_000_010.0);
		assert_eq!(entries[2].name, "door/open");
		assert_eq!(entries[2].bool_value, Some(true));
		assert_eq!(entries[2].time, 1_700_000_000.0);
	}

	#[test]
	fn test_relative_time_resolves_against_now() {
		let entries = parse(r#"[{"n": "x", "v": 1, "t": -5}]"#).unwrap();
		assert!(entries[0].time > RELATIVE_TIME_LIMIT);
	}

	#[test]
	fn test_missing_name_is_kept_empty() {
		let entries = parse(r#"[{"v": 1}]"#).unwrap();
		assert_eq!(entries[0].name, "");
	}

	#[test]
	fn test_invalid_payloads() {
		assert!(matches!(parse("not json"), Err(PayloadError::Json(_))));
		assert!(matches!(parse(r#"{"n": "x"}"#), Err(PayloadError::Json(_))));
		assert!(matches!(parse("[]"), Err(PayloadError::Invalid(_))));
		assert!(matches!(
			parse(r#"[{"n": "x", "v": 1, "vs": "one"}]"#),
			Err(PayloadError::Invalid(_))
		));
	}

	#[test]
	fn test_has_string_ignores_empty_values() {
		assert!(!Entry::string("a", "").has_string());
		assert!(Entry::string("a", "on").has_string());
		assert!(!Entry::float("a", 1.0).has_string());
	}
}
