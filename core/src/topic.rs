//! MQTT topic filter validation and matching

use thiserror::Error;

/// Maximum topic length accepted by MQTT
pub const MAX_TOPIC_LENGTH: usize = 65535;

/// Errors for malformed topic filters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicFilterError {
	/// Filter is empty or longer than [`MAX_TOPIC_LENGTH`]
	#[error("Topic filter is empty or too long")]
	InvalidLength,

	/// A wildcard is mixed with other characters inside one level
	#[error("Wildcard '{wildcard}' must occupy a whole level in '{filter}'")]
	WildcardInSegment {
		/// Offending filter
		filter: String,
		/// Misplaced wildcard
		wildcard: char,
	},

	/// `#` appears before the last level
	#[error("Multi-level wildcard must be the last level in '{filter}'")]
	HashNotLast {
		/// Offending filter
		filter: String,
	},

	/// Filter contains a null character
	#[error("Topic filter contains a null character")]
	NullCharacter,
}

impl TopicFilterError {
	fn wildcard_in_segment(filter: &str, wildcard: char) -> Self {
		Self::WildcardInSegment {
			filter: filter.to_string(),
			wildcard,
		}
	}
}

/// Validate an MQTT subscription filter
pub fn validate_filter(filter: &str) -> Result<(), TopicFilterError> {
	if filter.is_empty() || filter.len() > MAX_TOPIC_LENGTH {
		return Err(TopicFilterError::InvalidLength);
	}
	if filter.contains('\0') {
		return Err(TopicFilterError::NullCharacter);
	}
	let levels: Vec<&str> = filter.split('/').collect();
	let last = levels.len() - 1;
	for (position, level) in levels.iter().enumerate() {
		for wildcard in ['+', '#'] {
			if level.contains(wildcard) && level.len() > 1 {
				return Err(TopicFilterError::wildcard_in_segment(
					filter, wildcard,
				));
			}
		}
		if *level == "#" && position != last {
			return Err(TopicFilterError::HashNotLast {
				filter: filter.to_string(),
			});
		}
	}
	Ok(())
}

/// Check whether a published `topic` matches subscription `filter`.
///
/// Topics starting with `$` are not matched by filters whose first level
/// is a wildcard.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
	if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#'))
	{
		return false;
	}
	let mut filter_levels = filter.split('/');
	let mut topic_levels = topic.split('/');
	loop {
		match (filter_levels.next(), topic_levels.next()) {
			| (Some("#"), _) => return true,
			| (Some("+"), Some(_)) => {}
			| (Some(expected), Some(actual)) if expected == actual => {}
			| (None, None) => return true,
			| _ => return false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_exact_and_wildcard_matching() {
		assert!(filter_matches("home/kitchen/temp", "home/kitchen/temp"));
		assert!(!filter_matches("home/kitchen/temp", "home/kitchen"));
		assert!(filter_matches("home/+/temp", "home/kitchen/temp"));
		assert!(!filter_matches("home/+/temp", "home/kitchen/hum"));
		assert!(filter_matches("home/#", "home/kitchen/temp"));
		assert!(filter_matches("home/#", "home"));
		assert!(filter_matches("#", "anything/at/all"));
		assert!(!filter_matches("home/+", "home/a/b"));
	}

	#[test]
	fn test_system_topics_need_explicit_prefix() {
		assert!(!filter_matches("#", "$SYS/uptime"));
		assert!(!filter_matches("+/uptime", "$SYS/uptime"));
		assert!(filter_matches("$SYS/#", "$SYS/uptime"));
	}

	#[test]
	fn test_filter_validation() {
		assert!(validate_filter("a/+/b/#").is_ok());
		assert!(validate_filter("#").is_ok());
		assert_eq!(validate_filter(""), Err(TopicFilterError::InvalidLength));
		assert!(matches!(
			validate_filter("a/b#"),
			Err(TopicFilterError::WildcardInSegment { wildcard: '#', .. })
		));
		assert!(matches!(
			validate_filter("a/x+/b"),
			Err(TopicFilterError::WildcardInSegment { wildcard: '+', .. })
		));
		assert!(matches!(
			validate_filter("a/#/b"),
			Err(TopicFilterError::HashNotLast { .. })
		));
		assert_eq!(
			validate_filter("a/\0"),
			Err(TopicFilterError::NullCharacter)
		);
	}
}
