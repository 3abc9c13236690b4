use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// `RUST_LOG_DISABLE` turns logging off, `RUST_LOG` selects the filter,
/// otherwise `default_level` is used.
pub fn setup(default_level: &str) {
	if std::env::var("RUST_LOG_DISABLE").is_ok() {
		return;
	}

	let filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

	tracing_subscriber::registry()
		.with(filter)
		.with(
			tracing_subscriber::fmt::layer()
				.with_target(true)
				.with_thread_ids(false)
				.with_thread_names(false)
				.with_file(false)
				.with_line_number(false)
				.compact(),
		)
		.init();
}
