//! Logging setup.

use std::io::IsTerminal;

use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize tracing.
///
/// With `debug` everything from debug level up is logged, otherwise
/// `RUST_LOG` decides, defaulting to info.
///
/// Output is pretty-printed when stderr is a terminal or `debug` is set,
/// JSON otherwise.
pub fn init(debug: bool) {
	let filter_layer = if debug {
		EnvFilter::new(Level::DEBUG.as_str())
	} else {
		EnvFilter::builder()
			.with_default_directive(Level::INFO.into())
			.from_env_lossy()
	};

	let fmt_layer = if debug || std::io::stderr().is_terminal() {
		tracing_subscriber::fmt::layer()
			.with_writer(std::io::stderr)
			.pretty()
			.boxed()
	} else {
		tracing_subscriber::fmt::layer()
			.with_writer(std::io::stderr)
			.json()
			.boxed()
	};

	tracing_subscriber::registry()
		.with(filter_layer)
		.with(fmt_layer)
		.init();
}
