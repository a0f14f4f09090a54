use serde::Deserialize;
use tracing::info;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

pub const LOG_ENV: &str = "CAMPUS_TRADE_LOG";

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Pretty,
    StructuredJson,
}

/// Pick the filter directive: `CAMPUS_TRADE_LOG`, then `RUST_LOG`, then the
/// configured level.
fn build_filter(config: &LoggingConfig) -> EnvFilter {
    let fallback = || EnvFilter::new(&config.level);
    match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("invalid {LOG_ENV} directive ({err}); using `{}`", config.level);
            fallback()
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
    }
}

/// Install the global tracing subscriber. A subscriber that is already set is
/// left in place, so calling this twice is harmless.
pub fn init_tracing(config: &LoggingConfig) {
    let fmt_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer().with_target(false).json().boxed(),
        LogFormat::Pretty => fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(build_filter(config))
        .with(fmt_layer)
        .try_init()
        .ok();

    info!(format = ?config.format, level = %config.level, "tracing initialised");
}
