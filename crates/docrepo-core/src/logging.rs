//! Tracing subscriber setup for processes embedding the repository layer.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::LoggingConfig;
use crate::error::{CoreError, CoreResult};

/// Installs the global subscriber described by `config`.
///
/// `RUST_LOG` takes precedence over `config.level` when set.
///
/// # Errors
///
/// Returns `Config` for an unparseable level directive or an unknown format,
/// and `InvalidState` when a global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> CoreResult<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| CoreError::Config(format!("invalid log level `{}`: {e}", config.level)))?,
    };

    let result = match config.format.as_str() {
        "json" => Registry::default()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(false),
            )
            .try_init(),
        "pretty" => Registry::default()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_line_number(true),
            )
            .try_init(),
        other => {
            return Err(CoreError::Config(format!(
                "logging.format must be `pretty` or `json`, got `{other}`"
            )))
        }
    };

    result.map_err(|e| CoreError::invalid_state(format!("tracing already initialized: {e}")))
}
