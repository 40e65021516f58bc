use crate::config::LoggingConfig;
use crate::error::{EscrowError, EscrowResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Fails if a subscriber is
/// already installed, so embedding applications can keep their own.
pub fn init_tracing(config: &LoggingConfig) -> EscrowResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| EscrowError::Config(format!("invalid log level '{}': {}", config.level, e)))?;

    let result = if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };

    result.map_err(|e| EscrowError::Config(format!("tracing already initialized: {}", e)))
}
