use onio_core::config::LoggingConfig;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn filter(verbose: bool, logging: &LoggingConfig) -> EnvFilter {
    if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    }
}

pub fn init(verbose: bool, logging: &LoggingConfig) {
    let registry = tracing_subscriber::registry().with(filter(verbose, logging));
    if logging.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
