use tracing_subscriber::EnvFilter;

use crate::logging::config::LoggingConfig;

/// Уровень, на который откатываемся при некорректной директиве.
const FALLBACK_DIRECTIVE: &str = "info";

pub fn build_filter_from_config(config: &LoggingConfig) -> EnvFilter {
    // Если RUST_LOG задан, он имеет приоритет над конфигурацией.
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        return env_filter;
    }

    let directive = config.build_filter_directive();
    match EnvFilter::try_new(&directive) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!(
                "Invalid log filter directive from config ('{directive}'): {e}; falling back to '{FALLBACK_DIRECTIVE}'"
            );
            EnvFilter::new(FALLBACK_DIRECTIVE)
        }
    }
}
