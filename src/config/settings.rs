use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use pubmux_error::{ErrorExt, PubmuxResult, ResultExt, StatusCode};
use serde::{Deserialize, Serialize};

use super::BuildConfig;
use crate::logging::LoggingConfig;

/// Префикс переменных окружения.
pub const ENV_PREFIX: &str = "PUBMUX";
/// Разделитель вложенных ключей в переменных окружения.
pub const ENV_SEPARATOR: &str = "__";

/// Ошибка источника конфигурации.
#[derive(Debug, thiserror::Error)]
#[error("Configuration error: {0}")]
pub struct ConfigLoadError(#[from] config::ConfigError);

impl ErrorExt for ConfigLoadError {
    fn status_code(&self) -> StatusCode {
        StatusCode::InvalidConfig
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Настройки приложения.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pubsub: BuildConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Загружает настройки: значения по умолчанию, затем необязательный
    /// файл (формат по расширению), затем переменные окружения
    /// `PUBMUX__<секция>__<ключ>`.
    pub fn load(path: Option<&Path>) -> PubmuxResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let cfg = builder
            .add_source(Self::environment())
            .build()
            .map_err(ConfigLoadError::from)
            .with_context(|| match path {
                Some(p) => format!("loading settings from {}", p.display()),
                None => "loading settings from environment".to_string(),
            })?;

        Self::finish(cfg)
    }

    /// Разбирает настройки из строки в указанном формате (без окружения).
    pub fn from_str(
        text: &str,
        format: FileFormat,
    ) -> PubmuxResult<Self> {
        let cfg = Config::builder()
            .add_source(File::from_str(text, format))
            .build()
            .map_err(ConfigLoadError::from)
            .context("parsing inline settings")?;

        Self::finish(cfg)
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
    }

    fn finish(cfg: Config) -> PubmuxResult<Self> {
        let settings: Settings = cfg
            .try_deserialize()
            .map_err(ConfigLoadError::from)
            .context("deserializing settings")?;

        settings
            .pubsub
            .validate()
            .context("validating pubsub settings")?;
        settings
            .logging
            .validate()
            .context("validating logging settings")?;

        Ok(settings)
    }
}
