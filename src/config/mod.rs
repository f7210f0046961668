//! Конфигурация сборки цепочки и настройки приложения.
//!
//! - [`BuildConfig`]: описание одной цепочки (тип листа, префикс, кодек,
//!   правила фильтра, синтаксис топиков, опции транспорта).
//! - `settings`: загрузка [`Settings`] из файла и окружения.

pub mod settings;

use serde::{Deserialize, Serialize};

pub use settings::{ConfigLoadError, Settings};

use crate::{
    adapter::{compile_rule, is_catch_all},
    topic::TopicSyntax,
    PubSubError,
};

/// Тип листа по умолчанию.
pub const DEFAULT_KIND: &str = "memory";
/// Тип, который собирается в [`FilterRouter`](crate::adapter::FilterRouter).
pub const FILTER_KIND: &str = "filter";

/// Описание цепочки.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Имя зарегистрированного транспорта или `"filter"`
    #[serde(rename = "type")]
    pub kind: String,
    /// Пространство имён для всех топиков
    pub prefix: Option<String>,
    /// Оборачивать ли цепочку в JSON-кодек
    pub json: bool,
    /// Правила фильтра (только для `type = "filter"`)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterConfig>,
    /// Синтаксис топиков
    pub syntax: TopicSyntax,
    /// Опции конкретного транспорта
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// Правило фильтра: выражение и конфигурация делегата.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub accepts: String,
    #[serde(flatten)]
    pub delegate: BuildConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            kind: DEFAULT_KIND.to_string(),
            prefix: None,
            json: true,
            filters: Vec::new(),
            syntax: TopicSyntax::default(),
            options: serde_json::Map::new(),
        }
    }
}

impl BuildConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn with_prefix(
        mut self,
        prefix: impl Into<String>,
    ) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_json(
        mut self,
        json: bool,
    ) -> Self {
        self.json = json;
        self
    }

    pub fn with_filter(
        mut self,
        accepts: impl Into<String>,
        delegate: BuildConfig,
    ) -> Self {
        self.filters.push(FilterConfig {
            accepts: accepts.into(),
            delegate,
        });
        self
    }

    pub fn with_syntax(
        mut self,
        syntax: TopicSyntax,
    ) -> Self {
        self.syntax = syntax;
        self
    }

    pub fn with_option(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Опция транспорта, приведённая к нужному типу.
    pub fn option<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, PubSubError> {
        self.options
            .get(key)
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| PubSubError::build(format!("invalid option '{key}': {e}")))
    }

    pub fn is_filter(&self) -> bool {
        self.kind == FILTER_KIND
    }

    /// Статическая проверка конфигурации без сборки.
    ///
    /// Регистрацию типа проверяет сборщик: здесь известен только `"filter"`.
    pub fn validate(&self) -> Result<(), PubSubError> {
        if self.kind.is_empty() {
            return Err(PubSubError::build("transport type must not be empty"));
        }
        self.syntax.validate()?;

        if let Some(prefix) = &self.prefix {
            if prefix.is_empty() {
                return Err(PubSubError::validation(prefix, "prefix must not be empty"));
            }
            if self.syntax.has_wildcards(prefix) {
                return Err(PubSubError::validation(
                    prefix,
                    "prefix must not contain wildcards",
                ));
            }
        }

        if !self.is_filter() {
            if !self.filters.is_empty() {
                return Err(PubSubError::build(format!(
                    "filters are only allowed for type '{FILTER_KIND}', got '{}'",
                    self.kind
                )));
            }
            return Ok(());
        }

        let last = self.filters.len().saturating_sub(1);
        for (index, rule) in self.filters.iter().enumerate() {
            compile_rule(&rule.accepts)?;
            if index != last && is_catch_all(&rule.accepts) {
                return Err(PubSubError::validation(
                    &rule.accepts,
                    format!("catch-all rule at position {index} must be the last one"),
                ));
            }
            rule.delegate.validate()?;
        }
        Ok(())
    }
}
