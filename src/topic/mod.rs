//! Топики, шаблоны подписок и их синтаксис.
//!
//! - `trie`: префиксное дерево шаблонов и поиск всех совпадений для топика.
//! - `counter`: счётчик локальных подписок для дедупликации вызовов
//!   транспорта.
//!
//! Топик состоит из сегментов, разделённых `separator`. Wildcard-токены
//! распознаются только как целые сегменты шаблона: `a/+/c` содержит
//! одноуровневый wildcard, а `a+b` остаётся обычным литералом.

pub mod counter;
pub mod trie;

use serde::{Deserialize, Serialize};

use crate::PubSubError;

pub use counter::SubscriptionCounter;
pub use trie::TopicTrie;

/// Разделитель сегментов по умолчанию.
pub const DEFAULT_SEPARATOR: &str = "/";
/// Одноуровневый wildcard по умолчанию.
pub const DEFAULT_SINGLE_WILDCARD: &str = "+";
/// Многоуровневый wildcard по умолчанию.
pub const DEFAULT_MULTI_WILDCARD: &str = "#";

/// Синтаксис топиков: разделитель и wildcard-токены.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicSyntax {
    pub separator: String,
    pub single_wildcard: String,
    pub multi_wildcard: String,
}

/// Вид сегмента шаблона.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Literal(&'a str),
    Single,
    Multi,
}

impl Default for TopicSyntax {
    fn default() -> Self {
        Self {
            separator: DEFAULT_SEPARATOR.to_string(),
            single_wildcard: DEFAULT_SINGLE_WILDCARD.to_string(),
            multi_wildcard: DEFAULT_MULTI_WILDCARD.to_string(),
        }
    }
}

impl TopicSyntax {
    /// Разбивает строку на сырые сегменты.
    pub fn split<'a>(
        &'a self,
        topic: &'a str,
    ) -> impl Iterator<Item = &'a str> + 'a {
        topic.split(self.separator.as_str())
    }

    /// Классифицирует сегмент шаблона.
    pub fn classify<'a>(
        &self,
        segment: &'a str,
    ) -> Segment<'a> {
        if segment == self.multi_wildcard {
            Segment::Multi
        } else if segment == self.single_wildcard {
            Segment::Single
        } else {
            Segment::Literal(segment)
        }
    }

    /// Содержит ли шаблон хотя бы один wildcard-сегмент.
    pub fn has_wildcards(
        &self,
        pattern: &str,
    ) -> bool {
        self.split(pattern)
            .any(|s| !matches!(self.classify(s), Segment::Literal(_)))
    }

    /// Проверяет опубликованный топик: непустой и без wildcard-сегментов.
    pub fn validate_topic(
        &self,
        topic: &str,
    ) -> Result<(), PubSubError> {
        if topic.is_empty() {
            return Err(PubSubError::validation(topic, "topic must not be empty"));
        }
        if self.has_wildcards(topic) {
            return Err(PubSubError::validation(
                topic,
                "wildcards are only allowed in subscription patterns",
            ));
        }
        Ok(())
    }

    /// Разбирает шаблон подписки в список сегментов.
    ///
    /// Многоуровневый wildcard допустим только последним сегментом.
    pub fn parse_pattern<'a>(
        &self,
        pattern: &'a str,
    ) -> Result<Vec<Segment<'a>>, PubSubError> {
        if pattern.is_empty() {
            return Err(PubSubError::validation(pattern, "pattern must not be empty"));
        }

        let segments: Vec<Segment<'a>> = pattern
            .split(self.separator.as_str())
            .map(|s| self.classify(s))
            .collect();

        let last = segments.len() - 1;
        if segments[..last].iter().any(|s| *s == Segment::Multi) {
            return Err(PubSubError::validation(
                pattern,
                format!(
                    "multi-level wildcard '{}' must be the last segment",
                    self.multi_wildcard
                ),
            ));
        }

        Ok(segments)
    }

    /// Склеивает префикс и топик через разделитель.
    pub fn join(
        &self,
        prefix: &str,
        topic: &str,
    ) -> String {
        if prefix.ends_with(self.separator.as_str()) {
            format!("{prefix}{topic}")
        } else {
            format!("{prefix}{}{topic}", self.separator)
        }
    }

    /// Снимает префикс, возвращая непустой остаток топика.
    pub fn strip<'a>(
        &self,
        prefix: &str,
        topic: &'a str,
    ) -> Option<&'a str> {
        let rest = topic.strip_prefix(prefix)?;
        let rest = if prefix.ends_with(self.separator.as_str()) {
            rest
        } else {
            rest.strip_prefix(self.separator.as_str())?
        };
        // Сам префикс без подтопика ничего не оставляет.
        (!rest.is_empty()).then_some(rest)
    }

    /// Проверяет сам синтаксис: токены непустые и различные.
    pub fn validate(&self) -> Result<(), PubSubError> {
        let tokens = [&self.separator, &self.single_wildcard, &self.multi_wildcard];
        if tokens.iter().any(|t| t.is_empty()) {
            return Err(PubSubError::validation(
                "",
                "separator and wildcard tokens must not be empty",
            ));
        }
        if self.single_wildcard == self.multi_wildcard
            || self.single_wildcard.contains(self.separator.as_str())
            || self.multi_wildcard.contains(self.separator.as_str())
        {
            return Err(PubSubError::validation(
                "",
                "wildcard tokens must differ and must not contain the separator",
            ));
        }
        Ok(())
    }
}
