use std::any::Any;

use crate::{ErrorExt, StatusCode};

/// Ошибки операций pub/sub на любом уровне цепочки.
///
/// Тип клонируемый: одна и та же ошибка может быть и возвращена вызывающему
/// коду, и разослана подписчикам событий.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubError {
    /// Некорректный топик или шаблон (пустой, wildcard не на своём месте,
    /// чужой префикс)
    Validation { topic: String, reason: String },
    /// Экземпляр уже закрыт
    Closed,
    /// Экземпляр ещё не готов (сборка не завершена)
    NotReady,
    /// Не удалось собрать лист или делегата фильтра
    Build { reason: String },
    /// Тип транспорта не зарегистрирован
    UnknownTransport { kind: String },
    /// Ошибка нативного клиента транспорта
    Transport { transport: String, reason: String },
    /// Ошибка (де)сериализации одного сообщения
    Codec { reason: String },
}

impl PubSubError {
    pub fn validation(
        topic: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Validation {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    pub fn transport(
        transport: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::Transport {
            transport: transport.into(),
            reason: reason.to_string(),
        }
    }

    pub fn build(reason: impl Into<String>) -> Self {
        Self::Build {
            reason: reason.into(),
        }
    }

    pub fn codec(reason: impl ToString) -> Self {
        Self::Codec {
            reason: reason.to_string(),
        }
    }

    /// Ошибка, после которой цепочку не имеет смысла использовать:
    /// экземпляр закрыт или не собрался.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed) || self.status_code().is_build_error()
    }
}

impl std::fmt::Display for PubSubError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            Self::Validation { topic, reason } => {
                write!(f, "Invalid topic '{topic}': {reason}")
            }
            Self::Closed => write!(f, "Instance is closed"),
            Self::NotReady => write!(f, "Instance is not ready"),
            Self::Build { reason } => write!(f, "Build failed: {reason}"),
            Self::UnknownTransport { kind } => write!(f, "Unknown transport type: {kind}"),
            Self::Transport { transport, reason } => {
                write!(f, "Transport '{transport}' error: {reason}")
            }
            Self::Codec { reason } => write!(f, "Payload codec error: {reason}"),
        }
    }
}

impl std::error::Error for PubSubError {}

impl ErrorExt for PubSubError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::InvalidTopic,
            Self::Closed => StatusCode::InstanceClosed,
            Self::NotReady => StatusCode::NotReady,
            Self::Build { .. } => StatusCode::BuildFailed,
            Self::UnknownTransport { .. } => StatusCode::UnknownTransport,
            Self::Transport { .. } => StatusCode::TransportFailed,
            Self::Codec { .. } => StatusCode::CodecFailed,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
