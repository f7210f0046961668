use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Полезная нагрузка сообщения.
///
/// Транспорт видит `Bytes` (после кодека) или то, что передал вызывающий код;
/// слушатель за кодеком получает `Json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum MessagePayload {
    Bytes(Bytes),
    String(String),
    Json(serde_json::Value),
}

/// Подсказки транспорту при публикации.
///
/// Ядро их не интерпретирует, только передаёт листу без изменений.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishOptions {
    /// Уровень гарантий доставки (для MQTT-подобных транспортов)
    pub qos: Option<u8>,
    /// Идентификатор сообщения, если транспорт его поддерживает
    pub message_id: Option<String>,
    /// Сохранять ли последнее сообщение на сервере
    pub retain: bool,
}

/// Доставленное сообщение.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: MessagePayload,
    pub options: PublishOptions,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<MessagePayload>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            options: PublishOptions::default(),
        }
    }

    pub fn with_options(
        mut self,
        options: PublishOptions,
    ) -> Self {
        self.options = options;
        self
    }
}

impl MessagePayload {
    /// Возвращает JSON-значение, если нагрузка уже декодирована.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Сырые байты нагрузки (для `Json` не определены).
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::String(s) => Some(s.as_bytes()),
            Self::Json(_) => None,
        }
    }
}

impl From<Bytes> for MessagePayload {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<u8>> for MessagePayload {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<&'static [u8]> for MessagePayload {
    fn from(value: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(value))
    }
}

impl From<String> for MessagePayload {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for MessagePayload {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<serde_json::Value> for MessagePayload {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}
