use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::warn;

use crate::{
    pubsub::{
        forward_async_only, forward_events, Event, Lifecycle, Listener, MessagePayload, PubSub,
        PublishOptions,
    },
    PubSubError,
};

/// Кодирует нагрузку в JSON-байты.
///
/// `Json(v)` → `v`, `String(s)` → JSON-строка. `Bytes` считаются уже
/// закодированным JSON-документом и проходят без изменений, если это
/// корректный JSON: так вложенные кодеки (делегаты фильтра) симметричны.
pub fn encode_json(payload: &MessagePayload) -> Result<Bytes, PubSubError> {
    let encoded = match payload {
        MessagePayload::Json(v) => serde_json::to_vec(v),
        MessagePayload::String(s) => serde_json::to_vec(s),
        MessagePayload::Bytes(b) => {
            return serde_json::from_slice::<serde::de::IgnoredAny>(b)
                .map(|_| b.clone())
                .map_err(PubSubError::codec);
        }
    };
    encoded.map(Bytes::from).map_err(PubSubError::codec)
}

/// Разбирает входящую нагрузку в `Json`. `Json` проходит без изменений.
pub fn decode_json(payload: MessagePayload) -> Result<MessagePayload, PubSubError> {
    let value = match payload {
        MessagePayload::Json(_) => return Ok(payload),
        MessagePayload::Bytes(b) => serde_json::from_slice(&b),
        MessagePayload::String(s) => serde_json::from_str(&s),
    };
    value.map(MessagePayload::Json).map_err(PubSubError::codec)
}

/// Декоратор JSON-кодека.
///
/// Ошибка разбора одного входящего сообщения не закрывает цепочку: эта
/// доставка отбрасывается и рассылается `Event::Error(Codec)`.
pub struct JsonCodecAdapter {
    inner: Box<dyn PubSub>,
    lifecycle: Lifecycle,
}

impl JsonCodecAdapter {
    pub fn new(inner: Box<dyn PubSub>) -> Self {
        let lifecycle = Lifecycle::new();
        forward_events(inner.events(), lifecycle.sender(), forward_async_only);
        lifecycle.mark_ready();
        Self { inner, lifecycle }
    }

    pub fn inner(&self) -> &dyn PubSub {
        self.inner.as_ref()
    }
}

#[async_trait]
impl PubSub for JsonCodecAdapter {
    async fn publish(
        &self,
        topic: &str,
        payload: MessagePayload,
        options: PublishOptions,
    ) -> Result<(), PubSubError> {
        self.lifecycle.ensure_open()?;
        let bytes = encode_json(&payload)?;
        self.inner
            .publish(topic, MessagePayload::Bytes(bytes), options)
            .await
    }

    async fn subscribe(
        &self,
        pattern: &str,
        listener: Listener,
    ) -> Result<(), PubSubError> {
        self.lifecycle.ensure_open()?;

        let events = self.lifecycle.sender();
        let wrapped = listener.filter_map(move |mut msg| match decode_json(msg.payload) {
            Ok(payload) => {
                msg.payload = payload;
                Some(msg)
            }
            Err(err) => {
                warn!(topic = %msg.topic, error = %err, "Dropping undecodable delivery");
                let _ = events.send(Event::Error(err));
                None
            }
        });
        self.inner.subscribe(pattern, wrapped).await
    }

    async fn unsubscribe(
        &self,
        pattern: &str,
        listener: &Listener,
    ) -> Result<(), PubSubError> {
        self.lifecycle.ensure_open()?;
        self.inner.unsubscribe(pattern, listener).await
    }

    async fn close(&self) -> Result<(), PubSubError> {
        if !self.lifecycle.begin_close().await {
            return Ok(());
        }
        let result = self.inner.close().await;
        self.lifecycle.finish_close();
        result
    }

    fn events(&self) -> broadcast::Receiver<Event> {
        self.lifecycle.subscribe()
    }

    fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::leaf::MemoryPubSub;

    fn codec() -> JsonCodecAdapter {
        JsonCodecAdapter::new(Box::new(MemoryPubSub::default()))
    }

    /// Тест проверяет кодирование каждого вида нагрузки.
    #[test]
    fn test_encode_json() {
        let cases = [
            (MessagePayload::Json(json!({"a": 1})), &b"{\"a\":1}"[..]),
            (MessagePayload::String("hi".into()), &b"\"hi\""[..]),
            (MessagePayload::Bytes(Bytes::from_static(b"[1,2]")), &b"[1,2]"[..]),
        ];
        for (payload, expected) in cases {
            assert_eq!(&encode_json(&payload).unwrap()[..], expected);
        }

        let err = encode_json(&MessagePayload::Bytes(Bytes::from_static(b"{oops"))).unwrap_err();
        assert!(matches!(err, PubSubError::Codec { .. }));
    }

    /// Тест проверяет, что два вложенных кодека прозрачны друг для друга.
    #[tokio::test]
    async fn test_nested_codecs_are_symmetric() {
        let bus = JsonCodecAdapter::new(Box::new(codec()));
        let (listener, mut rx) = Listener::channel();
        bus.subscribe("t", listener).await.unwrap();

        bus.publish("t", json!({"n": [1, 2]}).into(), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap().payload,
            MessagePayload::Json(json!({"n": [1, 2]}))
        );
    }

    /// Тест проверяет, что слушатель получает декодированный JSON.
    #[tokio::test]
    async fn test_json_round_trip() {
        let bus = codec();
        let (listener, mut rx) = Listener::channel();
        bus.subscribe("t", listener).await.unwrap();

        bus.publish("t", json!({"n": 42}).into(), PublishOptions::default())
            .await
            .unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload, MessagePayload::Json(json!({"n": 42})));
    }

    /// Тест проверяет, что ошибка разбора затрагивает только одно сообщение.
    #[tokio::test]
    async fn test_decode_error_is_scoped() {
        let bus = codec();
        let mut events = bus.events();
        let (listener, mut rx) = Listener::channel();
        bus.subscribe("t", listener).await.unwrap();

        // В обход кодека: сырые байты, не являющиеся JSON.
        bus.inner()
            .publish("t", b"not json".as_slice().into(), PublishOptions::default())
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
        loop {
            match events.recv().await.unwrap() {
                Event::Error(err) => {
                    assert!(matches!(err, PubSubError::Codec { .. }));
                    break;
                }
                Event::NewTopic(_) => continue,
                other => panic!("unexpected event: {other:?}"),
            }
        }

        // Цепочка остаётся рабочей.
        assert!(!bus.is_closed());
        bus.publish("t", "ok".into(), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap().payload,
            MessagePayload::Json(json!("ok"))
        );
    }
}
