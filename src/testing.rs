//! Проверки контракта [`PubSub`] для собственных транспортов и цепочек.
//!
//! Каждая проверка получает свежий экземпляр и паникует с понятным
//! сообщением, если поведение расходится с контрактом. Доставка может быть
//! асинхронной: ожидание ограничено [`DELIVERY_TIMEOUT`].
//!
//! ```ignore
//! #[tokio::test]
//! async fn my_transport_behaves_like_pubsub() {
//!     pubmux::testing::behaves_like_pubsub(|| async {
//!         Builder::new(registry()).build(&BuildConfig::new("mine")).await.unwrap()
//!     })
//!     .await;
//! }
//! ```

use std::{future::Future, time::Duration};

use serde_json::{json, Value};
use tokio::{sync::mpsc, time::timeout};

use crate::{Listener, Message, MessagePayload, PubSub, PubSubError, PublishOptions};

/// Сколько ждать одну доставку.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);
/// Сколько ждать, убеждаясь, что лишних доставок нет.
pub const QUIET_PERIOD: Duration = Duration::from_millis(50);

/// Прогоняет все проверки, создавая для каждой новый экземпляр.
pub async fn behaves_like_pubsub<F, Fut>(make: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Box<dyn PubSub>>,
{
    check_exact_delivery(make().await.as_ref()).await;
    check_wildcard_delivery(make().await.as_ref()).await;
    check_listener_dedup(make().await.as_ref()).await;
    check_unsubscribe(make().await.as_ref()).await;
    check_publish_rejects_wildcards(make().await.as_ref()).await;
    check_closed_guard(make().await.as_ref()).await;
    check_idempotent_close(make().await.as_ref()).await;
}

/// Подписка на точный топик получает опубликованное сообщение.
pub async fn check_exact_delivery(bus: &dyn PubSub) {
    let (listener, mut rx) = Listener::channel();
    ok(bus.subscribe("hello", listener).await, "subscribe hello");
    ok(publish(bus, "hello", json!("world")).await, "publish hello");

    let msg = next(&mut rx, "hello").await;
    assert_eq!(msg.topic, "hello");
    assert_eq!(decoded(&msg.payload), Some(json!("world")), "payload of hello");
    quiet(&mut rx, "hello").await;
    close(bus).await;
}

/// Одно- и многоуровневые wildcard-ы совпадают по сегментам.
pub async fn check_wildcard_delivery(bus: &dyn PubSub) {
    let (single, mut single_rx) = Listener::channel();
    let (multi, mut multi_rx) = Listener::channel();
    ok(bus.subscribe("room/+/temp", single).await, "subscribe room/+/temp");
    ok(bus.subscribe("room/#", multi).await, "subscribe room/#");

    ok(publish(bus, "room/1/temp", json!(21)).await, "publish room/1/temp");
    assert_eq!(next(&mut single_rx, "room/+/temp").await.topic, "room/1/temp");
    assert_eq!(next(&mut multi_rx, "room/#").await.topic, "room/1/temp");

    ok(publish(bus, "room/1/temp/raw", json!(1)).await, "publish room/1/temp/raw");
    assert_eq!(next(&mut multi_rx, "room/#").await.topic, "room/1/temp/raw");
    quiet(&mut single_rx, "room/+/temp").await;

    ok(publish(bus, "hall/1/temp", json!(2)).await, "publish hall/1/temp");
    quiet(&mut multi_rx, "room/#").await;
    close(bus).await;
}

/// Каждая подписка получает сообщение ровно один раз: несколько
/// слушателей одного шаблона не размножают доставку, а слушатель двух
/// пересекающихся шаблонов получает по копии на подписку.
pub async fn check_listener_dedup(bus: &dyn PubSub) {
    let (first, mut first_rx) = Listener::channel();
    let (second, mut second_rx) = Listener::channel();
    let (overlap, mut overlap_rx) = Listener::channel();
    ok(bus.subscribe("dedup/+", first).await, "subscribe dedup/+");
    ok(bus.subscribe("dedup/+", second).await, "subscribe dedup/+ again");
    ok(bus.subscribe("dedup/#", overlap.clone()).await, "subscribe dedup/#");
    ok(bus.subscribe("dedup/x", overlap).await, "subscribe dedup/x");

    ok(publish(bus, "dedup/x", json!(true)).await, "publish dedup/x");
    next(&mut first_rx, "first dedup/+").await;
    next(&mut second_rx, "second dedup/+").await;
    next(&mut overlap_rx, "dedup/#").await;
    next(&mut overlap_rx, "dedup/x").await;

    quiet(&mut first_rx, "first dedup/+").await;
    quiet(&mut second_rx, "second dedup/+").await;
    quiet(&mut overlap_rx, "overlapping listener").await;
    close(bus).await;
}

/// После отписки слушатель больше ничего не получает, остальные
/// слушатели того же шаблона продолжают получать.
pub async fn check_unsubscribe(bus: &dyn PubSub) {
    let (gone, mut gone_rx) = Listener::channel();
    let (stays, mut stays_rx) = Listener::channel();
    ok(bus.subscribe("unsub/+", gone.clone()).await, "subscribe unsub/+");
    ok(bus.subscribe("unsub/+", stays).await, "subscribe unsub/+ again");

    ok(bus.unsubscribe("unsub/+", &gone).await, "unsubscribe unsub/+");
    // Отписка незарегистрированного слушателя не ошибка.
    ok(bus.unsubscribe("unsub/+", &gone).await, "repeated unsubscribe");

    ok(publish(bus, "unsub/1", json!(1)).await, "publish unsub/1");
    next(&mut stays_rx, "remaining listener").await;
    quiet(&mut gone_rx, "unsubscribed listener").await;
    close(bus).await;
}

/// Публикация в топик с wildcard-ом отклоняется как `Validation`.
pub async fn check_publish_rejects_wildcards(bus: &dyn PubSub) {
    for topic in ["a/+", "a/#", ""] {
        let result = publish(bus, topic, json!(0)).await;
        assert!(
            matches!(result, Err(PubSubError::Validation { .. })),
            "publish to '{topic}' must fail with Validation, got {result:?}"
        );
    }
    close(bus).await;
}

/// После закрытия все операции возвращают `Closed`.
pub async fn check_closed_guard(bus: &dyn PubSub) {
    let listener = Listener::new(|_| {});
    close(bus).await;
    assert!(bus.is_closed(), "is_closed after close");

    assert_eq!(publish(bus, "t", json!(0)).await, Err(PubSubError::Closed));
    assert_eq!(
        bus.subscribe("t", listener.clone()).await,
        Err(PubSubError::Closed)
    );
    assert_eq!(
        bus.unsubscribe("t", &listener).await,
        Err(PubSubError::Closed)
    );
}

/// Повторное закрытие успешно и не рассылает второй `Closed`.
pub async fn check_idempotent_close(bus: &dyn PubSub) {
    let mut events = bus.events();
    close(bus).await;
    close(bus).await;

    let mut closed = 0;
    while let Ok(event) = events.try_recv() {
        if event == crate::Event::Closed {
            closed += 1;
        }
    }
    assert_eq!(closed, 1, "Closed must be emitted exactly once");
}

async fn publish(
    bus: &dyn PubSub,
    topic: &str,
    value: Value,
) -> Result<(), PubSubError> {
    bus.publish(topic, value.into(), PublishOptions::default())
        .await
}

async fn close(bus: &dyn PubSub) {
    ok(bus.close().await, "close");
}

fn ok(
    result: Result<(), PubSubError>,
    what: &str,
) {
    if let Err(err) = result {
        panic!("{what} failed: {err}");
    }
}

async fn next(
    rx: &mut mpsc::UnboundedReceiver<Message>,
    who: &str,
) -> Message {
    match timeout(DELIVERY_TIMEOUT, rx.recv()).await {
        Ok(Some(msg)) => msg,
        Ok(None) => panic!("{who}: listener channel closed"),
        Err(_) => panic!("{who}: no delivery within {DELIVERY_TIMEOUT:?}"),
    }
}

async fn quiet(
    rx: &mut mpsc::UnboundedReceiver<Message>,
    who: &str,
) {
    if let Ok(Some(msg)) = timeout(QUIET_PERIOD, rx.recv()).await {
        panic!("{who}: unexpected delivery on '{}'", msg.topic);
    }
}

/// Полезная нагрузка как JSON: цепочка без кодека может вернуть байты.
fn decoded(payload: &MessagePayload) -> Option<Value> {
    match payload {
        MessagePayload::Json(value) => Some(value.clone()),
        MessagePayload::String(text) => serde_json::from_str(text).ok(),
        MessagePayload::Bytes(bytes) => serde_json::from_slice(bytes).ok(),
    }
}
