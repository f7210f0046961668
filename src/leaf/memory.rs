use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    pubsub::{Event, Lifecycle, Listener, Message, MessagePayload, PubSub, PublishOptions},
    topic::{TopicSyntax, TopicTrie},
    PubSubError,
};

/// Внутрипроцессная шина на дереве шаблонов.
///
/// Лист по умолчанию (`type = "memory"`, он же `"trie"`) и catch-all
/// фильтра. Публикация синхронно доставляется всем совпавшим слушателям;
/// колбэки вызываются после освобождения блокировки.
pub struct MemoryPubSub {
    trie: Mutex<TopicTrie<Listener>>,
    lifecycle: Lifecycle,
}

impl MemoryPubSub {
    pub fn new(syntax: TopicSyntax) -> Self {
        let lifecycle = Lifecycle::new();
        lifecycle.mark_ready();
        Self {
            trie: Mutex::new(TopicTrie::new(syntax)),
            lifecycle,
        }
    }

    /// Количество активных регистраций.
    pub fn listener_count(&self) -> usize {
        self.trie.lock().len()
    }

    pub fn patterns(&self) -> Vec<String> {
        self.trie.lock().patterns()
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new(TopicSyntax::default())
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(
        &self,
        topic: &str,
        payload: MessagePayload,
        options: PublishOptions,
    ) -> Result<(), PubSubError> {
        self.lifecycle.ensure_open()?;

        let listeners: Vec<Listener> = {
            let trie = self.trie.lock();
            trie.matches(topic)?.into_iter().cloned().collect()
        };

        let message = Message {
            topic: topic.to_string(),
            payload,
            options,
        };
        for listener in listeners {
            listener.call(message.clone());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
        listener: Listener,
    ) -> Result<(), PubSubError> {
        self.lifecycle.ensure_open()?;

        let id = listener.id();
        let is_new = {
            let mut trie = self.trie.lock();
            let is_new = !trie.contains(pattern);
            trie.insert(pattern, listener)?;
            is_new
        };

        debug!(pattern, %id, "Subscribed");
        if is_new {
            self.lifecycle.emit(Event::NewTopic(pattern.to_string()));
        }
        Ok(())
    }

    async fn unsubscribe(
        &self,
        pattern: &str,
        listener: &Listener,
    ) -> Result<(), PubSubError> {
        self.lifecycle.ensure_open()?;

        let removed = self.trie.lock().remove(pattern, |l| l == listener)?;
        debug!(pattern, id = %listener.id(), removed = removed.is_some(), "Unsubscribed");
        Ok(())
    }

    async fn close(&self) -> Result<(), PubSubError> {
        if !self.lifecycle.begin_close().await {
            return Ok(());
        }
        self.trie.lock().clear();
        info!("Memory pubsub closed");
        self.lifecycle.finish_close();
        Ok(())
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
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn counting() -> (Listener, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let listener = Listener::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (listener, hits)
    }

    /// Тест проверяет доставку по точному топику и по wildcard-шаблону.
    #[tokio::test]
    async fn test_publish_delivers_to_matching() {
        let bus = MemoryPubSub::default();
        let (exact, rx_exact) = counting();
        let (wild, rx_wild) = counting();
        let (other, rx_other) = counting();

        bus.subscribe("a/b", exact).await.unwrap();
        bus.subscribe("a/#", wild).await.unwrap();
        bus.subscribe("x/+", other).await.unwrap();

        bus.publish("a/b", "hi".into(), PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(rx_exact.load(Ordering::SeqCst), 1);
        assert_eq!(rx_wild.load(Ordering::SeqCst), 1);
        assert_eq!(rx_other.load(Ordering::SeqCst), 0);
    }

    /// Тест проверяет, что опции публикации доходят до слушателя.
    #[tokio::test]
    async fn test_options_reach_listener() {
        let bus = MemoryPubSub::default();
        let (listener, mut rx) = Listener::channel();
        bus.subscribe("t", listener).await.unwrap();

        let options = PublishOptions {
            qos: Some(2),
            ..Default::default()
        };
        bus.publish("t", "x".into(), options.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().options, options);
    }

    /// Тест проверяет отписку и событие NewTopic только на первую подписку.
    #[tokio::test]
    async fn test_unsubscribe_and_new_topic() {
        let bus = MemoryPubSub::default();
        let mut events = bus.events();
        let (a, hits_a) = counting();
        let (b, hits_b) = counting();

        bus.subscribe("t/+", a.clone()).await.unwrap();
        bus.subscribe("t/+", b).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), Event::NewTopic("t/+".into()));
        assert!(events.try_recv().is_err());

        bus.unsubscribe("t/+", &a).await.unwrap();
        bus.publish("t/1", "x".into(), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(hits_a.load(Ordering::SeqCst), 0);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 1);
    }

    /// Тест проверяет ошибки валидации.
    #[tokio::test]
    async fn test_validation() {
        let bus = MemoryPubSub::default();
        let err = bus
            .publish("a/+", "x".into(), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PubSubError::Validation { .. }));

        let (listener, _) = counting();
        assert!(bus.subscribe("", listener).await.is_err());
    }

    /// Тест проверяет, что после закрытия операции возвращают Closed, а
    /// повторное закрытие идемпотентно.
    #[tokio::test]
    async fn test_close() {
        let bus = MemoryPubSub::default();
        let mut events = bus.events();
        bus.close().await.unwrap();
        bus.close().await.unwrap();

        assert_eq!(events.recv().await.unwrap(), Event::Closed);
        assert!(events.try_recv().is_err());
        assert!(bus.is_closed());

        let err = bus
            .publish("a", "x".into(), PublishOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, PubSubError::Closed);
    }
}
