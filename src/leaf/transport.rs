use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::{
    pubsub::{
        Event, Lifecycle, Listener, ListenerId, Message, MessagePayload, PubSub, PublishOptions,
    },
    topic::{SubscriptionCounter, TopicSyntax, TopicTrie},
    PubSubError,
};

/// Нативный клиент транспорта (Redis, MQTT, AMQP, in-process брокер...).
///
/// Видит только канонические шаблоны; перевод в диалект wildcard-ов
/// конкретного сервера делает сама реализация. Входящие сообщения
/// передаются через [`DeliverySink`], полученный в `connect`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Имя транспорта для логов и ошибок.
    fn name(&self) -> &str;

    async fn connect(
        &self,
        sink: DeliverySink,
    ) -> Result<(), PubSubError>;

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<(), PubSubError>;

    async fn unsubscribe(
        &self,
        pattern: &str,
    ) -> Result<(), PubSubError>;

    async fn publish(
        &self,
        topic: &str,
        payload: MessagePayload,
        options: &PublishOptions,
    ) -> Result<(), PubSubError>;

    async fn close(&self) -> Result<(), PubSubError>;
}

/// Результат upstream-подписки; `None`, пока транспорт не ответил.
type Outcome = Option<Result<(), PubSubError>>;

/// Upstream-подписка в полёте: переход 0→1 уже учтён локально, а
/// транспорт ещё не ответил.
struct Pending {
    id: u64,
    /// Слушатели, зарегистрированные после перехода 0→1.
    listeners: Vec<ListenerId>,
    outcome: watch::Receiver<Outcome>,
}

struct LeafState {
    trie: TopicTrie<Listener>,
    counter: SubscriptionCounter,
    pending: HashMap<String, Pending>,
    next_pending: u64,
}

impl LeafState {
    /// Снимает ожидание шаблона, если оно всё ещё принадлежит `id`. При
    /// неудаче откатывает всех слушателей, пришедших после перехода 0→1.
    /// Возвращает число снятых слушателей.
    fn settle(
        &mut self,
        pattern: &str,
        id: u64,
        failed: bool,
    ) -> usize {
        if self.pending.get(pattern).map(|p| p.id) != Some(id) {
            return 0;
        }
        let Some(pending) = self.pending.remove(pattern) else {
            return 0;
        };
        if !failed {
            return 0;
        }

        let mut dropped = 0;
        for listener in pending.listeners {
            if let Ok(Some(_)) = self.trie.remove(pattern, |l| l.id() == listener) {
                self.counter.remove(pattern);
                dropped += 1;
            }
        }
        dropped
    }
}

struct Shared {
    state: Mutex<LeafState>,
    lifecycle: Lifecycle,
}

/// Что делать подписчику после локальной регистрации.
enum Admission {
    /// Переход 0→1: вызвать транспорт.
    Upstream(PendingGuard),
    /// Upstream-вызов другого подписчика ещё в полёте.
    Wait(watch::Receiver<Outcome>),
    /// Upstream-подписка уже есть.
    Ready,
}

/// Владелец незавершённой upstream-подписки.
///
/// Если future подписки сброшен до ответа транспорта, `Drop` откатывает
/// локальное состояние и будит ожидающих ошибкой.
struct PendingGuard {
    shared: Arc<Shared>,
    transport: String,
    pattern: String,
    id: u64,
    outcome: Option<watch::Sender<Outcome>>,
}

impl PendingGuard {
    fn resolve(
        mut self,
        result: Result<(), PubSubError>,
    ) {
        if let Some(outcome) = self.outcome.take() {
            self.finish(&outcome, result);
        }
    }

    fn finish(
        &self,
        outcome: &watch::Sender<Outcome>,
        result: Result<(), PubSubError>,
    ) {
        let dropped = self
            .shared
            .state
            .lock()
            .settle(&self.pattern, self.id, result.is_err());
        if dropped > 0 {
            debug!(
                transport = %self.transport,
                pattern = %self.pattern,
                dropped,
                "Rolled back listeners of failed upstream subscribe"
            );
        }
        outcome.send_replace(Some(result));
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Some(outcome) = self.outcome.take() {
            warn!(transport = %self.transport, pattern = %self.pattern, "Upstream subscribe cancelled");
            let err = PubSubError::transport(self.transport.as_str(), "upstream subscribe cancelled");
            self.finish(&outcome, Err(err));
        }
    }
}

/// Точка входа входящих сообщений от транспорта в лист.
///
/// Держит слабую ссылку: после сброса листа доставки молча игнорируются.
#[derive(Clone)]
pub struct DeliverySink {
    shared: Weak<Shared>,
}

impl DeliverySink {
    /// Доставляет сообщение всем локальным слушателям, чьи шаблоны
    /// совпали с топиком.
    pub fn deliver(
        &self,
        topic: &str,
        payload: MessagePayload,
        options: PublishOptions,
    ) {
        self.dispatch(topic, payload, options, |trie| {
            trie.matches(topic)
                .map(|found| found.into_iter().cloned().collect())
        });
    }

    /// Доставляет сообщение только слушателям шаблона `pattern`.
    ///
    /// Для транспортов, которые сообщают, по какой подписке пришло
    /// сообщение: пересекающиеся шаблоны одного листа не получают копию
    /// от каждой подписки.
    pub fn deliver_to(
        &self,
        pattern: &str,
        topic: &str,
        payload: MessagePayload,
        options: PublishOptions,
    ) {
        self.dispatch(topic, payload, options, |trie| {
            trie.syntax().validate_topic(topic)?;
            Ok(trie.get(pattern).into_iter().cloned().collect())
        });
    }

    fn dispatch<F>(
        &self,
        topic: &str,
        payload: MessagePayload,
        options: PublishOptions,
        select: F,
    ) where
        F: FnOnce(&TopicTrie<Listener>) -> Result<Vec<Listener>, PubSubError>,
    {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if shared.lifecycle.is_closed() {
            return;
        }

        let matched = select(&shared.state.lock().trie);
        let listeners = match matched {
            Ok(listeners) => listeners,
            Err(err) => {
                warn!(topic, error = %err, "Dropping delivery with invalid topic");
                shared.lifecycle.emit(Event::Error(err));
                return;
            }
        };

        let message = Message {
            topic: topic.to_string(),
            payload,
            options,
        };
        for listener in listeners {
            listener.call(message.clone());
        }
    }

    /// Sink, не привязанный ни к одному листу: все доставки отбрасываются.
    pub fn detached() -> Self {
        Self {
            shared: Weak::new(),
        }
    }

    /// Сообщает об асинхронной ошибке транспорта.
    pub fn error(
        &self,
        err: PubSubError,
    ) {
        if let Some(shared) = self.shared.upgrade() {
            shared.lifecycle.emit(Event::Error(err));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared
            .upgrade()
            .map_or(true, |shared| shared.lifecycle.is_closed())
    }
}

/// Лист поверх нативного транспорта.
///
/// Локальное дерево шаблонов плюс счётчик подписок: upstream-подписка
/// выполняется только на переходе 0→1, upstream-отписка только на 1→0.
/// Подписчики, пришедшие пока upstream-вызов 0→1 ещё в полёте, ждут его
/// результата и разделяют его ошибку.
pub struct TransportLeaf<T: Transport> {
    transport: T,
    shared: Arc<Shared>,
}

impl<T: Transport> TransportLeaf<T> {
    /// Подключает транспорт и возвращает готовый лист.
    pub async fn connect(
        transport: T,
        syntax: TopicSyntax,
    ) -> Result<Self, PubSubError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(LeafState {
                trie: TopicTrie::new(syntax),
                counter: SubscriptionCounter::new(),
                pending: HashMap::new(),
                next_pending: 0,
            }),
            lifecycle: Lifecycle::new(),
        });

        transport
            .connect(DeliverySink {
                shared: Arc::downgrade(&shared),
            })
            .await?;

        info!(transport = transport.name(), "Transport connected");
        shared.lifecycle.mark_ready();
        Ok(Self { transport, shared })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Число локальных слушателей шаблона.
    pub fn local_count(
        &self,
        pattern: &str,
    ) -> usize {
        self.shared.state.lock().counter.count(pattern)
    }

    /// Регистрирует слушателя локально и решает, нужен ли вызов транспорта.
    fn admit(
        &self,
        pattern: &str,
        listener: Listener,
    ) -> Result<Admission, PubSubError> {
        let id = listener.id();
        let mut state = self.shared.state.lock();
        state.trie.insert(pattern, listener)?;

        if state.counter.add(pattern) {
            let pending_id = state.next_pending;
            state.next_pending += 1;
            let (tx, rx) = watch::channel(None);
            state.pending.insert(
                pattern.to_string(),
                Pending {
                    id: pending_id,
                    listeners: vec![id],
                    outcome: rx,
                },
            );
            return Ok(Admission::Upstream(PendingGuard {
                shared: self.shared.clone(),
                transport: self.transport.name().to_string(),
                pattern: pattern.to_string(),
                id: pending_id,
                outcome: Some(tx),
            }));
        }

        Ok(match state.pending.get_mut(pattern) {
            Some(pending) => {
                pending.listeners.push(id);
                Admission::Wait(pending.outcome.clone())
            }
            None => Admission::Ready,
        })
    }
}

#[async_trait]
impl<T: Transport> PubSub for TransportLeaf<T> {
    async fn publish(
        &self,
        topic: &str,
        payload: MessagePayload,
        options: PublishOptions,
    ) -> Result<(), PubSubError> {
        self.shared.lifecycle.ensure_open()?;
        self.shared.state.lock().trie.syntax().validate_topic(topic)?;

        // Локальные слушатели получат сообщение через петлю транспорта.
        self.transport.publish(topic, payload, &options).await
    }

    async fn subscribe(
        &self,
        pattern: &str,
        listener: Listener,
    ) -> Result<(), PubSubError> {
        self.shared.lifecycle.ensure_open()?;

        let id = listener.id();
        match self.admit(pattern, listener)? {
            Admission::Ready => {
                debug!(transport = self.transport.name(), pattern, %id, "Subscribed");
                Ok(())
            }
            Admission::Wait(mut outcome) => {
                debug!(transport = self.transport.name(), pattern, %id, "Waiting for upstream subscribe");
                match outcome.wait_for(Option::is_some).await {
                    Ok(result) => result.clone().unwrap_or(Ok(())),
                    Err(_) => Err(PubSubError::transport(
                        self.transport.name(),
                        "upstream subscribe abandoned",
                    )),
                }
            }
            Admission::Upstream(guard) => {
                let result = self.transport.subscribe(pattern).await;
                if let Err(err) = &result {
                    warn!(transport = self.transport.name(), pattern, error = %err, "Upstream subscribe failed");
                }
                guard.resolve(result.clone());
                result?;

                debug!(transport = self.transport.name(), pattern, %id, "Subscribed upstream");
                self.shared
                    .lifecycle
                    .emit(Event::NewTopic(pattern.to_string()));
                Ok(())
            }
        }
    }

    async fn unsubscribe(
        &self,
        pattern: &str,
        listener: &Listener,
    ) -> Result<(), PubSubError> {
        self.shared.lifecycle.ensure_open()?;

        let last = {
            let mut state = self.shared.state.lock();
            if state.trie.remove(pattern, |l| l == listener)?.is_none() {
                debug!(pattern, id = %listener.id(), "Listener not registered");
                return Ok(());
            }
            let last = state.counter.remove(pattern);
            if last {
                // Следующий подписчик снова пойдёт в транспорт.
                state.pending.remove(pattern);
            }
            last
        };
        debug!(transport = self.transport.name(), pattern, id = %listener.id(), last, "Unsubscribed");

        if last {
            self.transport.unsubscribe(pattern).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), PubSubError> {
        if !self.shared.lifecycle.begin_close().await {
            return Ok(());
        }

        {
            let mut state = self.shared.state.lock();
            state.trie.clear();
            state.counter.clear();
            state.pending.clear();
        }

        let result = self.transport.close().await;
        if let Err(err) = &result {
            warn!(transport = self.transport.name(), error = %err, "Transport close failed");
        }
        info!(transport = self.transport.name(), "Transport leaf closed");
        self.shared.lifecycle.finish_close();
        result
    }

    fn events(&self) -> broadcast::Receiver<Event> {
        self.shared.lifecycle.subscribe()
    }

    fn is_closed(&self) -> bool {
        self.shared.lifecycle.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use futures::FutureExt;

    use super::*;

    /// Транспорт-петля: публикация сразу возвращается в sink, успешные
    /// подписки записываются. Подписка уступает планировщику один раз,
    /// чтобы параллельные подписчики успели зарегистрироваться.
    #[derive(Default)]
    struct Loopback {
        sink: Mutex<Option<DeliverySink>>,
        calls: Mutex<Vec<String>>,
        fail_subscribe: AtomicBool,
    }

    #[async_trait]
    impl Transport for Loopback {
        fn name(&self) -> &str {
            "loopback"
        }

        async fn connect(
            &self,
            sink: DeliverySink,
        ) -> Result<(), PubSubError> {
            *self.sink.lock() = Some(sink);
            Ok(())
        }

        async fn subscribe(
            &self,
            pattern: &str,
        ) -> Result<(), PubSubError> {
            tokio::task::yield_now().await;
            if self.fail_subscribe.load(Ordering::SeqCst) {
                return Err(PubSubError::transport("loopback", "refused"));
            }
            self.calls.lock().push(format!("sub {pattern}"));
            Ok(())
        }

        async fn unsubscribe(
            &self,
            pattern: &str,
        ) -> Result<(), PubSubError> {
            self.calls.lock().push(format!("unsub {pattern}"));
            Ok(())
        }

        async fn publish(
            &self,
            topic: &str,
            payload: MessagePayload,
            options: &PublishOptions,
        ) -> Result<(), PubSubError> {
            let sink = self.sink.lock().clone();
            if let Some(sink) = sink {
                sink.deliver(topic, payload, options.clone());
            }
            Ok(())
        }

        async fn close(&self) -> Result<(), PubSubError> {
            self.calls.lock().push("close".to_string());
            Ok(())
        }
    }

    async fn leaf() -> TransportLeaf<Loopback> {
        TransportLeaf::connect(Loopback::default(), TopicSyntax::default())
            .await
            .unwrap()
    }

    /// Тест проверяет, что upstream-вызовы выполняются только на
    /// переходах 0→1 и 1→0.
    #[tokio::test]
    async fn test_upstream_dedup() {
        let leaf = leaf().await;
        let a = Listener::new(|_| {});
        let b = Listener::new(|_| {});

        leaf.subscribe("x/+", a.clone()).await.unwrap();
        leaf.subscribe("x/+", b.clone()).await.unwrap();
        assert_eq!(leaf.local_count("x/+"), 2);

        leaf.unsubscribe("x/+", &a).await.unwrap();
        // Повторная отписка того же слушателя ничего не меняет.
        leaf.unsubscribe("x/+", &a).await.unwrap();
        assert_eq!(leaf.local_count("x/+"), 1);
        leaf.unsubscribe("x/+", &b).await.unwrap();

        assert_eq!(
            *leaf.transport().calls.lock(),
            vec!["sub x/+".to_string(), "unsub x/+".to_string()]
        );
    }

    /// Тест проверяет доставку через петлю транспорта.
    #[tokio::test]
    async fn test_loopback_delivery() {
        let leaf = leaf().await;
        let (listener, mut rx) = Listener::channel();
        leaf.subscribe("a/#", listener).await.unwrap();

        leaf.publish("a/b/c", "x".into(), PublishOptions::default())
            .await
            .unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "a/b/c");
        assert_eq!(msg.payload, MessagePayload::String("x".into()));
    }

    /// Тест проверяет, что доставка по подписке не задевает пересекающиеся
    /// шаблоны.
    #[tokio::test]
    async fn test_deliver_to_single_subscription() {
        let leaf = leaf().await;
        let sink = leaf.transport().sink.lock().clone().unwrap();
        let (wide, mut wide_rx) = Listener::channel();
        let (narrow, mut narrow_rx) = Listener::channel();
        leaf.subscribe("a/#", wide).await.unwrap();
        leaf.subscribe("a/+", narrow).await.unwrap();

        sink.deliver_to("a/+", "a/b", "x".into(), PublishOptions::default());
        assert_eq!(narrow_rx.try_recv().unwrap().topic, "a/b");
        assert!(wide_rx.try_recv().is_err());

        sink.deliver("a/b", "y".into(), PublishOptions::default());
        assert!(narrow_rx.try_recv().is_ok());
        assert!(wide_rx.try_recv().is_ok());
    }

    /// Тест проверяет откат локальной регистрации при ошибке upstream.
    #[tokio::test]
    async fn test_subscribe_rollback() {
        let leaf = leaf().await;
        leaf.transport().fail_subscribe.store(true, Ordering::SeqCst);

        let err = leaf
            .subscribe("a", Listener::new(|_| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, PubSubError::Transport { .. }));
        assert_eq!(leaf.local_count("a"), 0);

        // Следующая попытка снова идёт в транспорт.
        leaf.transport().fail_subscribe.store(false, Ordering::SeqCst);
        leaf.subscribe("a", Listener::new(|_| {})).await.unwrap();
        assert_eq!(*leaf.transport().calls.lock(), vec!["sub a".to_string()]);
    }

    /// Тест проверяет, что подписчик, пришедший во время неудачного
    /// upstream-вызова, получает ту же ошибку и тоже откатывается, а
    /// следующая подписка снова идёт в транспорт.
    #[tokio::test]
    async fn test_concurrent_subscribe_shares_upstream_failure() {
        let leaf = leaf().await;
        leaf.transport().fail_subscribe.store(true, Ordering::SeqCst);

        let (first, second) = tokio::join!(
            leaf.subscribe("t", Listener::new(|_| {})),
            leaf.subscribe("t", Listener::new(|_| {})),
        );
        assert!(matches!(first, Err(PubSubError::Transport { .. })));
        assert_eq!(second, first);
        assert_eq!(leaf.local_count("t"), 0);
        assert!(leaf.transport().calls.lock().is_empty());

        leaf.transport().fail_subscribe.store(false, Ordering::SeqCst);
        let (listener, mut rx) = Listener::channel();
        leaf.subscribe("t", listener).await.unwrap();
        assert_eq!(leaf.local_count("t"), 1);
        assert_eq!(*leaf.transport().calls.lock(), vec!["sub t".to_string()]);

        leaf.publish("t", "x".into(), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().topic, "t");
    }

    /// Тест проверяет, что параллельные подписчики дожидаются единственного
    /// успешного upstream-вызова, а `NewTopic` приходит один раз.
    #[tokio::test]
    async fn test_concurrent_subscribe_waits_for_upstream() {
        let leaf = leaf().await;
        let mut events = leaf.events();

        let (first, second) = tokio::join!(
            leaf.subscribe("t/+", Listener::new(|_| {})),
            leaf.subscribe("t/+", Listener::new(|_| {})),
        );
        first.unwrap();
        second.unwrap();
        assert_eq!(leaf.local_count("t/+"), 2);
        assert_eq!(*leaf.transport().calls.lock(), vec!["sub t/+".to_string()]);
        assert_eq!(events.recv().await.unwrap(), Event::NewTopic("t/+".into()));
        assert!(events.try_recv().is_err());
    }

    /// Тест проверяет, что сброшенный до ответа транспорта future подписки
    /// не оставляет локальной регистрации.
    #[tokio::test]
    async fn test_cancelled_subscribe_rolls_back() {
        let leaf = leaf().await;

        assert!(leaf
            .subscribe("c", Listener::new(|_| {}))
            .now_or_never()
            .is_none());
        assert_eq!(leaf.local_count("c"), 0);

        leaf.subscribe("c", Listener::new(|_| {})).await.unwrap();
        assert_eq!(*leaf.transport().calls.lock(), vec!["sub c".to_string()]);
    }

    /// Тест проверяет закрытие: транспорт закрывается один раз, доставки
    /// после закрытия игнорируются.
    #[tokio::test]
    async fn test_close() {
        let leaf = leaf().await;
        let sink = leaf.transport().sink.lock().clone().unwrap();
        let (listener, mut rx) = Listener::channel();
        leaf.subscribe("t", listener).await.unwrap();

        leaf.close().await.unwrap();
        leaf.close().await.unwrap();
        assert!(sink.is_closed());

        sink.deliver("t", "late".into(), PublishOptions::default());
        assert!(rx.try_recv().is_err());
        assert_eq!(
            leaf.transport().calls.lock().iter().filter(|c| *c == "close").count(),
            1
        );
        assert_eq!(
            leaf.publish("t", "x".into(), PublishOptions::default()).await,
            Err(PubSubError::Closed)
        );
    }

    /// Тест проверяет, что некорректный входящий топик превращается в
    /// событие ошибки.
    #[tokio::test]
    async fn test_invalid_inbound_topic() {
        let leaf = leaf().await;
        let mut events = leaf.events();
        let sink = leaf.transport().sink.lock().clone().unwrap();

        sink.deliver("", "x".into(), PublishOptions::default());
        assert!(matches!(
            events.recv().await.unwrap(),
            Event::Error(PubSubError::Validation { .. })
        ));
    }
}
