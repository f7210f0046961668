use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use globset::{Glob, GlobBuilder, GlobMatcher};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, warn};

use super::{DeliverySink, Transport};
use crate::{
    pubsub::{MessagePayload, PublishOptions},
    topic::{Segment, TopicSyntax},
    PubSubError,
};

/// Ёмкость буфера канала брокера по умолчанию.
pub const DEFAULT_BROKER_CAPACITY: usize = 128;

/// Разделитель сегментов на стороне брокера.
const WIRE_SEPARATOR: &str = "/";

/// Сообщение внутри брокера.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
}

struct PatternChannel {
    matcher: GlobMatcher,
    tx: broadcast::Sender<BrokerMessage>,
}

/// Внутрипроцессный брокер сообщений.
///
/// Ведёт себя как сетевой сервер, общий для нескольких независимо
/// собранных цепочек. Поддерживает:
/// - точные подписки по имени топика;
/// - подписки по glob-шаблонам;
/// - автоматическое удаление каналов без получателей;
/// - статистику публикаций и ошибок отправки.
pub struct Broker {
    /// Точные топики → `Sender`
    channels: DashMap<Arc<str>, broadcast::Sender<BrokerMessage>>,
    /// Шаблоны → скомпилированный матчер и `Sender`
    patterns: DashMap<Glob, PatternChannel>,
    /// Ёмкость буфера каждого `broadcast::channel`
    capacity: usize,
    /// Общее количество вызовов `publish`
    pub publish_count: AtomicUsize,
    /// Количество неудачных `send` (нет получателей)
    pub send_error_count: AtomicUsize,
}

impl Broker {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            patterns: DashMap::new(),
            capacity,
            publish_count: AtomicUsize::new(0),
            send_error_count: AtomicUsize::new(0),
        }
    }

    /// Подписка на конкретный топик (точное совпадение).
    pub fn subscribe(
        &self,
        topic: &str,
    ) -> broadcast::Receiver<BrokerMessage> {
        self.channels
            .entry(Arc::from(topic))
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Подписка по glob-шаблону.
    ///
    /// Повторная подписка на тот же шаблон получит тот же `Sender`.
    pub fn psubscribe(
        &self,
        glob: Glob,
    ) -> broadcast::Receiver<BrokerMessage> {
        self.patterns
            .entry(glob.clone())
            .or_insert_with(|| PatternChannel {
                matcher: glob.compile_matcher(),
                tx: broadcast::channel(self.capacity).0,
            })
            .tx
            .subscribe()
    }

    /// Публикует сообщение: сначала в точный канал, затем во все
    /// совпавшие шаблоны. Возвращает число получателей.
    ///
    /// Каналы, у которых не осталось получателей, удаляются.
    pub fn publish(
        &self,
        topic: &str,
        payload: Bytes,
    ) -> usize {
        self.publish_count.fetch_add(1, Ordering::Relaxed);
        let topic: Arc<str> = Arc::from(topic);
        let msg = BrokerMessage {
            topic: topic.clone(),
            payload,
        };
        let mut delivered = 0;

        // 1) точное совпадение
        let exact = self.channels.get(&*topic).map(|tx| tx.clone());
        if let Some(tx) = exact {
            match tx.send(msg.clone()) {
                Ok(n) => delivered += n,
                Err(_) => {
                    self.send_error_count.fetch_add(1, Ordering::Relaxed);
                    self.channels.remove_if(&*topic, |_, tx| tx.receiver_count() == 0);
                }
            }
        }

        // 2) по шаблону
        let mut stale = Vec::new();
        for entry in self.patterns.iter() {
            if !entry.matcher.is_match(&*topic) {
                continue;
            }
            match entry.tx.send(msg.clone()) {
                Ok(n) => delivered += n,
                Err(_) => stale.push(entry.key().clone()),
            }
        }
        for glob in stale {
            self.send_error_count.fetch_add(1, Ordering::Relaxed);
            self.patterns
                .remove_if(&glob, |_, ch| ch.tx.receiver_count() == 0);
        }

        delivered
    }

    /// Число активных точных каналов и шаблонов.
    pub fn channel_count(&self) -> usize {
        self.channels.len() + self.patterns.len()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(DEFAULT_BROKER_CAPACITY)
    }
}

/// Транспорт поверх [`Broker`].
///
/// Переводит канонические шаблоны в glob-диалект брокера:
/// - одноуровневый wildcard → `*` (не пересекает разделитель);
/// - хвостовой многоуровневый wildcard `p/#` → `{p,p/**}`;
/// - литеральные сегменты экранируются.
///
/// Для каждой upstream-подписки запускается задача пересылки, которая
/// отменяется при отписке и закрытии.
pub struct BrokerTransport {
    broker: Arc<Broker>,
    syntax: TopicSyntax,
    sink: parking_lot::Mutex<Option<DeliverySink>>,
    tasks: DashMap<String, JoinHandle<()>>,
}

impl BrokerTransport {
    pub fn new(
        broker: Arc<Broker>,
        syntax: TopicSyntax,
    ) -> Self {
        Self {
            broker,
            syntax,
            sink: parking_lot::Mutex::new(None),
            tasks: DashMap::new(),
        }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Число активных upstream-подписок.
    pub fn active_subscriptions(&self) -> usize {
        self.tasks.len()
    }

    /// Топик в формате брокера.
    fn to_wire(
        &self,
        topic: &str,
    ) -> String {
        self.syntax
            .split(topic)
            .collect::<Vec<_>>()
            .join(WIRE_SEPARATOR)
    }

    /// Переводит канонический шаблон в glob брокера.
    pub fn translate_pattern(
        &self,
        pattern: &str,
    ) -> Result<Glob, PubSubError> {
        let segments = self.syntax.parse_pattern(pattern)?;
        let mut parts: Vec<String> = Vec::with_capacity(segments.len());
        let mut multi = false;

        for segment in segments {
            match segment {
                Segment::Literal(lit) => {
                    // Запятая внутри `{..}` разделяет альтернативы.
                    parts.push(globset::escape(lit).replace(',', "[,]"))
                }
                Segment::Single => parts.push("*".to_string()),
                Segment::Multi => multi = true,
            }
        }

        let prefix = parts.join(WIRE_SEPARATOR);
        let glob = match (multi, prefix.is_empty()) {
            (false, _) => prefix,
            (true, true) => "**".to_string(),
            (true, false) => format!("{{{prefix},{prefix}{WIRE_SEPARATOR}**}}"),
        };

        GlobBuilder::new(&glob)
            .literal_separator(true)
            .build()
            .map_err(|e| PubSubError::validation(pattern, e.to_string()))
    }

    fn encode(payload: MessagePayload) -> Result<Bytes, PubSubError> {
        match payload {
            MessagePayload::Bytes(b) => Ok(b),
            MessagePayload::String(s) => Ok(Bytes::from(s)),
            MessagePayload::Json(v) => serde_json::to_vec(&v)
                .map(Bytes::from)
                .map_err(PubSubError::codec),
        }
    }
}

/// Топик брокера в каноническом формате.
fn from_wire(
    topic: &str,
    separator: &str,
) -> String {
    topic.split(WIRE_SEPARATOR).collect::<Vec<_>>().join(separator)
}

#[async_trait]
impl Transport for BrokerTransport {
    fn name(&self) -> &str {
        "broker"
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
        let sink = self
            .sink
            .lock()
            .clone()
            .ok_or_else(|| PubSubError::transport("broker", "not connected"))?;

        let mut rx = if self.syntax.has_wildcards(pattern) {
            let glob = self.translate_pattern(pattern)?;
            debug!(pattern, glob = glob.glob(), "Broker pattern subscription");
            self.broker.psubscribe(glob)
        } else {
            self.broker.subscribe(&self.to_wire(pattern))
        };

        let separator = self.syntax.separator.clone();
        let subscription = pattern.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        let topic = from_wire(&msg.topic, &separator);
                        // Каждая подписка брокера кормит только свой шаблон.
                        sink.deliver_to(
                            &subscription,
                            &topic,
                            MessagePayload::Bytes(msg.payload),
                            PublishOptions::default(),
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Broker subscriber lagged");
                        sink.error(PubSubError::transport(
                            "broker",
                            format!("subscriber lagged by {n} messages"),
                        ));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.tasks.insert(pattern.to_string(), handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe(
        &self,
        pattern: &str,
    ) -> Result<(), PubSubError> {
        if let Some((_, handle)) = self.tasks.remove(pattern) {
            handle.abort();
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: MessagePayload,
        _options: &PublishOptions,
    ) -> Result<(), PubSubError> {
        let bytes = Self::encode(payload)?;
        let delivered = self.broker.publish(&self.to_wire(topic), bytes);
        debug!(topic, delivered, "Published to broker");
        Ok(())
    }

    async fn close(&self) -> Result<(), PubSubError> {
        self.tasks.retain(|_, handle| {
            handle.abort();
            false
        });
        self.sink.lock().take();
        Ok(())
    }
}
