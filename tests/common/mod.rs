//! Общие помощники интеграционных тестов: транспорт, записывающий все
//! вызовы, и фабрика для него.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use pubmux::{
    BuildConfig, DeliverySink, Event, LeafFactory, MessagePayload, PubSub, PubSubError,
    PublishOptions, Transport, TransportLeaf,
};
use tokio::sync::broadcast;

/// Вызов, дошедший до нативного клиента.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Connect,
    Subscribe(String),
    Unsubscribe(String),
    Publish(String, MessagePayload),
    Close,
}

/// Журнал вызовов, общий для транспорта и теста.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().clone()
    }

    pub fn count(
        &self,
        pred: impl Fn(&Call) -> bool,
    ) -> usize {
        self.0.lock().iter().filter(|c| pred(c)).count()
    }

    fn push(
        &self,
        call: Call,
    ) {
        self.0.lock().push(call);
    }
}

/// Транспорт-эхо: публикация сразу возвращается в sink, как от сервера.
pub struct RecordingTransport {
    log: CallLog,
    sink: Mutex<Option<DeliverySink>>,
    fail_connect: bool,
}

impl RecordingTransport {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            sink: Mutex::new(None),
            fail_connect: false,
        }
    }

    /// Транспорт, у которого `connect` всегда заканчивается ошибкой.
    pub fn refusing(log: CallLog) -> Self {
        Self {
            fail_connect: true,
            ..Self::new(log)
        }
    }

    /// Входящее сообщение «от сервера».
    pub fn inject(
        &self,
        topic: &str,
        payload: MessagePayload,
    ) {
        if let Some(sink) = self.sink.lock().clone() {
            sink.deliver(topic, payload, PublishOptions::default());
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    async fn connect(
        &self,
        sink: DeliverySink,
    ) -> Result<(), PubSubError> {
        self.log.push(Call::Connect);
        if self.fail_connect {
            return Err(PubSubError::transport("recording", "connection refused"));
        }
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<(), PubSubError> {
        self.log.push(Call::Subscribe(pattern.to_string()));
        Ok(())
    }

    async fn unsubscribe(
        &self,
        pattern: &str,
    ) -> Result<(), PubSubError> {
        self.log.push(Call::Unsubscribe(pattern.to_string()));
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: MessagePayload,
        options: &PublishOptions,
    ) -> Result<(), PubSubError> {
        self.log
            .push(Call::Publish(topic.to_string(), payload.clone()));
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink.deliver(topic, payload, options.clone());
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), PubSubError> {
        self.log.push(Call::Close);
        self.sink.lock().take();
        Ok(())
    }
}

/// Фабрика [`RecordingTransport`]: все листы пишут в один журнал.
#[derive(Clone, Default)]
pub struct RecordingFactory {
    pub log: CallLog,
    pub refuse: bool,
}

impl RecordingFactory {
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl LeafFactory for RecordingFactory {
    async fn create(
        &self,
        config: &BuildConfig,
    ) -> Result<Box<dyn PubSub>, PubSubError> {
        let transport = if self.refuse {
            RecordingTransport::refusing(self.log.clone())
        } else {
            RecordingTransport::new(self.log.clone())
        };
        let leaf = TransportLeaf::connect(transport, config.syntax.clone()).await?;
        Ok(Box::new(leaf))
    }
}

/// Ждёт первое событие, удовлетворяющее предикату, пропуская остальные.
pub async fn wait_event(
    rx: &mut broadcast::Receiver<Event>,
    pred: impl Fn(&Event) -> bool,
) -> Event {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Даёт фоновым задачам пересылки отработать.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}
