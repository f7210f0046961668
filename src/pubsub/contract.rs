use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use super::{Listener, MessagePayload, PublishOptions};
use crate::PubSubError;

/// Ёмкость канала событий жизненного цикла.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// События жизненного цикла экземпляра.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Экземпляр готов к работе
    Ready,
    /// Асинхронная ошибка (после готовности) или ошибка сборки
    Error(PubSubError),
    /// Экземпляр закрыт
    Closed,
    /// Первая подписка на шаблон
    NewTopic(String),
}

/// Единый интерфейс pub/sub поверх любого транспорта.
///
/// Реализуется листами и декораторами; цепочка собирается владением
/// `Box<dyn PubSub>`.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Публикует нагрузку в топик. Wildcard в топике недопустим.
    async fn publish(
        &self,
        topic: &str,
        payload: MessagePayload,
        options: PublishOptions,
    ) -> Result<(), PubSubError>;

    /// Регистрирует слушателя под шаблоном.
    async fn subscribe(
        &self,
        pattern: &str,
        listener: Listener,
    ) -> Result<(), PubSubError>;

    /// Снимает регистрацию слушателя (по его `id`) под шаблоном.
    async fn unsubscribe(
        &self,
        pattern: &str,
        listener: &Listener,
    ) -> Result<(), PubSubError>;

    /// Закрывает экземпляр. Повторный вызов ничего не делает.
    async fn close(&self) -> Result<(), PubSubError>;

    /// Новый приёмник событий жизненного цикла.
    fn events(&self) -> broadcast::Receiver<Event>;

    fn is_closed(&self) -> bool;
}

const PENDING: u8 = 0;
const READY: u8 = 1;
const CLOSED: u8 = 2;

/// Состояние жизненного цикла плюс канал событий.
///
/// `Pending → Ready → Closed`. Каждый лист и декоратор держит свой
/// экземпляр.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
    events: broadcast::Sender<Event>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        }
    }

    /// Ошибка `Closed`, если экземпляр уже закрыт.
    pub fn ensure_open(&self) -> Result<(), PubSubError> {
        if self.is_closed() {
            return Err(PubSubError::Closed);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }

    /// Переводит в `Ready` и рассылает событие. Из `Closed` не выходит.
    pub fn mark_ready(&self) {
        if self
            .state
            .compare_exchange(PENDING, READY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.emit(Event::Ready);
        }
    }

    /// Начинает закрытие. `true` только для первого вызова; повторный
    /// вызов уступает планировщику и возвращает `false`.
    pub async fn begin_close(&self) -> bool {
        if self.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            tokio::task::yield_now().await;
            return false;
        }
        true
    }

    /// Рассылает `Closed`.
    pub fn finish_close(&self) {
        self.emit(Event::Closed);
    }

    pub fn emit(
        &self,
        event: Event,
    ) {
        // Отсутствие подписчиков на события не ошибка.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<Event> {
        self.events.clone()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Пересылает события внутреннего экземпляра в канал внешнего.
///
/// `map` решает, что пересылать: `None` отбрасывает событие. Задача
/// завершается, когда внутренний канал закрыт.
pub fn forward_events<F>(
    mut rx: broadcast::Receiver<Event>,
    tx: broadcast::Sender<Event>,
    map: F,
) where
    F: Fn(Event) -> Option<Event> + Send + 'static,
{
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!("No tokio runtime, inner events will not be forwarded");
        return;
    };

    handle.spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(event) = map(event) {
                        let _ = tx.send(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Фильтр для декораторов: наружу идут только `Error` и `NewTopic`,
/// собственные `Ready`/`Closed` декоратор рассылает сам.
pub fn forward_async_only(event: Event) -> Option<Event> {
    match event {
        Event::Error(_) | Event::NewTopic(_) => Some(event),
        Event::Ready | Event::Closed => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет переходы Pending → Ready → Closed.
    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let lifecycle = Lifecycle::new();
        let mut rx = lifecycle.subscribe();

        assert!(!lifecycle.is_ready());
        lifecycle.mark_ready();
        lifecycle.mark_ready();
        assert!(lifecycle.is_ready());
        assert_eq!(rx.recv().await.unwrap(), Event::Ready);

        assert!(lifecycle.ensure_open().is_ok());
        assert!(lifecycle.begin_close().await);
        lifecycle.finish_close();
        assert_eq!(rx.recv().await.unwrap(), Event::Closed);
        assert_eq!(lifecycle.ensure_open(), Err(PubSubError::Closed));

        // Повторное закрытие не рассылает второй `Closed`.
        assert!(!lifecycle.begin_close().await);
        assert!(rx.try_recv().is_err());

        // Из `Closed` в `Ready` не возвращаемся.
        lifecycle.mark_ready();
        assert!(lifecycle.is_closed());
    }

    /// Тест проверяет пересылку событий с фильтрацией.
    #[tokio::test]
    async fn test_forward_events() {
        let inner = Lifecycle::new();
        let outer = Lifecycle::new();
        let mut rx = outer.subscribe();

        forward_events(inner.subscribe(), outer.sender(), forward_async_only);

        inner.mark_ready();
        inner.emit(Event::NewTopic("a/b".to_string()));
        inner.emit(Event::Error(PubSubError::codec("bad")));

        assert_eq!(rx.recv().await.unwrap(), Event::NewTopic("a/b".to_string()));
        assert_eq!(
            rx.recv().await.unwrap(),
            Event::Error(PubSubError::codec("bad"))
        );
    }
}
