use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::sync::mpsc;

use super::Message;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Идентификатор регистрации слушателя.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

type Callback = Arc<dyn Fn(Message) + Send + Sync>;

/// Слушатель подписки: идентификатор плюс колбэк.
///
/// Равенство определяется только по `id`. Декораторы оборачивают колбэк
/// через [`Listener::filter_map`], сохраняя `id`, поэтому `unsubscribe` с
/// исходным слушателем снимает обёрнутую регистрацию на каждом уровне.
#[derive(Clone)]
pub struct Listener {
    id: ListenerId,
    callback: Callback,
}

impl Listener {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        Self {
            id: ListenerId::next(),
            callback: Arc::new(callback),
        }
    }

    /// Слушатель, пересылающий сообщения в неограниченный канал.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Self::new(move |msg| {
            // Получатель мог быть уже сброшен.
            let _ = tx.send(msg);
        });
        (listener, rx)
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn call(
        &self,
        message: Message,
    ) {
        (self.callback)(message)
    }

    /// Обёртка с тем же `id`: сообщение преобразуется `f`, `None` означает
    /// «не доставлять».
    pub fn filter_map<F>(
        &self,
        f: F,
    ) -> Self
    where
        F: Fn(Message) -> Option<Message> + Send + Sync + 'static,
    {
        let inner = self.callback.clone();
        Self {
            id: self.id,
            callback: Arc::new(move |msg| {
                if let Some(msg) = f(msg) {
                    inner(msg)
                }
            }),
        }
    }
}

impl PartialEq for Listener {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.id == other.id
    }
}

impl Eq for Listener {}

impl fmt::Debug for Listener {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Listener").field("id", &self.id).finish()
    }
}
