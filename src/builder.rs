//! Сборка цепочек по конфигурации.
//!
//! Лист выбирается по `type` в явном реестре [`TransportRegistry`], затем
//! оборачивается декораторами: префикс, затем JSON-кодек. Тип `"filter"`
//! собирает [`FilterRouter`] из делегатов, каждый из которых сам
//! собирается тем же сборщиком.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::{
    adapter::{compile_rule, is_catch_all, FilterRouter, FilterRule, JsonCodecAdapter, PrefixAdapter},
    config::{BuildConfig, FilterConfig, DEFAULT_KIND},
    leaf::{Broker, BrokerTransport, MemoryPubSub, TransportLeaf},
    pubsub::{
        forward_async_only, forward_events, Event, Lifecycle, Listener, MessagePayload, PubSub,
        PublishOptions,
    },
    PubSubError,
};

/// Выражение неявного catch-all правила фильтра.
pub const IMPLICIT_CATCH_ALL: &str = ".*";

/// Фабрика листа для зарегистрированного типа транспорта.
///
/// Ошибка до готовности листа возвращается отсюда и проваливает сборку.
#[async_trait]
pub trait LeafFactory: Send + Sync {
    async fn create(
        &self,
        config: &BuildConfig,
    ) -> Result<Box<dyn PubSub>, PubSubError>;
}

/// Фабрика [`MemoryPubSub`] (`"memory"`, `"trie"`).
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryFactory;

#[async_trait]
impl LeafFactory for MemoryFactory {
    async fn create(
        &self,
        config: &BuildConfig,
    ) -> Result<Box<dyn PubSub>, PubSubError> {
        Ok(Box::new(MemoryPubSub::new(config.syntax.clone())))
    }
}

/// Фабрика листов поверх общего [`Broker`].
///
/// Все цепочки, собранные этой фабрикой, видят один и тот же брокер, как
/// клиенты одного сервера.
#[derive(Clone, Default)]
pub struct BrokerFactory {
    broker: Arc<Broker>,
}

impl BrokerFactory {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }
}

#[async_trait]
impl LeafFactory for BrokerFactory {
    async fn create(
        &self,
        config: &BuildConfig,
    ) -> Result<Box<dyn PubSub>, PubSubError> {
        let transport = BrokerTransport::new(self.broker.clone(), config.syntax.clone());
        let leaf = TransportLeaf::connect(transport, config.syntax.clone()).await?;
        Ok(Box::new(leaf))
    }
}

/// Явный реестр типов транспорта: имя → фабрика.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    factories: HashMap<String, Arc<dyn LeafFactory>>,
}

impl TransportRegistry {
    /// Пустой реестр.
    pub fn new() -> Self {
        Self::default()
    }

    /// Реестр со встроенными листами: `"memory"` и `"trie"`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("memory", MemoryFactory);
        registry.register("trie", MemoryFactory);
        registry
    }

    /// Регистрирует фабрику; прежняя регистрация с тем же именем заменяется.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl LeafFactory + 'static,
    ) -> &mut Self {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn with(
        mut self,
        name: impl Into<String>,
        factory: impl LeafFactory + 'static,
    ) -> Self {
        self.register(name, factory);
        self
    }

    pub fn get(
        &self,
        name: &str,
    ) -> Option<Arc<dyn LeafFactory>> {
        self.factories.get(name).cloned()
    }

    pub fn contains(
        &self,
        name: &str,
    ) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Сборщик цепочек.
#[derive(Clone)]
pub struct Builder {
    registry: Arc<TransportRegistry>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new(TransportRegistry::with_defaults())
    }
}

impl Builder {
    pub fn new(registry: TransportRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &TransportRegistry {
        &self.registry
    }

    /// Собирает цепочку и возвращает её готовой.
    ///
    /// Конфигурация проверяется целиком до создания первого листа.
    pub async fn build(
        &self,
        config: &BuildConfig,
    ) -> Result<Box<dyn PubSub>, PubSubError> {
        config.validate()?;
        let chain = self.build_chain(config).await?;
        info!(
            kind = %config.kind,
            prefix = ?config.prefix,
            json = config.json,
            "Pubsub chain built"
        );
        Ok(chain)
    }

    /// Рекурсивная часть сборки: делегаты фильтра собираются этим же
    /// методом, поэтому future упакован.
    fn build_chain<'a>(
        &'a self,
        config: &'a BuildConfig,
    ) -> BoxFuture<'a, Result<Box<dyn PubSub>, PubSubError>> {
        async move {
            let mut chain = if config.is_filter() {
                self.build_filter(config).await?
            } else {
                self.build_leaf(config).await?
            };

            if let Some(prefix) = &config.prefix {
                chain = Box::new(PrefixAdapter::new(
                    chain,
                    prefix.clone(),
                    config.syntax.clone(),
                )?);
            }
            if config.json {
                chain = Box::new(JsonCodecAdapter::new(chain));
            }

            debug!(kind = %config.kind, "Chain level built");
            Ok(chain)
        }
        .boxed()
    }

    /// Возвращает обработчик сразу; сборка идёт в фоне и завершается
    /// ровно одним событием `Ready` или `Error`.
    pub fn spawn(
        &self,
        config: BuildConfig,
    ) -> PubSubHandle {
        let (state_tx, state_rx) = watch::channel(BuildState::Pending);
        let lifecycle = Arc::new(Lifecycle::new());
        let handle = PubSubHandle {
            state: state_rx,
            lifecycle: lifecycle.clone(),
        };

        let builder = self.clone();
        tokio::spawn(async move {
            match builder.build(&config).await {
                Ok(chain) => {
                    let chain: Arc<dyn PubSub> = Arc::from(chain);
                    forward_events(chain.events(), lifecycle.sender(), forward_async_only);
                    let _ = state_tx.send(BuildState::Ready(chain.clone()));
                    // Закрытие могло случиться, пока шла сборка.
                    if lifecycle.is_closed() {
                        close_quietly(chain.as_ref()).await;
                        return;
                    }
                    lifecycle.mark_ready();
                }
                Err(err) => {
                    if err.is_fatal() {
                        error!(kind = %config.kind, error = %err, "Pubsub build failed");
                    } else {
                        warn!(kind = %config.kind, error = %err, "Pubsub build failed, transport unavailable");
                    }
                    let _ = state_tx.send(BuildState::Failed(err.clone()));
                    lifecycle.emit(Event::Error(err));
                }
            }
        });

        handle
    }

    async fn build_leaf(
        &self,
        config: &BuildConfig,
    ) -> Result<Box<dyn PubSub>, PubSubError> {
        let factory = self
            .registry
            .get(&config.kind)
            .ok_or_else(|| PubSubError::UnknownTransport {
                kind: config.kind.clone(),
            })?;
        factory.create(config).await
    }

    /// Собирает [`FilterRouter`]: делегаты строятся параллельно; при
    /// ошибке успешно собранные закрываются, а возвращается ошибка правила
    /// с наименьшим индексом.
    async fn build_filter(
        &self,
        config: &BuildConfig,
    ) -> Result<Box<dyn PubSub>, PubSubError> {
        let configured = filter_rules(config);
        let regexes = configured
            .iter()
            .map(|rule| compile_rule(&rule.accepts))
            .collect::<Result<Vec<_>, _>>()?;

        let results = join_all(configured.iter().map(|rule| self.build_chain(&rule.delegate))).await;

        let mut delegates = Vec::with_capacity(results.len());
        let mut first_error: Option<(usize, PubSubError)> = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(delegate) => delegates.push(delegate),
                Err(err) => {
                    warn!(rule = index, error = %err, "Filter delegate build failed");
                    if first_error.is_none() {
                        first_error = Some((index, err));
                    }
                }
            }
        }

        if let Some((index, err)) = first_error {
            join_all(delegates.iter().map(|d| close_quietly(d.as_ref()))).await;
            return Err(match err {
                PubSubError::Build { .. } => err,
                other => PubSubError::build(format!("filter rule #{index}: {other}")),
            });
        }

        let rules = regexes
            .into_iter()
            .zip(delegates)
            .map(|(accepts, delegate)| FilterRule::new(accepts, delegate))
            .collect();
        info!(rules = configured.len(), "Filter router built");
        Ok(Box::new(FilterRouter::new(rules)?))
    }
}

/// Правила фильтра с неявным catch-all в конце.
fn filter_rules(config: &BuildConfig) -> Vec<FilterConfig> {
    let mut rules = config.filters.clone();
    if !rules.last().is_some_and(|rule| is_catch_all(&rule.accepts)) {
        rules.push(FilterConfig {
            accepts: IMPLICIT_CATCH_ALL.to_string(),
            delegate: BuildConfig {
                syntax: config.syntax.clone(),
                ..BuildConfig::new(DEFAULT_KIND)
            },
        });
    }
    rules
}

async fn close_quietly(instance: &dyn PubSub) {
    if let Err(err) = instance.close().await {
        warn!(error = %err, "Close after failed build failed");
    }
}

/// Состояние фоновой сборки.
#[derive(Clone)]
enum BuildState {
    Pending,
    Ready(Arc<dyn PubSub>),
    Failed(PubSubError),
}

/// Обработчик цепочки, собираемой в фоне.
///
/// До завершения сборки операции возвращают `NotReady`, после неудачной
/// сборки возвращают её ошибку.
#[derive(Clone)]
pub struct PubSubHandle {
    state: watch::Receiver<BuildState>,
    lifecycle: Arc<Lifecycle>,
}

impl PubSubHandle {
    /// Ожидает окончания сборки.
    pub async fn ready(&self) -> Result<(), PubSubError> {
        let mut state = self.state.clone();
        let outcome = state
            .wait_for(|s| !matches!(s, BuildState::Pending))
            .await
            .map_err(|_| PubSubError::build("build task was dropped"))?;

        match &*outcome {
            BuildState::Ready(_) => Ok(()),
            BuildState::Failed(err) => Err(err.clone()),
            BuildState::Pending => Err(PubSubError::NotReady),
        }
    }

    fn chain(&self) -> Result<Arc<dyn PubSub>, PubSubError> {
        self.lifecycle.ensure_open()?;
        match &*self.state.borrow() {
            BuildState::Pending => Err(PubSubError::NotReady),
            BuildState::Ready(chain) => Ok(chain.clone()),
            BuildState::Failed(err) => Err(err.clone()),
        }
    }
}

#[async_trait]
impl PubSub for PubSubHandle {
    async fn publish(
        &self,
        topic: &str,
        payload: MessagePayload,
        options: PublishOptions,
    ) -> Result<(), PubSubError> {
        self.chain()?.publish(topic, payload, options).await
    }

    async fn subscribe(
        &self,
        pattern: &str,
        listener: Listener,
    ) -> Result<(), PubSubError> {
        self.chain()?.subscribe(pattern, listener).await
    }

    async fn unsubscribe(
        &self,
        pattern: &str,
        listener: &Listener,
    ) -> Result<(), PubSubError> {
        self.chain()?.unsubscribe(pattern, listener).await
    }

    async fn close(&self) -> Result<(), PubSubError> {
        if !self.lifecycle.begin_close().await {
            return Ok(());
        }
        let chain = match &*self.state.borrow() {
            BuildState::Ready(chain) => Some(chain.clone()),
            _ => None,
        };
        let result = match chain {
            Some(chain) => chain.close().await,
            None => Ok(()),
        };
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
