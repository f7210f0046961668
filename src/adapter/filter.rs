use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    pubsub::{
        forward_async_only, forward_events, Event, Lifecycle, Listener, MessagePayload, PubSub,
        PublishOptions,
    },
    PubSubError,
};

/// Выражения, которые считаются catch-all правилом.
pub const CATCH_ALL_EXPRESSIONS: [&str; 4] = [".*", "^.*$", "^.*", ""];

/// Является ли выражение catch-all правилом.
pub fn is_catch_all(accepts: &str) -> bool {
    CATCH_ALL_EXPRESSIONS.contains(&accepts)
}

/// Компилирует выражение правила; ошибка превращается в `Validation`.
pub fn compile_rule(accepts: &str) -> Result<Regex, PubSubError> {
    Regex::new(accepts).map_err(|e| PubSubError::validation(accepts, e.to_string()))
}

/// Правило маршрутизации: выражение и собранный делегат.
pub struct FilterRule {
    accepts: Regex,
    delegate: Box<dyn PubSub>,
}

impl FilterRule {
    pub fn new(
        accepts: Regex,
        delegate: Box<dyn PubSub>,
    ) -> Self {
        Self { accepts, delegate }
    }

    pub fn accepts(&self) -> &Regex {
        &self.accepts
    }

    pub fn delegate(&self) -> &dyn PubSub {
        self.delegate.as_ref()
    }

    pub fn is_catch_all(&self) -> bool {
        is_catch_all(self.accepts.as_str())
    }
}

impl std::fmt::Debug for FilterRule {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("FilterRule")
            .field("accepts", &self.accepts.as_str())
            .finish()
    }
}

/// Маршрутизатор по нескольким бэкендам.
///
/// Каждая операция уходит первому правилу, чьё выражение совпало со
/// строкой топика (шаблоны сравниваются как записаны). Последнее правило
/// всегда catch-all.
pub struct FilterRouter {
    rules: Vec<FilterRule>,
    lifecycle: Lifecycle,
}

impl FilterRouter {
    /// Собирает маршрутизатор из готовых правил.
    ///
    /// Последнее правило обязано быть catch-all, других catch-all быть не
    /// должно.
    pub fn new(rules: Vec<FilterRule>) -> Result<Self, PubSubError> {
        let last = rules
            .len()
            .checked_sub(1)
            .ok_or_else(|| PubSubError::build("filter requires at least one rule"))?;

        if let Some(pos) = rules[..last].iter().position(FilterRule::is_catch_all) {
            return Err(PubSubError::validation(
                rules[pos].accepts.as_str(),
                format!("catch-all rule at position {pos} must be the last one"),
            ));
        }
        if !rules[last].is_catch_all() {
            return Err(PubSubError::validation(
                rules[last].accepts.as_str(),
                "last filter rule must be a catch-all",
            ));
        }

        let lifecycle = Lifecycle::new();
        for rule in &rules {
            forward_events(
                rule.delegate.events(),
                lifecycle.sender(),
                forward_async_only,
            );
        }
        lifecycle.mark_ready();

        Ok(Self { rules, lifecycle })
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    pub fn delegate(
        &self,
        index: usize,
    ) -> Option<&dyn PubSub> {
        self.rules.get(index).map(FilterRule::delegate)
    }

    /// Индекс правила, принимающего топик.
    pub fn route(
        &self,
        topic: &str,
    ) -> Result<usize, PubSubError> {
        self.rules
            .iter()
            .position(|rule| rule.accepts.is_match(topic))
            .ok_or_else(|| PubSubError::validation(topic, "no filter rule accepts the topic"))
    }

    fn pick(
        &self,
        topic: &str,
    ) -> Result<&dyn PubSub, PubSubError> {
        let index = self.route(topic)?;
        debug!(topic, rule = index, "Filter route");
        Ok(self.rules[index].delegate.as_ref())
    }
}

#[async_trait]
impl PubSub for FilterRouter {
    async fn publish(
        &self,
        topic: &str,
        payload: MessagePayload,
        options: PublishOptions,
    ) -> Result<(), PubSubError> {
        self.lifecycle.ensure_open()?;
        self.pick(topic)?.publish(topic, payload, options).await
    }

    async fn subscribe(
        &self,
        pattern: &str,
        listener: Listener,
    ) -> Result<(), PubSubError> {
        self.lifecycle.ensure_open()?;
        self.pick(pattern)?.subscribe(pattern, listener).await
    }

    async fn unsubscribe(
        &self,
        pattern: &str,
        listener: &Listener,
    ) -> Result<(), PubSubError> {
        self.lifecycle.ensure_open()?;
        self.pick(pattern)?.unsubscribe(pattern, listener).await
    }

    /// Закрывает все делегаты параллельно. Ошибки отдельных делегатов
    /// только логируются: сам маршрутизатор закрывается всегда.
    async fn close(&self) -> Result<(), PubSubError> {
        if !self.lifecycle.begin_close().await {
            return Ok(());
        }

        let results = join_all(self.rules.iter().map(|rule| rule.delegate.close())).await;
        for (index, result) in results.into_iter().enumerate() {
            if let Err(err) = result {
                warn!(rule = index, error = %err, "Filter delegate failed to close");
            }
        }

        info!(rules = self.rules.len(), "Filter router closed");
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
