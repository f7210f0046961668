use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    pubsub::{
        forward_events, Event, Lifecycle, Listener, MessagePayload, PubSub, PublishOptions,
    },
    topic::TopicSyntax,
    PubSubError,
};

/// Декоратор пространства имён.
///
/// Наружу: `topic → prefix/topic` для publish, subscribe и unsubscribe.
/// Внутрь: префикс снимается; доставка без префикса слушателю не
/// передаётся, вместо неё рассылается `Event::Error`.
///
/// Топик, равный самому префиксу, тоже отклоняется: у него нет подтопика,
/// а пустой топик через адаптер не адресуем. Так бывает с шаблоном `#`,
/// который во внутреннем экземпляре совпадает и с `prefix`.
pub struct PrefixAdapter {
    inner: Box<dyn PubSub>,
    prefix: String,
    syntax: TopicSyntax,
    lifecycle: Lifecycle,
}

impl PrefixAdapter {
    pub fn new(
        inner: Box<dyn PubSub>,
        prefix: impl Into<String>,
        syntax: TopicSyntax,
    ) -> Result<Self, PubSubError> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(PubSubError::validation(prefix, "prefix must not be empty"));
        }
        if syntax.has_wildcards(&prefix) {
            return Err(PubSubError::validation(
                prefix,
                "prefix must not contain wildcards",
            ));
        }

        let lifecycle = Lifecycle::new();
        let strip_prefix = prefix.clone();
        let strip_syntax = syntax.clone();
        forward_events(inner.events(), lifecycle.sender(), move |event| match event {
            Event::NewTopic(topic) => strip_syntax
                .strip(&strip_prefix, &topic)
                .map(|rest| Event::NewTopic(rest.to_string())),
            Event::Error(_) => Some(event),
            Event::Ready | Event::Closed => None,
        });
        lifecycle.mark_ready();

        Ok(Self {
            inner,
            prefix,
            syntax,
            lifecycle,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn inner(&self) -> &dyn PubSub {
        self.inner.as_ref()
    }

    fn full(
        &self,
        topic: &str,
    ) -> String {
        self.syntax.join(&self.prefix, topic)
    }
}

#[async_trait]
impl PubSub for PrefixAdapter {
    async fn publish(
        &self,
        topic: &str,
        payload: MessagePayload,
        options: PublishOptions,
    ) -> Result<(), PubSubError> {
        self.lifecycle.ensure_open()?;
        self.syntax.validate_topic(topic)?;
        self.inner.publish(&self.full(topic), payload, options).await
    }

    async fn subscribe(
        &self,
        pattern: &str,
        listener: Listener,
    ) -> Result<(), PubSubError> {
        self.lifecycle.ensure_open()?;
        self.syntax.parse_pattern(pattern)?;

        let prefix = self.prefix.clone();
        let syntax = self.syntax.clone();
        let events = self.lifecycle.sender();
        let wrapped = listener.filter_map(move |mut msg| match syntax.strip(&prefix, &msg.topic) {
            Some(rest) => {
                msg.topic = rest.to_string();
                Some(msg)
            }
            None => {
                warn!(topic = %msg.topic, prefix = %prefix, "Dropping delivery outside of prefix");
                let _ = events.send(Event::Error(PubSubError::validation(
                    msg.topic,
                    format!("topic is not under prefix '{prefix}'"),
                )));
                None
            }
        });

        let full = self.full(pattern);
        debug!(pattern, full = %full, "Prefixed subscribe");
        self.inner.subscribe(&full, wrapped).await
    }

    async fn unsubscribe(
        &self,
        pattern: &str,
        listener: &Listener,
    ) -> Result<(), PubSubError> {
        self.lifecycle.ensure_open()?;
        self.inner.unsubscribe(&self.full(pattern), listener).await
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
