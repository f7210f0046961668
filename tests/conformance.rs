//! Проверки контракта [`PubSub`] на собранных цепочках: общий брокер,
//! фильтр с двумя делегатами, префикс с кодеком.

use std::sync::Arc;

use pubmux::{
    testing::behaves_like_pubsub, Broker, BrokerFactory, BuildConfig, Builder, MemoryPubSub,
    PubSub, TransportRegistry,
};

fn broker_builder() -> Builder {
    let broker = Arc::new(Broker::default());
    Builder::new(TransportRegistry::with_defaults().with("broker", BrokerFactory::new(broker)))
}

async fn run_chain(config: BuildConfig) {
    let builder = broker_builder();
    let builder = &builder;
    let config = &config;
    behaves_like_pubsub(move || async move { builder.build(config).await.unwrap() }).await;
}

/// Тест проверяет контракт голого листа в памяти.
#[tokio::test]
async fn test_memory_leaf() {
    behaves_like_pubsub(|| async { Box::new(MemoryPubSub::default()) as Box<dyn PubSub> }).await;
}

/// Тест проверяет контракт листа поверх брокера с JSON-кодеком.
#[tokio::test]
async fn test_broker_leaf() {
    run_chain(BuildConfig::new("broker")).await;
}

/// Тест проверяет контракт листа поверх брокера без кодека: полезная
/// нагрузка возвращается байтами.
#[tokio::test]
async fn test_broker_leaf_without_codec() {
    run_chain(BuildConfig::new("broker").with_json(false)).await;
}

/// Тест проверяет контракт фильтра: часть топиков уходит в брокер,
/// остальные в память.
#[tokio::test]
async fn test_filter_chain() {
    let config = BuildConfig::new("filter")
        .with_filter("^room", BuildConfig::new("broker"))
        .with_filter("^dedup", BuildConfig::new("broker").with_prefix("d"))
        .with_filter(".*", BuildConfig::new("memory"));
    run_chain(config).await;
}

/// Тест проверяет контракт цепочки с префиксом поверх брокера.
#[tokio::test]
async fn test_prefixed_chain() {
    run_chain(BuildConfig::new("broker").with_prefix("tenant/a")).await;
}
