//! Настройки из файла → собранная цепочка.

use std::io::Write;

use pubmux::{
    config::settings::ENV_PREFIX, Builder, Listener, MessagePayload, PubSub, PublishOptions,
    Settings, StatusCode,
};
use serde_json::json;

/// Тест проверяет, что цепочка, описанная в TOML, собирается и работает:
/// фильтр видит топики уже с префиксом.
#[tokio::test]
async fn test_chain_from_toml_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    write!(
        file,
        r#"
        [pubsub]
        type = "filter"
        prefix = "app"

        [[pubsub.filters]]
        accepts = "^app/hello"
        type = "trie"

        [[pubsub.filters]]
        accepts = ".*"
        type = "memory"
        json = false

        [logging]
        level = "warn"
        format = "compact"
        "#
    )
    .unwrap();

    let settings = Settings::load(Some(file.path())).unwrap();
    assert_eq!(settings.pubsub.filters.len(), 2);

    let chain = Builder::default().build(&settings.pubsub).await.unwrap();
    let (hello, mut hello_rx) = Listener::channel();
    let (rest, mut rest_rx) = Listener::channel();
    chain.subscribe("hello/+", hello).await.unwrap();
    chain.subscribe("bye/+", rest).await.unwrap();

    chain
        .publish("hello/world", json!({"greeting": true}).into(), PublishOptions::default())
        .await
        .unwrap();
    chain
        .publish("bye/world", json!(false).into(), PublishOptions::default())
        .await
        .unwrap();

    let msg = hello_rx.recv().await.unwrap();
    assert_eq!(msg.topic, "hello/world");
    assert_eq!(msg.payload, MessagePayload::Json(json!({"greeting": true})));
    let msg = rest_rx.recv().await.unwrap();
    assert_eq!(msg.topic, "bye/world");
    assert_eq!(msg.payload, MessagePayload::Json(json!(false)));
}

/// Тест проверяет, что неизвестный тип проходит статическую проверку, но
/// не собирается.
#[tokio::test]
async fn test_unknown_type_fails_at_build() {
    let settings =
        Settings::from_str(r#"{"pubsub": {"type": "zeromq"}}"#, config::FileFormat::Json).unwrap();
    let err = Builder::default()
        .build(&settings.pubsub)
        .await
        .err()
        .unwrap();
    assert_eq!(pubmux::ErrorExt::status_code(&err), StatusCode::UnknownTransport);
}

/// Тест проверяет, что переменные окружения переопределяют файл.
#[test]
fn test_environment_overrides_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[pubsub]\ntype = \"memory\"\njson = true").unwrap();

    std::env::set_var(format!("{ENV_PREFIX}__PUBSUB__JSON"), "false");
    let settings = Settings::load(Some(file.path()));
    std::env::remove_var(format!("{ENV_PREFIX}__PUBSUB__JSON"));

    let settings = settings.unwrap();
    assert_eq!(settings.pubsub.kind, "memory");
    assert!(!settings.pubsub.json);
}
