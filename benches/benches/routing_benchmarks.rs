use std::hint::black_box;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use pubmux::{
    Broker, BuildConfig, Builder, Listener, MessagePayload, PubSub, PublishOptions, TopicSyntax,
    TopicTrie,
};

fn build_trie(patterns: usize) -> TopicTrie<usize> {
    let mut trie = TopicTrie::new(TopicSyntax::default());
    for i in 0..patterns {
        trie.insert(&format!("sensors/{i}/+"), i).unwrap();
        trie.insert(&format!("sensors/{i}/#"), i).unwrap();
    }
    trie.insert("#", usize::MAX).unwrap();
    trie
}

fn bench_trie_matches(c: &mut Criterion) {
    let mut group = c.benchmark_group("trie_matches");
    for size in [10, 100, 1_000] {
        let trie = build_trie(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &trie, |b, trie| {
            b.iter(|| black_box(trie.matches("sensors/7/temperature").unwrap().len()))
        });
    }
    group.finish();
}

fn bench_broker_publish(c: &mut Criterion) {
    let broker = Broker::default();
    // держим получателей, иначе брокер удалит канал
    let _subs: Vec<_> = (0..10)
        .map(|_| broker.subscribe("sensors/7/temperature"))
        .collect();
    c.bench_function("broker_publish_10_subs", |b| {
        b.iter(|| {
            broker.publish(
                "sensors/7/temperature",
                black_box(Bytes::from_static(b"21.5")),
            )
        })
    });
}

fn bench_chain_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let chain = rt.block_on(async {
        let config = BuildConfig::default().with_prefix("bench");
        let chain = Builder::default().build(&config).await.unwrap();
        chain
            .subscribe("sensors/+/temperature", Listener::new(|_| {}))
            .await
            .unwrap();
        chain
    });

    c.bench_function("chain_publish_prefix_json", |b| {
        b.iter(|| {
            rt.block_on(chain.publish(
                "sensors/7/temperature",
                black_box(MessagePayload::Json(serde_json::json!({"value": 21.5}))),
                PublishOptions::default(),
            ))
            .unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_trie_matches,
    bench_broker_publish,
    bench_chain_publish
);
criterion_main!(benches);
