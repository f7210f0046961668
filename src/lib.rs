/// Decorators over any chain: prefix namespace, JSON codec, regex filter.
pub mod adapter;
/// Chain construction from configuration, transport registry.
pub mod builder;
/// Build configuration and application settings.
pub mod config;
/// Leaf implementations: in-memory trie, native transports.
pub mod leaf;
/// Logging setup (formatting, filters).
pub mod logging;
/// Pub/Sub contract: trait, events, listeners, messages.
pub mod pubsub;
/// Contract checks for custom transports and chains.
#[cfg(any(test, feature = "testing"))]
pub mod testing;
/// Topic syntax, pattern trie, subscription counter.
pub mod topic;

// -----------------------------------------------------------------------------
//  Frequently used public types
// -----------------------------------------------------------------------------

/// Decorators.
pub use adapter::{FilterRouter, FilterRule, JsonCodecAdapter, PrefixAdapter};
/// Builder and registry.
pub use builder::{
    Builder, BrokerFactory, LeafFactory, MemoryFactory, PubSubHandle, TransportRegistry,
};
/// config
pub use config::{BuildConfig, FilterConfig, Settings};
/// Leaves.
pub use leaf::{
    Broker, BrokerTransport, DeliverySink, MemoryPubSub, Transport, TransportLeaf,
};
/// Logging.
pub use logging::{init_logging, LogFormat, LoggingConfig};
/// Operation errors and result types.
pub use pubmux_error::{ErrorExt, PubSubError, PubmuxResult, ResultExt, StackError, StatusCode};
/// Pub/Sub API.
pub use pubsub::{Event, Listener, ListenerId, Message, MessagePayload, PubSub, PublishOptions};
/// Topics.
pub use topic::{SubscriptionCounter, TopicSyntax, TopicTrie};
