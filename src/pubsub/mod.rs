//! Контракт pub/sub.
//!
//! - `contract`: трейт [`PubSub`], события [`Event`] и [`Lifecycle`].
//! - `listener`: слушатель подписки с устойчивым идентификатором.
//! - `message`: сообщение, нагрузка и опции публикации.

pub mod contract;
pub mod listener;
pub mod message;

pub use contract::*;
pub use listener::*;
pub use message::*;
