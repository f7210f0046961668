//! Декораторы цепочки.
//!
//! - `prefix`: пространство имён для топиков.
//! - `codec`: JSON-кодирование нагрузки.
//! - `filter`: маршрутизация по нескольким бэкендам.
//!
//! Каждый декоратор владеет внутренним `Box<dyn PubSub>` и пересылает его
//! события `Error` и `NewTopic` в собственный канал.

pub mod codec;
pub mod filter;
pub mod prefix;

pub use codec::*;
pub use filter::*;
pub use prefix::*;
