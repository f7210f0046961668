//! Листья цепочки: экземпляры, которые сами хранят подписки.
//!
//! - `memory`: внутрипроцессная шина на дереве шаблонов.
//! - `transport`: трейт [`Transport`] и лист [`TransportLeaf`] с
//!   дедупликацией upstream-подписок.
//! - `broker`: внутрипроцессный брокер и транспорт поверх него.

pub mod broker;
pub mod memory;
pub mod transport;

pub use broker::*;
pub use memory::*;
pub use transport::*;
