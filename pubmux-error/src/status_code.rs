use std::fmt;

use num_enum::TryFromPrimitive;

/// Коды статуса для категоризации ошибок.
///
/// # Диапазоны:
/// - 1xxx: Общие ошибки
/// - 2xxx: Ошибки топиков и шаблонов
/// - 3xxx: Жизненный цикл экземпляра
/// - 4xxx: Сборка цепочки и конфигурация
/// - 5xxx: Кодирование сообщений
/// - 6xxx: Транспорт
///
/// `num_enum::TryFromPrimitive` даёт нативную реализацию `TryFrom<u32>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum StatusCode {
    // === 1xxx: Общие ошибки ===
    Internal = 1000,

    // === 2xxx: Топики ===
    InvalidTopic = 2000,

    // === 3xxx: Жизненный цикл ===
    InstanceClosed = 3000,
    NotReady = 3001,

    // === 4xxx: Сборка и конфигурация ===
    BuildFailed = 4000,
    UnknownTransport = 4001,
    InvalidConfig = 4002,

    // === 5xxx: Кодирование ===
    CodecFailed = 5000,

    // === 6xxx: Транспорт ===
    TransportFailed = 6000,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl StatusCode {
    /// Числовое представление кода статуса.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Ошибка сборки или конфигурации (диапазон 4xxx).
    pub fn is_build_error(&self) -> bool {
        (4000..=4999).contains(&self.code())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов для StatusCode
////////////////////////////////////////////////////////////////////////////////

impl From<StatusCode> for u32 {
    fn from(c: StatusCode) -> Self {
        c.code()
    }
}

impl fmt::Display for StatusCode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
