use std::collections::HashMap;

/// Счётчик локальных подписок по точной строке шаблона.
///
/// Транспортный лист вызывает upstream-подписку только на переходе 0→1 и
/// upstream-отписку только на переходе 1→0: N локальных слушателей одного
/// шаблона разделяют одну подписку в транспорте. Счётчик никогда не уходит
/// в минус; запись удаляется, когда счёт достигает нуля.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionCounter {
    counts: HashMap<String, usize>,
}

impl SubscriptionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Увеличивает счётчик. Возвращает `true` на переходе 0→1.
    pub fn add(
        &mut self,
        pattern: &str,
    ) -> bool {
        let count = self.counts.entry(pattern.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Уменьшает счётчик. Возвращает `true` на переходе 1→0.
    ///
    /// Для неизвестного шаблона ничего не делает и возвращает `false`.
    pub fn remove(
        &mut self,
        pattern: &str,
    ) -> bool {
        let Some(count) = self.counts.get_mut(pattern) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(pattern);
            true
        } else {
            false
        }
    }

    /// Остались ли ещё слушатели шаблона.
    pub fn includes_others(
        &self,
        pattern: &str,
    ) -> bool {
        self.count(pattern) > 0
    }

    pub fn count(
        &self,
        pattern: &str,
    ) -> usize {
        self.counts.get(pattern).copied().unwrap_or(0)
    }

    /// Количество различных шаблонов с ненулевым счётом.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.counts.keys().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}
