use std::collections::HashMap;

use super::{Segment, TopicSyntax};
use crate::PubSubError;

/// Узел дерева шаблонов.
///
/// Значения под многоуровневым wildcard хранятся отдельным списком `multi`:
/// такой маркер всегда лист и не может иметь потомков.
#[derive(Debug)]
struct Node<T> {
    /// Литеральные сегменты → дочерний узел
    literals: HashMap<Box<str>, Node<T>>,
    /// Дочерний узел одноуровневого wildcard
    single: Option<Box<Node<T>>>,
    /// Подписки, шаблон которых заканчивается в этом узле
    values: Vec<T>,
    /// Подписки вида `<путь>/#`
    multi: Vec<T>,
}

/// Префиксное дерево шаблонов подписок.
///
/// Поддерживает:
/// - литеральные сегменты;
/// - одноуровневый wildcard (ровно один сегмент);
/// - многоуровневый wildcard (ноль и более хвостовых сегментов).
///
/// `matches` обходит все подходящие ветви и возвращает объединение: топик
/// `a/b/c` совпадёт и с `a/+/c`, и с `a/b/+`.
#[derive(Debug)]
pub struct TopicTrie<T> {
    syntax: TopicSyntax,
    root: Node<T>,
    len: usize,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            literals: HashMap::new(),
            single: None,
            values: Vec::new(),
            multi: Vec::new(),
        }
    }
}

impl<T> Node<T> {
    fn is_empty(&self) -> bool {
        self.literals.is_empty()
            && self.single.is_none()
            && self.values.is_empty()
            && self.multi.is_empty()
    }

    fn collect<'a>(
        &'a self,
        segments: &[&str],
        out: &mut Vec<&'a T>,
    ) {
        // `#` поглощает остаток пути, включая пустой.
        out.extend(self.multi.iter());

        match segments.split_first() {
            None => out.extend(self.values.iter()),
            Some((head, rest)) => {
                if let Some(child) = self.literals.get(*head) {
                    child.collect(rest, out);
                }
                if let Some(child) = &self.single {
                    child.collect(rest, out);
                }
            }
        }
    }

    fn remove<F>(
        &mut self,
        segments: &[Segment<'_>],
        predicate: &F,
    ) -> Option<T>
    where
        F: Fn(&T) -> bool,
    {
        let Some((head, rest)) = segments.split_first() else {
            let idx = self.values.iter().position(predicate)?;
            return Some(self.values.remove(idx));
        };

        match head {
            Segment::Multi => {
                let idx = self.multi.iter().position(predicate)?;
                Some(self.multi.remove(idx))
            }
            Segment::Single => {
                let child = self.single.as_mut()?;
                let removed = child.remove(rest, predicate);
                if child.is_empty() {
                    self.single = None;
                }
                removed
            }
            Segment::Literal(lit) => {
                let child = self.literals.get_mut(*lit)?;
                let removed = child.remove(rest, predicate);
                if child.is_empty() {
                    self.literals.remove(*lit);
                }
                removed
            }
        }
    }

    fn patterns(
        &self,
        syntax: &TopicSyntax,
        path: &mut Vec<String>,
        out: &mut Vec<String>,
    ) {
        if !self.values.is_empty() {
            out.push(path.join(syntax.separator.as_str()));
        }
        if !self.multi.is_empty() {
            path.push(syntax.multi_wildcard.clone());
            out.push(path.join(syntax.separator.as_str()));
            path.pop();
        }
        if let Some(child) = &self.single {
            path.push(syntax.single_wildcard.clone());
            child.patterns(syntax, path, out);
            path.pop();
        }
        for (lit, child) in &self.literals {
            path.push(lit.to_string());
            child.patterns(syntax, path, out);
            path.pop();
        }
    }
}

impl<T> TopicTrie<T> {
    pub fn new(syntax: TopicSyntax) -> Self {
        Self {
            syntax,
            root: Node::default(),
            len: 0,
        }
    }

    pub fn syntax(&self) -> &TopicSyntax {
        &self.syntax
    }

    /// Количество зарегистрированных значений.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Добавляет значение под шаблоном.
    ///
    /// Одинаковые шаблоны допустимы: каждое значение хранится отдельно.
    pub fn insert(
        &mut self,
        pattern: &str,
        value: T,
    ) -> Result<(), PubSubError> {
        let segments = self.syntax.parse_pattern(pattern)?;
        let mut node = &mut self.root;

        for segment in segments {
            match segment {
                Segment::Multi => {
                    node.multi.push(value);
                    self.len += 1;
                    return Ok(());
                }
                Segment::Single => {
                    node = &mut **node.single.get_or_insert_with(Box::default);
                }
                Segment::Literal(lit) => {
                    node = node.literals.entry(lit.into()).or_default();
                }
            }
        }

        node.values.push(value);
        self.len += 1;
        Ok(())
    }

    /// Удаляет первое значение под шаблоном, для которого `predicate`
    /// вернул `true`. Опустевшие узлы удаляются.
    pub fn remove<F>(
        &mut self,
        pattern: &str,
        predicate: F,
    ) -> Result<Option<T>, PubSubError>
    where
        F: Fn(&T) -> bool,
    {
        let segments = self.syntax.parse_pattern(pattern)?;
        let removed = self.root.remove(&segments, &predicate);
        if removed.is_some() {
            self.len -= 1;
        }
        Ok(removed)
    }

    /// Значения, зарегистрированные под точно этим шаблоном.
    pub fn get(
        &self,
        pattern: &str,
    ) -> Vec<&T> {
        let Ok(segments) = self.syntax.parse_pattern(pattern) else {
            return Vec::new();
        };
        let mut node = &self.root;
        for segment in segments {
            let next = match segment {
                Segment::Multi => return node.multi.iter().collect(),
                Segment::Single => node.single.as_deref(),
                Segment::Literal(lit) => node.literals.get(lit),
            };
            match next {
                Some(child) => node = child,
                None => return Vec::new(),
            }
        }
        node.values.iter().collect()
    }

    /// Есть ли хотя бы одно значение под точно этим шаблоном.
    pub fn contains(
        &self,
        pattern: &str,
    ) -> bool {
        !self.get(pattern).is_empty()
    }

    /// Возвращает все значения, шаблоны которых совпадают с топиком.
    pub fn matches(
        &self,
        topic: &str,
    ) -> Result<Vec<&T>, PubSubError> {
        self.syntax.validate_topic(topic)?;

        let segments: Vec<&str> = self.syntax.split(topic).collect();
        let mut out = Vec::new();
        self.root.collect(&segments, &mut out);
        Ok(out)
    }

    /// Список зарегистрированных шаблонов (без повторов, в произвольном
    /// порядке).
    pub fn patterns(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.root.patterns(&self.syntax, &mut Vec::new(), &mut out);
        out
    }

    pub fn clear(&mut self) {
        self.root = Node::default();
        self.len = 0;
    }
}

impl<T> Default for TopicTrie<T> {
    fn default() -> Self {
        Self::new(TopicSyntax::default())
    }
}
