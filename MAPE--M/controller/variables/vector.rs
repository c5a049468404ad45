use crate::knowledge::{KnowledgeBase, KnowledgeValue};

/// Ordered list stored as `{name}.size` plus `{name}.{index}` keys.
#[derive(Debug, Clone)]
pub struct KnowledgeVector {
    name: String,
    knowledge: KnowledgeBase,
}

impl KnowledgeVector {
    /// Creates a view over `name`; nothing is written until the first mutation.
    #[must_use]
    pub fn new(knowledge: &KnowledgeBase, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            knowledge: knowledge.clone(),
        }
    }

    /// Base key.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn size_key(&self) -> String {
        format!("{}.size", self.name)
    }

    fn element_key(&self, index: usize) -> String {
        format!("{}.{index}", self.name)
    }

    /// Current length as published in the store.
    ///
    /// This is the advertised `{name}.size`, which a peer may set to anything;
    /// walks over the elements go through [`Self::stored_indices`] instead.
    #[must_use]
    pub fn size(&self) -> usize {
        usize::try_from(self.knowledge.integer(&self.size_key())).unwrap_or(0)
    }

    /// Returns true when the vector has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Indices that have an element key in the store, ascending.
    fn stored_indices(&self) -> Vec<usize> {
        let prefix = format!("{}.", self.name);
        let mut indices = self
            .knowledge
            .keys_with_prefix(&prefix)
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix)?.parse::<usize>().ok())
            .collect::<Vec<_>>();
        indices.sort_unstable();
        indices
    }

    /// Grows or shrinks the vector; stored elements at or past `size` are
    /// erased.
    pub fn resize(&self, size: usize) {
        for index in self.stored_indices() {
            if index >= size {
                self.knowledge.erase(&self.element_key(index));
            }
        }
        self.knowledge
            .set(&self.size_key(), i64::try_from(size).unwrap_or(i64::MAX));
    }

    /// Element at `index`; `None` past the end.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<KnowledgeValue> {
        if index >= self.size() {
            return None;
        }
        Some(
            self.knowledge
                .get(&self.element_key(index))
                .unwrap_or_default(),
        )
    }

    /// Writes `index`, growing the vector when needed.
    pub fn set(&self, index: usize, value: impl Into<KnowledgeValue>) {
        if index >= self.size() {
            self.resize(index + 1);
        }
        self.knowledge.set(&self.element_key(index), value);
    }

    /// Replaces the whole content.
    pub fn assign(&self, values: &[KnowledgeValue]) {
        self.resize(values.len());
        for (index, value) in values.iter().enumerate() {
            self.knowledge.set(&self.element_key(index), value.clone());
        }
    }

    /// Copies the content out; holes read as `Integer(0)`.
    ///
    /// The result ends at the last stored element even when `{name}.size`
    /// advertises more.
    #[must_use]
    pub fn to_vec(&self) -> Vec<KnowledgeValue> {
        let size = self.size();
        let len = self
            .stored_indices()
            .into_iter()
            .filter(|index| *index < size)
            .max()
            .map_or(0, |last| last + 1);
        (0..len)
            .map(|index| {
                self.knowledge
                    .get(&self.element_key(index))
                    .unwrap_or_default()
            })
            .collect()
    }
}
