use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    ClassReport(String),
    StudentReport { class_id: String, student_id: String },
}

impl QueryKey {
    pub fn class_id(&self) -> &str {
        match self {
            QueryKey::ClassReport(class_id) => class_id,
            QueryKey::StudentReport { class_id, .. } => class_id,
        }
    }

    pub fn student_id(&self) -> Option<&str> {
        match self {
            QueryKey::ClassReport(_) => None,
            QueryKey::StudentReport { student_id, .. } => Some(student_id),
        }
    }
}

/// Keyed result cache. Nothing expires on its own; writers invalidate the keys
/// they affect.
#[derive(Debug)]
pub struct QueryCache<V> {
    entries: HashMap<QueryKey, V>,
}

impl<V> Default for QueryCache<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<V> QueryCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &QueryKey) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: QueryKey, value: V) {
        self.entries.insert(key, value);
    }

    pub fn remove(&mut self, key: &QueryKey) -> Option<V> {
        self.entries.remove(key)
    }

    pub fn invalidate(&mut self, key: &QueryKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drops every key matching `pred`; returns how many were dropped.
    pub fn invalidate_where<F>(&mut self, mut pred: F) -> usize
    where
        F: FnMut(&QueryKey) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|k, _| !pred(k));
        let dropped = before - self.entries.len();
        if dropped > 0 {
            tracing::debug!(dropped, "query cache invalidated");
        }
        dropped
    }

    pub fn invalidate_class(&mut self, class_id: &str) -> usize {
        self.invalidate_where(|k| k.class_id() == class_id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
