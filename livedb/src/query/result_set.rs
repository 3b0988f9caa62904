use super::range::QueryRange;
use crate::model::Model;
use std::collections::HashMap;

/// One window of a query: ordered ids plus the models loaded for them.
/// An id at index 2 of a set with offset 100 sits at offset 102.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResultSet {
    pub(crate) offset: u64,
    pub(crate) ids: Vec<String>,
    pub(crate) models: HashMap<String, Model>,
    pub(crate) version: u64,
}

impl QueryResultSet {
    pub fn empty(offset: u64) -> Self {
        QueryResultSet {
            offset,
            ids: Vec::new(),
            models: HashMap::new(),
            version: 0,
        }
    }

    /// Build a complete set from already-ordered models.
    pub fn from_models(offset: u64, models: Vec<Model>) -> Self {
        let ids = models.iter().map(|m| m.id().to_string()).collect();
        let models = models.into_iter().map(|m| (m.id().to_string(), m)).collect();
        QueryResultSet {
            offset,
            ids,
            models,
            version: 0,
        }
    }

    /// True when every id has a model loaded.
    pub fn is_complete(&self) -> bool {
        self.ids.iter().all(|id| self.models.contains_key(id))
    }

    /// The window this set covers.
    pub fn range(&self) -> QueryRange {
        QueryRange::new(self.offset, self.ids.len() as u64)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Subscription version that produced this snapshot.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn count(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Loaded models in result order; ids without a model are skipped.
    pub fn models(&self) -> Vec<&Model> {
        self.ids.iter().filter_map(|id| self.models.get(id)).collect()
    }

    pub fn id_at_offset(&self, offset: u64) -> Option<&str> {
        let index = offset.checked_sub(self.offset)?;
        self.ids.get(index as usize).map(String::as_str)
    }

    pub fn model_at_offset(&self, offset: u64) -> Option<&Model> {
        self.id_at_offset(offset).and_then(|id| self.models.get(id))
    }

    pub fn model_with_id(&self, id: &str) -> Option<&Model> {
        self.models.get(id)
    }

    /// Offset of `id` within the whole query result.
    pub fn offset_of_id(&self, id: &str) -> Option<u64> {
        self.ids
            .iter()
            .position(|candidate| candidate == id)
            .map(|index| self.offset + index as u64)
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.models.contains_key(id) || self.ids.iter().any(|candidate| candidate == id)
    }
}
