use super::range::QueryRange;
use super::result_set::QueryResultSet;
use crate::error::{LiveDbError, Result};
use crate::model::Model;
use std::cmp::Ordering;

/// A result set that can be spliced while a subscription applies fetches
/// and change records. Subscriptions hand out immutable snapshots of it.
#[derive(Debug, Clone, Default)]
pub struct MutableResultSet {
    inner: Option<QueryResultSet>,
}

impl MutableResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn range(&self) -> Option<QueryRange> {
        self.inner.as_ref().map(QueryResultSet::range)
    }

    pub fn is_complete(&self) -> bool {
        self.inner.as_ref().map_or(true, QueryResultSet::is_complete)
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.inner.as_ref().is_some_and(|set| set.contains_id(id))
    }

    pub fn model_with_id(&self, id: &str) -> Option<&Model> {
        self.inner.as_ref().and_then(|set| set.model_with_id(id))
    }

    pub fn count(&self) -> usize {
        self.inner.as_ref().map_or(0, QueryResultSet::count)
    }

    /// Snapshot of the current contents.
    pub fn immutable(&self, version: u64) -> QueryResultSet {
        let mut set = self.inner.clone().unwrap_or_else(|| QueryResultSet::empty(0));
        set.version = version;
        set
    }

    /// Splice ordered models fetched for `range` into the set. The new ids
    /// must touch or overlap the ids already held; an unbounded range or an
    /// empty set replaces everything.
    pub fn add_models_in_range(&mut self, models: Vec<Model>, range: &QueryRange) -> Result<()> {
        let ids: Vec<String> = models.iter().map(|m| m.id().to_string()).collect();
        self.add_ids_in_range(ids, range)?;
        if let Some(set) = &mut self.inner {
            for model in models {
                set.models.insert(model.id().to_string(), model);
            }
        }
        Ok(())
    }

    pub fn add_ids_in_range(&mut self, range_ids: Vec<String>, range: &QueryRange) -> Result<()> {
        if range.is_infinite() || self.inner.is_none() {
            let models = self.inner.take().map(|s| s.models).unwrap_or_default();
            self.inner = Some(QueryResultSet {
                offset: range.offset,
                ids: range_ids,
                models,
                version: 0,
            });
            return Ok(());
        }
        let Some(set) = &mut self.inner else {
            return Ok(());
        };

        let current_end = set.offset + set.ids.len() as u64;
        let range_ids_end = range.offset + range_ids.len() as u64;
        if range_ids_end < set.offset {
            return Err(LiveDbError::Other(format!(
                "add_ids_in_range: only adjacent values can be added ({range_ids_end} < {})",
                set.offset
            )));
        }
        if range.offset > current_end {
            return Err(LiveDbError::Other(format!(
                "add_ids_in_range: only adjacent values can be added ({} > {current_end})",
                range.offset
            )));
        }

        let mut ids = Vec::with_capacity(set.ids.len() + range_ids.len());
        if range.offset > set.offset {
            ids.extend_from_slice(&set.ids[..(range.offset - set.offset) as usize]);
        }
        let filled = Some(range_ids.len() as u64) == range.limit;
        ids.extend(range_ids);
        // A short page means the query ended inside the range, so nothing
        // after it survives.
        if filled && current_end > range_ids_end {
            ids.extend_from_slice(&set.ids[(range_ids_end - set.offset) as usize..]);
        }
        set.ids = ids;
        set.offset = set.offset.min(range.offset);
        Ok(())
    }

    /// Drop ids outside `range` and models no longer referenced.
    pub fn clip_to_range(&mut self, range: &QueryRange) {
        let Some(set) = &mut self.inner else {
            return;
        };
        if range.offset > set.offset {
            let skip = ((range.offset - set.offset) as usize).min(set.ids.len());
            set.ids.drain(..skip);
            set.offset = range.offset;
        }
        if let Some(range_end) = range.end() {
            let current_end = set.offset + set.ids.len() as u64;
            if range_end < current_end {
                set.ids.truncate(range_end.saturating_sub(set.offset) as usize);
            }
        }
        let ids = &set.ids;
        set.models.retain(|id, _| ids.contains(id));
    }

    /// Replace the stored model for an id already in the set.
    pub fn update_model(&mut self, model: Model) {
        if let Some(set) = &mut self.inner {
            set.models.insert(model.id().to_string(), model);
        }
    }

    /// Remove an id and its model. Returns whether it was present.
    pub fn remove_model(&mut self, id: &str) -> bool {
        let Some(set) = &mut self.inner else {
            return false;
        };
        let before = set.ids.len();
        set.ids.retain(|candidate| candidate != id);
        set.models.remove(id);
        set.ids.len() != before
    }

    /// Insert a model at the position given by `compare`. Only valid for sets
    /// that hold the whole tail of the query.
    pub fn insert_sorted(&mut self, model: Model, compare: impl Fn(&Model, &Model) -> Ordering) {
        let set = self.inner.get_or_insert_with(|| QueryResultSet::empty(0));
        let index = set
            .ids
            .iter()
            .position(|id| {
                set.models
                    .get(id)
                    .is_some_and(|existing| compare(&model, existing) == Ordering::Less)
            })
            .unwrap_or(set.ids.len());
        set.ids.insert(index, model.id().to_string());
        set.models.insert(model.id().to_string(), model);
    }
}
