pub mod broadcast;
pub mod debouncer;

pub use broadcast::{ChangeBroadcast, ChangeEnvelope, LocalBroadcastHub};
pub use debouncer::ChangeRecordDebouncer;

use crate::error::{LiveDbError, Result};
use crate::model::Model;
use crate::schema::SchemaRegistry;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Persist,
    Unpersist,
}

/// A batch of models of one class that were all persisted or all removed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    class: String,
    kind: ChangeKind,
    objects: Vec<Model>,
}

impl ChangeRecord {
    pub fn new(class: &str, kind: ChangeKind, objects: Vec<Model>) -> Result<Self> {
        if let Some(other) = objects.iter().find(|m| m.class() != class) {
            return Err(LiveDbError::Other(format!(
                "ChangeRecord for {class} cannot hold a {}",
                other.class()
            )));
        }
        let mut record = ChangeRecord {
            class: class.to_string(),
            kind,
            objects: Vec::with_capacity(objects.len()),
        };
        for model in objects {
            record.push(model);
        }
        Ok(record)
    }

    pub fn persist(model: Model) -> Self {
        ChangeRecord {
            class: model.class().to_string(),
            kind: ChangeKind::Persist,
            objects: vec![model],
        }
    }

    pub fn unpersist(model: Model) -> Self {
        ChangeRecord {
            class: model.class().to_string(),
            kind: ChangeKind::Unpersist,
            objects: vec![model],
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    pub fn objects(&self) -> &[Model] {
        &self.objects
    }

    pub fn object_ids(&self) -> Vec<&str> {
        self.objects.iter().map(Model::id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn can_append(&self, other: &ChangeRecord) -> bool {
        self.class == other.class && self.kind == other.kind
    }

    /// Merge `other` into this record. The last write for an id wins and
    /// keeps the position of the first one.
    pub fn append(&mut self, other: ChangeRecord) -> Result<()> {
        if !self.can_append(&other) {
            return Err(LiveDbError::Other(format!(
                "Cannot append {:?} {} to {:?} {}",
                other.kind, other.class, self.kind, self.class
            )));
        }
        for model in other.objects {
            self.push(model);
        }
        Ok(())
    }

    fn push(&mut self, model: Model) {
        match self.objects.iter_mut().find(|m| m.id() == model.id()) {
            Some(existing) => *existing = model,
            None => self.objects.push(model),
        }
    }

    pub fn to_wire(&self) -> WireChangeRecord {
        WireChangeRecord {
            object_class: self.class.clone(),
            kind: self.kind,
            objects: self.objects.iter().map(|m| m.to_json(true)).collect(),
        }
    }

    /// Inflate a wire record. Classes the registry doesn't know yield `None`.
    pub fn from_wire(wire: WireChangeRecord, registry: &SchemaRegistry) -> Result<Option<Self>> {
        let Some(schema) = registry.get(&wire.object_class) else {
            log::debug!("Ignoring change record for unknown class {}", wire.object_class);
            return Ok(None);
        };
        let objects = wire
            .objects
            .iter()
            .map(|json| Model::from_json(schema.clone(), json))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(ChangeRecord::new(&wire.object_class, wire.kind, objects)?))
    }
}

/// Serialized form of a [`ChangeRecord`]: the class name is the type tag used
/// to find the schema on the receiving side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireChangeRecord {
    #[serde(rename = "objectClass")]
    pub object_class: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub objects: Vec<Value>,
}
