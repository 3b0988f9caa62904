use crate::attributes::Matcher;
use crate::error::{LiveDbError, Result};
use crate::schema::{ModelSchema, ModelType};
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

const TEMP_ID_PREFIX: &str = "local-";

/// Generate a locally-unique temporary id such as `local-1f0c9a2e-77b1`.
pub fn generate_temp_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{TEMP_ID_PREFIX}{}-{}", &hex[..8], &hex[8..12])
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// An immutable snapshot of one record.
///
/// Values are keyed by model key and already coerced by their attribute.
/// Updating a field produces a new `Model`; instances handed out by the
/// database are never changed afterwards.
#[derive(Debug, Clone)]
pub struct Model {
    schema: Arc<ModelSchema>,
    id: String,
    values: BTreeMap<String, Value>,
}

impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        self.schema.class() == other.schema.class() && self.id == other.id && self.values == other.values
    }
}

impl Model {
    /// A new, unsaved model with a temporary id.
    pub fn new(schema: Arc<ModelSchema>) -> Self {
        Self::with_id(schema, &generate_temp_id())
    }

    pub fn with_id(schema: Arc<ModelSchema>, id: &str) -> Self {
        let mut values = BTreeMap::new();
        values.insert("id".to_string(), Value::String(id.to_string()));
        Model {
            schema,
            id: id.to_string(),
            values,
        }
    }

    /// Inflate a model from its wire representation (keys are JSON keys).
    /// Keys the schema doesn't know are dropped.
    pub fn from_json(schema: Arc<ModelSchema>, json: &Value) -> Result<Self> {
        let Value::Object(map) = json else {
            return Err(LiveDbError::Other(format!(
                "{}: expected a JSON object, got {json}",
                schema.class()
            )));
        };
        let id = match map.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => generate_temp_id(),
        };
        let mut model = Model::with_id(schema, &id);
        for (key, value) in map {
            if key == "id" {
                continue;
            }
            if let Some(attribute) = model.schema.attribute_by_json_key(key) {
                let coerced = attribute.from_json(value);
                model.values.insert(attribute.model_key().to_string(), coerced);
            }
        }
        Ok(model)
    }

    /// Build a model from a typed value.
    pub fn encode<T: ModelType>(schema: Arc<ModelSchema>, value: &T) -> Result<Self> {
        if schema.class() != T::CLASS {
            return Err(LiveDbError::Other(format!(
                "Cannot encode {} as {}",
                T::CLASS,
                schema.class()
            )));
        }
        Self::from_json(schema, &serde_json::to_value(value)?)
    }

    /// Deserialize into a typed value. Joined data is included when loaded.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_json(true))?)
    }

    /// Wire representation keyed by JSON keys.
    pub fn to_json(&self, include_joined: bool) -> Value {
        let mut map = Map::new();
        for attribute in self.schema.attributes() {
            if attribute.is_joined_data() && !include_joined {
                continue;
            }
            if let Some(value) = self.values.get(attribute.model_key()) {
                map.insert(attribute.json_key_name().to_string(), value.clone());
            }
        }
        Value::Object(map)
    }

    /// A copy of this model with one value replaced. Unknown keys are
    /// ignored with a warning.
    pub fn with(&self, model_key: &str, value: impl Into<Value>) -> Model {
        let mut next = self.clone();
        match self.schema.attribute(model_key) {
            Some(_) if model_key == "id" => {
                log::warn!("{}: use Model::with_id to change ids", self.schema.class());
            }
            Some(attribute) => {
                next.values
                    .insert(model_key.to_string(), attribute.from_json(&value.into()));
            }
            None => {
                log::warn!("{}: no attribute named '{model_key}'", self.schema.class());
            }
        }
        next
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn class(&self) -> &str {
        self.schema.class()
    }

    pub fn schema(&self) -> &Arc<ModelSchema> {
        &self.schema
    }

    pub fn get(&self, model_key: &str) -> Option<&Value> {
        self.values.get(model_key)
    }

    pub fn str(&self, model_key: &str) -> Option<&str> {
        self.get(model_key).and_then(Value::as_str)
    }

    pub fn number(&self, model_key: &str) -> Option<f64> {
        self.get(model_key).and_then(Value::as_f64)
    }

    pub fn bool(&self, model_key: &str) -> Option<bool> {
        self.get(model_key).and_then(Value::as_bool)
    }

    pub fn datetime(&self, model_key: &str) -> Option<DateTime<Utc>> {
        let seconds = self.get(model_key).and_then(Value::as_i64)?;
        Utc.timestamp_opt(seconds, 0).single()
    }

    pub fn is_saved(&self) -> bool {
        !is_temp_id(&self.id)
    }

    /// Whether every matcher accepts this model.
    pub fn matches(&self, matchers: &[Matcher]) -> bool {
        matchers.iter().all(|m| m.evaluate(self))
    }

    pub(crate) fn set_loaded(&mut self, model_key: &str, value: Value) {
        self.values.insert(model_key.to_string(), value);
    }

    pub(crate) fn unset_loaded(&mut self, model_key: &str) {
        self.values.remove(model_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::Attribute;
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    fn schema() -> Arc<ModelSchema> {
        Arc::new(
            ModelSchema::builder("Message")
                .attribute(Attribute::string("threadId").queryable().json_key("thread_id"))
                .attribute(Attribute::datetime("date").queryable())
                .attribute(Attribute::boolean("unread").queryable())
                .attribute(Attribute::joined_data("body", "MessageBody"))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_temp_ids() {
        let id = generate_temp_id();
        assert!(is_temp_id(&id));
        assert_eq!(id.len(), "local-".len() + 8 + 1 + 4);
        assert!(!Model::new(schema()).is_saved());
        assert!(Model::with_id(schema(), "m1").is_saved());
    }

    #[test]
    fn test_json_keys_round_through_model_keys() {
        let model = Model::from_json(
            schema(),
            &json!({"id": "m1", "thread_id": "t1", "unread": 1, "bogus": true, "body": "<p>hi</p>"}),
        )
        .unwrap();
        assert_eq!(model.str("threadId"), Some("t1"));
        assert_eq!(model.bool("unread"), Some(true));
        assert!(model.get("bogus").is_none());
        assert_eq!(model.to_json(false), json!({"id": "m1", "thread_id": "t1", "unread": true}));
        assert_eq!(model.to_json(true)["body"], json!("<p>hi</p>"));
    }

    #[test]
    fn test_with_returns_new_snapshot() {
        let original = Model::with_id(schema(), "m1").with("unread", true);
        let updated = original.with("unread", false);
        assert_eq!(original.bool("unread"), Some(true));
        assert_eq!(updated.bool("unread"), Some(false));
        assert_eq!(updated.id(), "m1");
        assert_eq!(updated.with("missing", 1), updated);
    }

    #[test]
    fn test_datetime_access() {
        let model = Model::with_id(schema(), "m1").with("date", "2020-01-01T00:00:00Z");
        assert_eq!(model.number("date"), Some(1577836800.0));
        assert_eq!(
            model.datetime("date").unwrap().to_rfc3339(),
            "2020-01-01T00:00:00+00:00"
        );
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Message {
        id: String,
        thread_id: String,
        #[serde(default)]
        unread: bool,
    }

    impl ModelType for Message {
        const CLASS: &'static str = "Message";

        fn schema() -> Result<ModelSchema> {
            Ok((*schema()).clone())
        }
    }

    #[test]
    fn test_typed_encode_decode() {
        let typed = Message {
            id: "m9".into(),
            thread_id: "t2".into(),
            unread: true,
        };
        let model = Model::encode(schema(), &typed).unwrap();
        assert_eq!(model.id(), "m9");
        assert_eq!(model.decode::<Message>().unwrap(), typed);
    }
}
