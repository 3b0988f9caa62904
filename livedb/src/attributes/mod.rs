pub mod matcher;
pub mod sort_order;
pub mod value;

pub use matcher::{Comparator, Matcher};
pub use sort_order::{Direction, SortOrder};

use crate::error::{LiveDbError, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

/// The semantic type of an attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeKind {
    String,
    Number,
    Boolean,
    /// Stored and compared as unix seconds.
    DateTime,
    Object,
    /// One-to-many relationship kept in a `<Class><ItemClass>` join table.
    Collection {
        item_class: String,
        join_on_field: String,
        join_queryable_by: Vec<String>,
    },
    /// A large value kept in its own table and loaded only when included.
    JoinedData { table: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    model_key: String,
    json_key: String,
    kind: AttributeKind,
    queryable: bool,
}

impl Attribute {
    fn new(model_key: &str, kind: AttributeKind) -> Self {
        Attribute {
            model_key: model_key.to_string(),
            json_key: model_key.to_string(),
            kind,
            queryable: false,
        }
    }

    pub fn string(model_key: &str) -> Self {
        Self::new(model_key, AttributeKind::String)
    }

    pub fn number(model_key: &str) -> Self {
        Self::new(model_key, AttributeKind::Number)
    }

    pub fn boolean(model_key: &str) -> Self {
        Self::new(model_key, AttributeKind::Boolean)
    }

    pub fn datetime(model_key: &str) -> Self {
        Self::new(model_key, AttributeKind::DateTime)
    }

    pub fn object(model_key: &str) -> Self {
        Self::new(model_key, AttributeKind::Object)
    }

    pub fn collection(model_key: &str, item_class: &str) -> Self {
        Self::new(
            model_key,
            AttributeKind::Collection {
                item_class: item_class.to_string(),
                join_on_field: "id".to_string(),
                join_queryable_by: Vec::new(),
            },
        )
    }

    pub fn joined_data(model_key: &str, table: &str) -> Self {
        Self::new(
            model_key,
            AttributeKind::JoinedData {
                table: table.to_string(),
            },
        )
    }

    /// Use a different key in JSON payloads and store columns.
    pub fn json_key(mut self, key: &str) -> Self {
        self.json_key = key.to_string();
        self
    }

    /// Allow filtering and sorting on this attribute.
    pub fn queryable(mut self) -> Self {
        self.queryable = true;
        self
    }

    /// For collections: the item field stored in the join table's `value` column.
    pub fn join_on(mut self, field: &str) -> Self {
        if let AttributeKind::Collection { join_on_field, .. } = &mut self.kind {
            *join_on_field = field.to_string();
        }
        self
    }

    /// For collections: parent attributes copied into the join table.
    pub fn join_queryable_by(mut self, keys: &[&str]) -> Self {
        if let AttributeKind::Collection {
            join_queryable_by, ..
        } = &mut self.kind
        {
            *join_queryable_by = keys.iter().map(|k| k.to_string()).collect();
        }
        self
    }

    pub fn model_key(&self) -> &str {
        &self.model_key
    }

    pub fn json_key_name(&self) -> &str {
        &self.json_key
    }

    pub fn kind(&self) -> &AttributeKind {
        &self.kind
    }

    pub fn is_queryable(&self) -> bool {
        self.queryable
    }

    /// Whether the value lives in a column of the model's primary table.
    pub fn has_column(&self) -> bool {
        self.queryable
            && !matches!(
                self.kind,
                AttributeKind::Collection { .. } | AttributeKind::JoinedData { .. }
            )
    }

    pub fn is_joined_data(&self) -> bool {
        matches!(self.kind, AttributeKind::JoinedData { .. })
    }

    pub fn column_type(&self) -> &'static str {
        match self.kind {
            AttributeKind::Number => "REAL",
            AttributeKind::Boolean | AttributeKind::DateTime => "INTEGER",
            _ => "TEXT",
        }
    }

    // ── Codec ──────────────────────────────────────────────────────

    /// Coerce a wire value into the model representation.
    pub fn from_json(&self, value: &Value) -> Value {
        match (&self.kind, value) {
            (_, Value::Null) => Value::Null,
            (AttributeKind::Boolean, Value::Number(n)) => Value::Bool(n.as_f64() != Some(0.0)),
            (AttributeKind::Boolean, Value::String(s)) => Value::Bool(s == "true" || s == "1"),
            (AttributeKind::Number, Value::String(s)) => s
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            (AttributeKind::DateTime, Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|dt| Value::Number(dt.timestamp().into()))
                .unwrap_or(Value::Null),
            (AttributeKind::String, Value::Number(n)) => Value::String(n.to_string()),
            (AttributeKind::Collection { .. }, Value::Array(_)) => value.clone(),
            (AttributeKind::Collection { .. }, _) => Value::Array(Vec::new()),
            _ => value.clone(),
        }
    }

    /// Value bound to this attribute's column when persisting.
    pub fn to_column(&self, value: &Value) -> SqlValue {
        value::to_sql_value(value)
    }

    /// Items referenced by a collection value, as stored in the join table.
    pub fn collection_keys(&self, value: &Value) -> Vec<Value> {
        let AttributeKind::Collection { join_on_field, .. } = &self.kind else {
            return Vec::new();
        };
        value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match item {
                        Value::Object(map) => map.get(join_on_field).cloned(),
                        Value::String(_) | Value::Number(_) => Some(item.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    // ── Matchers ───────────────────────────────────────────────────

    fn assert_queryable(&self, op: &str) -> Result<()> {
        if !self.queryable {
            return Err(LiveDbError::InvalidQuery(format!(
                "Attribute::{op} ({}) - this field cannot be queried against",
                self.model_key
            )));
        }
        Ok(())
    }

    fn assert_kind(&self, op: &str, allowed: &[fn(&AttributeKind) -> bool]) -> Result<()> {
        if allowed.iter().any(|check| check(&self.kind)) {
            Ok(())
        } else {
            Err(LiveDbError::InvalidQuery(format!(
                "Attribute::{op} ({}) - not supported for {:?} attributes",
                self.model_key, self.kind
            )))
        }
    }

    fn scalar(&self, op: &str) -> Result<()> {
        self.assert_queryable(op)?;
        self.assert_kind(
            op,
            &[|k| {
                !matches!(
                    k,
                    AttributeKind::Collection { .. } | AttributeKind::JoinedData { .. }
                )
            }],
        )
    }

    fn ordered(&self, op: &str) -> Result<()> {
        self.assert_queryable(op)?;
        self.assert_kind(
            op,
            &[
                |k| matches!(k, AttributeKind::Number),
                |k| matches!(k, AttributeKind::DateTime),
                |k| matches!(k, AttributeKind::String),
            ],
        )
    }

    fn matcher(&self, comparator: Comparator, value: Value) -> Matcher {
        Matcher::Compare {
            attribute: self.clone(),
            comparator,
            value: self.from_json(&value),
        }
    }

    pub fn equal(&self, value: impl Into<Value>) -> Result<Matcher> {
        self.scalar("equal")?;
        Ok(self.matcher(Comparator::Equal, value.into()))
    }

    pub fn not(&self, value: impl Into<Value>) -> Result<Matcher> {
        self.scalar("not")?;
        Ok(self.matcher(Comparator::NotEqual, value.into()))
    }

    /// Matches models whose value is one of `values`. A single value becomes
    /// an equality matcher; an empty list is legal but matches nothing.
    pub fn is_in<V: Into<Value>>(&self, values: impl IntoIterator<Item = V>) -> Result<Matcher> {
        self.scalar("in")?;
        let mut values: Vec<Value> = values.into_iter().map(|v| self.from_json(&v.into())).collect();
        if values.is_empty() {
            log::warn!(
                "Attribute::in ({}) called with an empty set. You should avoid this useless query!",
                self.model_key
            );
        }
        if values.len() == 1 {
            return Ok(self.matcher(Comparator::Equal, values.remove(0)));
        }
        Ok(Matcher::Compare {
            attribute: self.clone(),
            comparator: Comparator::In,
            value: Value::Array(values),
        })
    }

    pub fn greater_than(&self, value: impl Into<Value>) -> Result<Matcher> {
        self.ordered("greater_than")?;
        Ok(self.matcher(Comparator::GreaterThan, value.into()))
    }

    pub fn greater_than_or_equal(&self, value: impl Into<Value>) -> Result<Matcher> {
        self.ordered("greater_than_or_equal")?;
        Ok(self.matcher(Comparator::GreaterThanOrEqual, value.into()))
    }

    pub fn less_than(&self, value: impl Into<Value>) -> Result<Matcher> {
        self.ordered("less_than")?;
        Ok(self.matcher(Comparator::LessThan, value.into()))
    }

    pub fn less_than_or_equal(&self, value: impl Into<Value>) -> Result<Matcher> {
        self.ordered("less_than_or_equal")?;
        Ok(self.matcher(Comparator::LessThanOrEqual, value.into()))
    }

    /// Case-insensitive substring match on string attributes.
    pub fn like(&self, value: &str) -> Result<Matcher> {
        self.assert_queryable("like")?;
        self.assert_kind("like", &[|k| matches!(k, AttributeKind::String)])?;
        Ok(self.matcher(Comparator::Like, Value::String(value.to_string())))
    }

    /// Matches models whose collection holds an item keyed by `value`.
    pub fn contains(&self, value: impl Into<Value>) -> Result<Matcher> {
        self.assert_queryable("contains")?;
        self.assert_kind("contains", &[|k| matches!(k, AttributeKind::Collection { .. })])?;
        Ok(Matcher::Compare {
            attribute: self.clone(),
            comparator: Comparator::Contains,
            value: value.into(),
        })
    }

    pub fn contains_any<V: Into<Value>>(&self, values: impl IntoIterator<Item = V>) -> Result<Matcher> {
        self.assert_queryable("contains_any")?;
        self.assert_kind("contains_any", &[|k| matches!(k, AttributeKind::Collection { .. })])?;
        Ok(Matcher::Compare {
            attribute: self.clone(),
            comparator: Comparator::ContainsAny,
            value: Value::Array(values.into_iter().map(Into::into).collect()),
        })
    }

    pub fn ascending(&self) -> SortOrder {
        SortOrder::new(self.clone(), Direction::Asc)
    }

    pub fn descending(&self) -> SortOrder {
        SortOrder::new(self.clone(), Direction::Desc)
    }
}

/// Unix seconds for a datetime, the representation used by `DateTime` attributes.
pub fn datetime_value(dt: DateTime<Utc>) -> Value {
    Value::Number(dt.timestamp().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_non_queryable_attribute_rejects_matchers() {
        let snippet = Attribute::string("snippet");
        let err = snippet.equal("x").unwrap_err();
        assert!(matches!(err, LiveDbError::InvalidQuery(_)));
        assert!(err.to_string().contains("cannot be queried"));
    }

    #[test]
    fn test_single_value_in_becomes_equal() {
        let account = Attribute::string("accountId").queryable();
        match account.is_in(["a"]).unwrap() {
            Matcher::Compare { comparator, value, .. } => {
                assert_eq!(comparator, Comparator::Equal);
                assert_eq!(value, json!("a"));
            }
            other => panic!("unexpected matcher {other:?}"),
        }
    }

    #[test]
    fn test_empty_in_is_legal() {
        let account = Attribute::string("accountId").queryable();
        let matcher = account.is_in(Vec::<String>::new()).unwrap();
        assert!(matches!(matcher, Matcher::Compare { comparator: Comparator::In, .. }));
    }

    #[test]
    fn test_ordered_comparators_need_ordered_kinds() {
        let unread = Attribute::boolean("unread").queryable();
        assert!(unread.greater_than(1).is_err());
        let ts = Attribute::number("ts").queryable();
        assert!(ts.greater_than(1).is_ok());
    }

    #[test]
    fn test_codec_coercions() {
        let unread = Attribute::boolean("unread");
        assert_eq!(unread.from_json(&json!(1)), json!(true));
        let when = Attribute::datetime("date");
        assert_eq!(when.from_json(&json!("1970-01-01T00:01:00Z")), json!(60));
        let categories = Attribute::collection("categories", "Category");
        assert_eq!(categories.from_json(&json!("nope")), json!([]));
    }

    #[test]
    fn test_collection_keys() {
        let categories = Attribute::collection("categories", "Category").queryable();
        let value = json!([{"id": "c1", "name": "Inbox"}, {"id": "c2"}, {"name": "no id"}]);
        assert_eq!(categories.collection_keys(&value), vec![json!("c1"), json!("c2")]);
    }

    #[test]
    fn test_has_column() {
        assert!(Attribute::string("a").queryable().has_column());
        assert!(!Attribute::string("a").has_column());
        assert!(!Attribute::collection("c", "Item").queryable().has_column());
        assert!(!Attribute::joined_data("body", "MessageBody").has_column());
    }
}
