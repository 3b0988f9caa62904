use super::value::compare_values;
use super::Attribute;
use crate::error::{LiveDbError, Result};
use crate::model::Model;
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    fn sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// An immutable (attribute, direction) ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct SortOrder {
    attribute: Attribute,
    direction: Direction,
}

impl SortOrder {
    pub(crate) fn new(attribute: Attribute, direction: Direction) -> Self {
        SortOrder {
            attribute,
            direction,
        }
    }

    pub fn attribute(&self) -> &Attribute {
        &self.attribute
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.attribute.has_column() {
            return Err(LiveDbError::InvalidQuery(format!(
                "SortOrder ({}) - this field cannot be used for ordering",
                self.attribute.model_key()
            )));
        }
        Ok(())
    }

    pub fn order_by_sql(&self, class: &str) -> String {
        format!(
            "`{class}`.`{}` {}",
            self.attribute.json_key_name(),
            self.direction.sql()
        )
    }

    /// The value this ordering reads from a model.
    pub fn key<'a>(&self, model: &'a Model) -> &'a Value {
        model.get(self.attribute.model_key()).unwrap_or(&Value::Null)
    }

    pub fn compare(&self, a: &Model, b: &Model) -> Ordering {
        let ordering = compare_values(self.key(a), self.key(b));
        match self.direction {
            Direction::Asc => ordering,
            Direction::Desc => ordering.reverse(),
        }
    }
}

/// Compare two models by a list of sort orders with `id` as the final tiebreaker.
pub fn compare_models(orders: &[SortOrder], a: &Model, b: &Model) -> Ordering {
    orders
        .iter()
        .map(|order| order.compare(a, b))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or_else(|| a.id().as_bytes().cmp(b.id().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ModelSchema;
    use serde_json::json;
    use std::sync::Arc;

    fn schema() -> Arc<ModelSchema> {
        Arc::new(
            ModelSchema::builder("Thread")
                .attribute(Attribute::number("ts").queryable())
                .attribute(Attribute::string("snippet"))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_compare_with_id_tiebreaker() {
        let schema = schema();
        let ts = schema.attribute("ts").unwrap();
        let a = Model::from_json(schema.clone(), &json!({"id": "a", "ts": 2})).unwrap();
        let b = Model::from_json(schema.clone(), &json!({"id": "b", "ts": 2})).unwrap();
        let c = Model::from_json(schema.clone(), &json!({"id": "c", "ts": 5})).unwrap();

        let desc = [ts.descending()];
        assert_eq!(compare_models(&desc, &c, &a), Ordering::Less);
        assert_eq!(compare_models(&desc, &a, &b), Ordering::Less);
        assert_eq!(compare_models(&[ts.ascending()], &c, &a), Ordering::Greater);
    }

    #[test]
    fn test_sql_and_validation() {
        let schema = schema();
        assert_eq!(
            schema.attribute("ts").unwrap().descending().order_by_sql("Thread"),
            "`Thread`.`ts` DESC"
        );
        assert!(schema.attribute("snippet").unwrap().ascending().validate().is_err());
    }
}
