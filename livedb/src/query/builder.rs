use super::range::QueryRange;
use super::{sql, Query, QueryMode};
use crate::attributes::{Attribute, Matcher, SortOrder};
use crate::error::{LiveDbError, Result};
use crate::schema::ModelSchema;
use serde_json::Value;
use std::sync::Arc;

/// Accumulates matchers, orderings and a range, then finalizes into an
/// immutable [`Query`] with [`build`](QueryBuilder::build). Consuming the
/// builder is what finalizes it, so a query can't change once rendered.
///
/// ```ignore
/// let threads = QueryBuilder::find_all(schema.clone())
///     .where_(account.equal("a")?)
///     .order(ts.descending())
///     .limit(4)
///     .offset(2)
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    schema: Arc<ModelSchema>,
    matchers: Vec<Matcher>,
    orders: Vec<SortOrder>,
    range: QueryRange,
    mode: QueryMode,
    includes: Vec<Attribute>,
    distinct: bool,
    error: Option<String>,
}

impl QueryBuilder {
    pub fn find_all(schema: Arc<ModelSchema>) -> Self {
        QueryBuilder {
            schema,
            matchers: Vec::new(),
            orders: Vec::new(),
            range: QueryRange::infinite(),
            mode: QueryMode::List,
            includes: Vec::new(),
            distinct: false,
            error: None,
        }
    }

    /// Single model by id.
    pub fn find(schema: Arc<ModelSchema>, id: &str) -> Self {
        Self::find_all(schema)
            .where_eq([("id", Value::String(id.to_string()))])
            .one()
    }

    /// First model matching every matcher.
    pub fn find_by(schema: Arc<ModelSchema>, matchers: Vec<Matcher>) -> Self {
        Self::find_all(schema).where_all(matchers).one()
    }

    pub fn count(schema: Arc<ModelSchema>) -> Self {
        Self::find_all(schema).count_mode()
    }

    fn fail(mut self, message: String) -> Self {
        self.error.get_or_insert(message);
        self
    }

    pub fn where_(mut self, matcher: Matcher) -> Self {
        if matcher.is_search() && self.matchers.iter().any(Matcher::is_search) {
            return self.fail("Only one search matcher is allowed per query".to_string());
        }
        if matcher.needs_distinct() {
            self.distinct = true;
        }
        self.matchers.push(matcher);
        self
    }

    pub fn where_all(self, matchers: impl IntoIterator<Item = Matcher>) -> Self {
        matchers.into_iter().fold(self, QueryBuilder::where_)
    }

    /// One equality matcher per `(model_key, value)` pair.
    pub fn where_eq<K: AsRef<str>, V: Into<Value>>(self, pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        let mut builder = self;
        for (key, value) in pairs {
            let key = key.as_ref();
            let matcher = match builder.schema.attribute(key) {
                Some(attribute) => attribute.equal(value),
                None => Err(LiveDbError::InvalidQuery(format!(
                    "Cannot create where clause `{key}:{}`. {key} is not an attribute of {}",
                    value.into(),
                    builder.schema.class()
                ))),
            };
            builder = match matcher {
                Ok(matcher) => builder.where_(matcher),
                Err(e) => builder.fail(e.to_string()),
            };
        }
        builder
    }

    /// Full-text match against the class search index.
    pub fn search(self, text: &str) -> Self {
        if !self.schema.is_searchable() {
            let class = self.schema.class().to_string();
            return self.fail(format!("{class} has no search index"));
        }
        self.where_(Matcher::search(text))
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.orders.push(order);
        self
    }

    pub fn order_all(self, orders: impl IntoIterator<Item = SortOrder>) -> Self {
        orders.into_iter().fold(self, QueryBuilder::order)
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.range.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.range.offset = offset;
        self
    }

    pub fn range(mut self, range: QueryRange) -> Self {
        self.range = range;
        self
    }

    /// Return only the first result.
    pub fn one(mut self) -> Self {
        self.mode = QueryMode::One;
        self.range.limit = Some(1);
        self
    }

    fn count_mode(mut self) -> Self {
        self.mode = QueryMode::Count;
        self
    }

    /// Load a joined-data attribute with each model.
    pub fn include(mut self, model_key: &str) -> Self {
        match self.schema.attribute(model_key) {
            Some(attribute) if attribute.is_joined_data() => {
                let attribute = attribute.clone();
                if !self.includes.contains(&attribute) {
                    self.includes.push(attribute);
                }
                self
            }
            _ => {
                let class = self.schema.class().to_string();
                self.fail(format!("{model_key} is not a joined data attribute of {class}"))
            }
        }
    }

    /// Include every joined-data attribute.
    pub fn include_all(self) -> Self {
        let keys: Vec<String> = self
            .schema
            .joined_attributes()
            .map(|a| a.model_key().to_string())
            .collect();
        keys.iter().fold(self, |builder, key| builder.include(key))
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn build(self) -> Result<Query> {
        if let Some(message) = self.error {
            return Err(LiveDbError::InvalidQuery(message));
        }
        for order in &self.orders {
            order.validate()?;
        }
        let orders = if self.orders.is_empty() {
            self.schema.natural_sort().to_vec()
        } else {
            self.orders
        };
        let mut query = Query {
            schema: self.schema,
            matchers: self.matchers,
            orders,
            range: self.range,
            mode: self.mode,
            includes: self.includes,
            distinct: self.distinct,
            sql: String::new(),
        };
        query.sql = sql::select_sql(&query);
        Ok(query)
    }
}
