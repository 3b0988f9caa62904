pub mod builder;
pub mod mutable_result_set;
pub mod range;
pub mod result_set;
pub mod sql;

pub use builder::QueryBuilder;
pub use mutable_result_set::MutableResultSet;
pub use range::QueryRange;
pub use result_set::QueryResultSet;

use crate::attributes::sort_order::compare_models;
use crate::attributes::{Attribute, Matcher, SortOrder};
use crate::model::Model;
use crate::schema::ModelSchema;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    List,
    One,
    Count,
}

/// A finalized query. Its rendered SQL doubles as its signature: two queries
/// with the same class, matchers, ordering, range and mode render the same.
#[derive(Debug, Clone)]
pub struct Query {
    schema: Arc<ModelSchema>,
    matchers: Vec<Matcher>,
    orders: Vec<SortOrder>,
    range: QueryRange,
    mode: QueryMode,
    includes: Vec<Attribute>,
    distinct: bool,
    sql: String,
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        self.sql == other.sql
    }
}

impl Query {
    pub fn schema(&self) -> &Arc<ModelSchema> {
        &self.schema
    }

    pub fn class(&self) -> &str {
        self.schema.class()
    }

    pub fn matchers(&self) -> &[Matcher] {
        &self.matchers
    }

    /// Effective ordering: explicit orders, else the class's natural sort.
    pub fn orders(&self) -> &[SortOrder] {
        &self.orders
    }

    pub fn range(&self) -> QueryRange {
        self.range
    }

    pub fn mode(&self) -> QueryMode {
        self.mode
    }

    pub fn includes(&self) -> &[Attribute] {
        &self.includes
    }

    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    pub fn is_searching(&self) -> bool {
        self.matchers.iter().any(Matcher::is_search)
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn signature(&self) -> &str {
        &self.sql
    }

    /// The same query over a different window.
    pub fn with_range(&self, range: QueryRange) -> Query {
        let mut query = self.clone();
        query.range = range;
        query.sql = sql::select_sql(&query);
        query
    }

    /// In-memory evaluation of every matcher.
    pub fn matches(&self, model: &Model) -> bool {
        model.class() == self.class() && model.matches(&self.matchers)
    }

    /// Result order of two models, `id` breaking ties.
    pub fn compare(&self, a: &Model, b: &Model) -> Ordering {
        compare_models(&self.orders, a, b)
    }

    /// Whether two snapshots of one model agree on every sort key.
    pub fn same_sort_keys(&self, a: &Model, b: &Model) -> bool {
        self.orders
            .iter()
            .all(|order| crate::attributes::value::values_equal(order.key(a), order.key(b)))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}
