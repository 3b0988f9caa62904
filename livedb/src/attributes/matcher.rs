use super::value::{compare_values, escape_like, escape_single_quotes, sql_literal, values_equal};
use super::{Attribute, AttributeKind};
use crate::error::{LiveDbError, Result};
use crate::model::Model;
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Equal,
    NotEqual,
    In,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Like,
    Contains,
    ContainsAny,
}

impl Comparator {
    fn sql(&self) -> &'static str {
        match self {
            Comparator::Equal | Comparator::Contains => "=",
            Comparator::NotEqual => "!=",
            Comparator::In | Comparator::ContainsAny => "IN",
            Comparator::LessThan => "<",
            Comparator::LessThanOrEqual => "<=",
            Comparator::GreaterThan => ">",
            Comparator::GreaterThanOrEqual => ">=",
            Comparator::Like => "LIKE",
        }
    }
}

/// An immutable predicate. Matchers render to a SQL `WHERE` fragment and can
/// be evaluated in memory against a model with the same result.
#[derive(Debug, Clone, PartialEq)]
pub enum Matcher {
    Compare {
        attribute: Attribute,
        comparator: Comparator,
        value: Value,
    },
    /// Matches when any of the inner matchers does.
    Any(Vec<Matcher>),
    /// Full-text match against the class search index.
    Search { query: String },
}

impl Matcher {
    /// OR together several column matchers. Join matchers cannot be nested.
    pub fn any(matchers: Vec<Matcher>) -> Result<Matcher> {
        if matchers.iter().any(Matcher::needs_join) {
            return Err(LiveDbError::InvalidQuery(
                "Matcher::any cannot contain collection or search matchers".to_string(),
            ));
        }
        Ok(Matcher::Any(matchers))
    }

    pub fn search(query: &str) -> Matcher {
        Matcher::Search {
            query: query.to_string(),
        }
    }

    pub fn needs_join(&self) -> bool {
        match self {
            Matcher::Compare { comparator, .. } => {
                matches!(comparator, Comparator::Contains | Comparator::ContainsAny)
            }
            Matcher::Search { .. } => true,
            Matcher::Any(_) => false,
        }
    }

    pub fn is_search(&self) -> bool {
        matches!(self, Matcher::Search { .. })
    }

    /// Whether rows joined by this matcher can repeat and need `DISTINCT`.
    pub fn needs_distinct(&self) -> bool {
        matches!(
            self,
            Matcher::Compare {
                comparator: Comparator::ContainsAny,
                ..
            }
        )
    }

    /// Evaluate against a model. Full-text matchers always match; their
    /// correctness is left to the next fetch.
    pub fn evaluate(&self, model: &Model) -> bool {
        match self {
            Matcher::Search { .. } => true,
            Matcher::Any(matchers) => matchers.iter().any(|m| m.evaluate(model)),
            Matcher::Compare {
                attribute,
                comparator,
                value,
            } => {
                let actual = model.get(attribute.model_key()).unwrap_or(&Value::Null);
                evaluate_compare(attribute, *comparator, actual, value)
            }
        }
    }

    /// `JOIN` clause for this matcher, if it needs one. `index` keeps aliases
    /// unique and deterministic.
    pub fn join_sql(&self, class: &str, index: usize) -> Option<String> {
        match self {
            Matcher::Compare { attribute, .. } if self.needs_join() => {
                let AttributeKind::Collection { item_class, .. } = attribute.kind() else {
                    return None;
                };
                let alias = format!("M{index}");
                Some(format!(
                    "INNER JOIN `{class}{item_class}` AS `{alias}` ON `{alias}`.`id` = `{class}`.`id`"
                ))
            }
            Matcher::Search { .. } => Some(format!(
                "INNER JOIN `{class}Search` ON `{class}Search`.`content_id` = `{class}`.`id`"
            )),
            _ => None,
        }
    }

    /// `WHERE` fragment for this matcher.
    pub fn where_sql(&self, class: &str, index: usize) -> String {
        match self {
            Matcher::Search { query } => {
                let phrase = query.replace('"', "");
                format!(
                    "`{class}Search` MATCH '\"{}\"'",
                    escape_single_quotes(&phrase)
                )
            }
            Matcher::Any(matchers) => {
                let parts: Vec<String> = matchers
                    .iter()
                    .enumerate()
                    .map(|(i, m)| m.where_sql(class, index + i))
                    .collect();
                format!("({})", parts.join(" OR "))
            }
            Matcher::Compare {
                attribute,
                comparator,
                value,
            } => {
                let column = match comparator {
                    Comparator::Contains | Comparator::ContainsAny => {
                        format!("`M{index}`.`value`")
                    }
                    _ => format!("`{class}`.`{}`", attribute.json_key_name()),
                };
                match (comparator, value) {
                    (Comparator::Equal, Value::Null) => format!("{column} IS NULL"),
                    (Comparator::NotEqual, Value::Null) => format!("{column} IS NOT NULL"),
                    (Comparator::In | Comparator::ContainsAny, Value::Array(items)) => {
                        let list: Vec<String> = items.iter().map(sql_literal).collect();
                        format!("{column} IN ({})", list.join(", "))
                    }
                    (Comparator::Like, Value::String(s)) => {
                        format!(
                            "{column} LIKE '%{}%' ESCAPE '\\'",
                            escape_single_quotes(&escape_like(s))
                        )
                    }
                    _ => format!("{column} {} {}", comparator.sql(), sql_literal(value)),
                }
            }
        }
    }
}

fn evaluate_compare(attribute: &Attribute, comparator: Comparator, actual: &Value, expected: &Value) -> bool {
    match comparator {
        Comparator::Equal => {
            if expected.is_null() || !actual.is_null() {
                values_equal(actual, expected)
            } else {
                false
            }
        }
        Comparator::NotEqual => {
            if expected.is_null() {
                !actual.is_null()
            } else {
                !actual.is_null() && !values_equal(actual, expected)
            }
        }
        Comparator::In => match expected {
            Value::Array(items) => {
                !actual.is_null() && items.iter().any(|item| values_equal(actual, item))
            }
            _ => false,
        },
        Comparator::LessThan => ordered(actual, expected, |o| o == Ordering::Less),
        Comparator::LessThanOrEqual => ordered(actual, expected, |o| o != Ordering::Greater),
        Comparator::GreaterThan => ordered(actual, expected, |o| o == Ordering::Greater),
        Comparator::GreaterThanOrEqual => ordered(actual, expected, |o| o != Ordering::Less),
        Comparator::Like => match (actual, expected) {
            (Value::String(haystack), Value::String(needle)) => haystack
                .to_ascii_lowercase()
                .contains(&needle.to_ascii_lowercase()),
            _ => false,
        },
        Comparator::Contains => attribute
            .collection_keys(actual)
            .iter()
            .any(|key| values_equal(key, expected)),
        Comparator::ContainsAny => {
            let keys = attribute.collection_keys(actual);
            match expected {
                Value::Array(items) => items
                    .iter()
                    .any(|item| keys.iter().any(|key| values_equal(key, item))),
                _ => false,
            }
        }
    }
}

fn ordered(actual: &Value, expected: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    if actual.is_null() || expected.is_null() {
        return false;
    }
    accept(compare_values(actual, expected))
}
