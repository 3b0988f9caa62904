use super::{Query, QueryMode};
use crate::attributes::value::{from_sql_value, to_sql_value};
use crate::attributes::AttributeKind;
use crate::error::Result;
use crate::model::Model;
use crate::schema::ModelSchema;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use std::sync::Arc;

/// A statement plus its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlCommand {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl SqlCommand {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        SqlCommand {
            sql: sql.into(),
            params,
        }
    }

    pub fn bare(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }
}

pub fn select_sql(query: &Query) -> String {
    let class = query.class();
    let mut parts = Vec::new();

    let distinct = if query.is_distinct() { "DISTINCT " } else { "" };
    if query.mode() == QueryMode::Count {
        if query.is_distinct() {
            parts.push(format!("SELECT COUNT(DISTINCT `{class}`.`id`) AS count"));
        } else {
            parts.push("SELECT COUNT(*) AS count".to_string());
        }
    } else {
        let mut columns = vec![format!("`{class}`.`data`")];
        for attribute in query.includes() {
            if let AttributeKind::JoinedData { table } = attribute.kind() {
                columns.push(format!("`{table}`.`value` AS `{}`", attribute.json_key_name()));
            }
        }
        parts.push(format!("SELECT {distinct}{}", columns.join(", ")));
    }
    parts.push(format!("FROM `{class}`"));

    for (index, matcher) in query.matchers().iter().enumerate() {
        if let Some(join) = matcher.join_sql(class, index) {
            parts.push(join);
        }
    }
    if query.mode() != QueryMode::Count {
        for attribute in query.includes() {
            if let AttributeKind::JoinedData { table } = attribute.kind() {
                parts.push(format!(
                    "LEFT OUTER JOIN `{table}` ON `{table}`.`id` = `{class}`.`id`"
                ));
            }
        }
    }

    if !query.matchers().is_empty() {
        let clauses: Vec<String> = query
            .matchers()
            .iter()
            .enumerate()
            .map(|(index, matcher)| matcher.where_sql(class, index))
            .collect();
        parts.push(format!("WHERE {}", clauses.join(" AND ")));
    }

    if query.mode() == QueryMode::Count {
        return parts.join(" ");
    }

    let mut orders: Vec<String> = query.orders().iter().map(|o| o.order_by_sql(class)).collect();
    if !query.orders().iter().any(|o| o.attribute().model_key() == "id") {
        orders.push(format!("`{class}`.`id` ASC"));
    }
    parts.push(format!("ORDER BY {}", orders.join(", ")));

    let range = query.range();
    match range.limit {
        Some(limit) if range.offset > 0 => parts.push(format!("LIMIT {limit} OFFSET {}", range.offset)),
        Some(limit) => parts.push(format!("LIMIT {limit}")),
        None if range.offset > 0 => parts.push(format!("LIMIT -1 OFFSET {}", range.offset)),
        None => {}
    }
    parts.join(" ")
}

/// Table and index DDL for one class.
pub fn setup_sql(schema: &ModelSchema) -> Vec<String> {
    let class = schema.class();
    let mut columns = vec!["id TEXT PRIMARY KEY".to_string(), "data TEXT".to_string()];
    for attribute in schema.column_attributes() {
        columns.push(format!("`{}` {}", attribute.json_key_name(), attribute.column_type()));
    }
    let mut statements = vec![format!(
        "CREATE TABLE IF NOT EXISTS `{class}` ({})",
        columns.join(", ")
    )];
    for attribute in schema.column_attributes() {
        let column = attribute.json_key_name();
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS `{class}_{column}` ON `{class}` (`{column}`)"
        ));
    }

    for attribute in schema.collection_attributes() {
        let AttributeKind::Collection {
            item_class,
            join_queryable_by,
            ..
        } = attribute.kind()
        else {
            continue;
        };
        let table = format!("{class}{item_class}");
        let mut join_columns = vec!["id TEXT KEY".to_string(), "`value` TEXT".to_string()];
        for key in join_queryable_by {
            if let Some(joined) = schema.attribute(key) {
                join_columns.push(format!("`{}` {}", joined.json_key_name(), joined.column_type()));
            }
        }
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS `{table}` ({})",
            join_columns.join(", ")
        ));
        statements.push(format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS `{table}_id_val` ON `{table}` (`id`, `value`)"
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS `{table}_value` ON `{table}` (`value`)"
        ));
    }

    for attribute in schema.joined_attributes() {
        if let AttributeKind::JoinedData { table } = attribute.kind() {
            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS `{table}` (id TEXT PRIMARY KEY, `value` TEXT)"
            ));
        }
    }

    if schema.is_searchable() {
        statements.push(create_search_index_sql(schema));
    }
    statements
}

pub fn search_table(class: &str) -> String {
    format!("{class}Search")
}

pub fn create_search_index_sql(schema: &ModelSchema) -> String {
    let fields: Vec<String> = schema.search_fields().iter().map(|f| format!("`{f}`")).collect();
    format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS `{}` USING fts5(tokenize='porter unicode61', content_id UNINDEXED, {})",
        search_table(schema.class()),
        fields.join(", ")
    )
}

/// Statements writing one model: main row, collection rows and joined data.
pub fn persist_commands(model: &Model) -> Result<Vec<SqlCommand>> {
    let schema = model.schema();
    let class = schema.class();
    let id = SqlValue::Text(model.id().to_string());

    let mut columns = vec!["id".to_string(), "data".to_string()];
    let mut params = vec![id.clone(), SqlValue::Text(serde_json::to_string(&model.to_json(false))?)];
    for attribute in schema.column_attributes() {
        columns.push(format!("`{}`", attribute.json_key_name()));
        params.push(attribute.to_column(model.get(attribute.model_key()).unwrap_or(&Value::Null)));
    }
    let placeholders = vec!["?"; columns.len()].join(", ");
    let mut commands = vec![SqlCommand::new(
        format!("REPLACE INTO `{class}` ({}) VALUES ({placeholders})", columns.join(", ")),
        params,
    )];

    for attribute in schema.collection_attributes() {
        let AttributeKind::Collection {
            item_class,
            join_queryable_by,
            ..
        } = attribute.kind()
        else {
            continue;
        };
        let table = format!("{class}{item_class}");
        commands.push(SqlCommand::new(
            format!("DELETE FROM `{table}` WHERE `id` = ?"),
            vec![id.clone()],
        ));
        let value = model.get(attribute.model_key()).unwrap_or(&Value::Null);
        for key in attribute.collection_keys(value) {
            let mut columns = vec!["`id`".to_string(), "`value`".to_string()];
            let mut params = vec![id.clone(), to_sql_value(&key)];
            for joined_key in join_queryable_by {
                if let Some(joined) = schema.attribute(joined_key) {
                    columns.push(format!("`{}`", joined.json_key_name()));
                    params.push(joined.to_column(model.get(joined_key).unwrap_or(&Value::Null)));
                }
            }
            let placeholders = vec!["?"; columns.len()].join(", ");
            commands.push(SqlCommand::new(
                format!(
                    "INSERT OR IGNORE INTO `{table}` ({}) VALUES ({placeholders})",
                    columns.join(", ")
                ),
                params,
            ));
        }
    }

    for attribute in schema.joined_attributes() {
        let AttributeKind::JoinedData { table } = attribute.kind() else {
            continue;
        };
        if let Some(value) = model.get(attribute.model_key()) {
            let text = match value {
                Value::String(s) => SqlValue::Text(s.clone()),
                Value::Null => SqlValue::Null,
                other => SqlValue::Text(other.to_string()),
            };
            commands.push(SqlCommand::new(
                format!("REPLACE INTO `{table}` (`id`, `value`) VALUES (?, ?)"),
                vec![id.clone(), text],
            ));
        }
    }
    Ok(commands)
}

/// Statements removing one model and its satellite rows.
pub fn unpersist_commands(model: &Model) -> Vec<SqlCommand> {
    let schema = model.schema();
    let class = schema.class();
    let id = SqlValue::Text(model.id().to_string());
    let mut commands = vec![SqlCommand::new(
        format!("DELETE FROM `{class}` WHERE `id` = ?"),
        vec![id.clone()],
    )];
    for attribute in schema.collection_attributes() {
        if let AttributeKind::Collection { item_class, .. } = attribute.kind() {
            commands.push(SqlCommand::new(
                format!("DELETE FROM `{class}{item_class}` WHERE `id` = ?"),
                vec![id.clone()],
            ));
        }
    }
    for attribute in schema.joined_attributes() {
        if let AttributeKind::JoinedData { table } = attribute.kind() {
            commands.push(SqlCommand::new(
                format!("DELETE FROM `{table}` WHERE `id` = ?"),
                vec![id.clone()],
            ));
        }
    }
    commands
}

/// Inflate rows returned by [`select_sql`]: the `data` column first, then
/// one column per included attribute.
pub fn decode_rows(query: &Query, rows: Vec<Vec<SqlValue>>) -> Result<Vec<Model>> {
    let schema: &Arc<ModelSchema> = query.schema();
    let mut models = Vec::with_capacity(rows.len());
    for row in rows {
        let mut columns = row.into_iter();
        let data = match columns.next() {
            Some(SqlValue::Text(text)) => serde_json::from_str(&text)?,
            Some(SqlValue::Blob(bytes)) => serde_json::from_slice(&bytes)?,
            _ => continue,
        };
        let mut model = Model::from_json(schema.clone(), &data)?;
        for (attribute, value) in query.includes().iter().zip(columns) {
            model.set_loaded(attribute.model_key(), from_sql_value(value));
        }
        models.push(model);
    }
    Ok(models)
}
