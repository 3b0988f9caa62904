use super::Database;
use crate::error::{LiveDbError, Result};
use crate::model::Model;
use crate::query::sql::{create_search_index_sql, search_table};
use rusqlite::types::Value as SqlValue;
use std::collections::BTreeMap;

// Full-text index management. Each searchable class has an FTS5 table
// `<Class>Search` keyed by `content_id`, with one column per search field.
impl Database {
    pub async fn create_search_index(&self, class: &str) -> Result<()> {
        let schema = self.schema(class)?;
        if !schema.is_searchable() {
            return Err(LiveDbError::InvalidQuery(format!(
                "{class} declares no search fields"
            )));
        }
        let sql = create_search_index_sql(&schema);
        self.inner
            .store
            .call(move |connections| connections.writer.execute_batch(&sql))
            .await
    }

    pub async fn drop_search_index(&self, class: &str) -> Result<()> {
        self.schema(class)?;
        let sql = format!("DROP TABLE IF EXISTS `{}`", search_table(class));
        self.inner
            .store
            .call(move |connections| connections.writer.execute_batch(&sql))
            .await
    }

    /// Number of models in the class's search index.
    pub async fn search_index_size(&self, class: &str) -> Result<u64> {
        self.schema(class)?;
        let table = search_table(class);
        let rows = self
            .inner
            .store
            .query(format!("SELECT COUNT(content_id) AS count FROM `{table}`"), Vec::new())
            .await?;
        match rows.first().and_then(|row| row.first()) {
            Some(SqlValue::Integer(n)) => Ok(u64::try_from(*n).unwrap_or(0)),
            _ => Ok(0),
        }
    }

    pub async fn is_model_indexed(&self, model: &Model) -> Result<bool> {
        let table = search_table(model.class());
        let rows = self
            .inner
            .store
            .call({
                let id = model.id().to_string();
                move |connections| {
                    connections.writer.query(
                        &format!("SELECT rowid FROM `{table}` WHERE `{table}`.`content_id` = ?"),
                        &[SqlValue::Text(id)],
                    )
                }
            })
            .await?;
        Ok(!rows.is_empty())
    }

    /// Add or replace the indexed text for `model`. Keys of `index_data`
    /// must be search fields of the model's class.
    pub async fn index_model(&self, model: &Model, index_data: &BTreeMap<String, String>) -> Result<()> {
        let fields = model.schema().search_fields();
        if let Some(unknown) = index_data.keys().find(|key| !fields.contains(*key)) {
            return Err(LiveDbError::InvalidQuery(format!(
                "{unknown} is not a search field of {}",
                model.class()
            )));
        }
        if index_data.is_empty() {
            return Ok(());
        }

        let table = search_table(model.class());
        let id = SqlValue::Text(model.id().to_string());
        let columns: Vec<String> = index_data.keys().map(|key| format!("`{key}`")).collect();
        let values: Vec<SqlValue> = index_data.values().map(|text| SqlValue::Text(text.clone())).collect();

        let (sql, params) = if self.is_model_indexed(model).await? {
            let assignments: Vec<String> = columns.iter().map(|column| format!("{column} = ?")).collect();
            let mut params = values;
            params.push(id);
            (
                format!(
                    "UPDATE `{table}` SET {} WHERE `{table}`.`content_id` = ?",
                    assignments.join(", ")
                ),
                params,
            )
        } else {
            let placeholders = vec!["?"; columns.len()].join(", ");
            let mut params = vec![id];
            params.extend(values);
            (
                format!(
                    "INSERT INTO `{table}` (content_id, {}) VALUES (?, {placeholders})",
                    columns.join(", ")
                ),
                params,
            )
        };
        self.inner.store.execute(sql, params).await?;
        Ok(())
    }

    pub async fn unindex_model(&self, model: &Model) -> Result<()> {
        let table = search_table(model.class());
        self.inner
            .store
            .execute(
                format!("DELETE FROM `{table}` WHERE `{table}`.`content_id` = ?"),
                vec![SqlValue::Text(model.id().to_string())],
            )
            .await?;
        Ok(())
    }
}
