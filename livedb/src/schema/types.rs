use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level schema definition parsed from schema.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub models: BTreeMap<String, ModelDefinition>,
}

/// Definition of a single model class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefinition {
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeDefinition>,
    #[serde(default)]
    pub natural_sort: Vec<SortDefinition>,
    /// Columns of the `<Class>Search` full-text index, if any.
    #[serde(default)]
    pub search_fields: Vec<String>,
}

/// Definition of a single attribute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeDefinition {
    #[serde(rename = "type")]
    pub attribute_type: AttributeType,
    #[serde(default)]
    pub queryable: bool,
    #[serde(default)]
    pub json_key: Option<String>,
    /// Collections: class of the items.
    #[serde(default)]
    pub item_class: Option<String>,
    /// Collections: item field stored in the join table.
    #[serde(default)]
    pub join_on: Option<String>,
    #[serde(default)]
    pub join_queryable_by: Vec<String>,
    /// Joined data: side table name.
    #[serde(default)]
    pub table: Option<String>,
}

/// Attribute type enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    String,
    Number,
    Boolean,
    Datetime,
    Object,
    Collection,
    JoinedData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortDefinition {
    pub attribute: String,
    #[serde(default)]
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}
