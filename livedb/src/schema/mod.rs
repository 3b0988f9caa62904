pub mod parser;
pub mod registry;
pub mod types;

pub use parser::{parse_schema, parse_schema_str};
pub use registry::{ModelType, SchemaRegistry, SchemaRegistryBuilder, JSON_BLOB_CLASS};
pub use types::SchemaDefinition;

use crate::attributes::{Attribute, AttributeKind, Direction, SortOrder};
use crate::error::{LiveDbError, Result};
use std::collections::HashSet;
use types::{AttributeType, ModelDefinition, SortDirection};

/// The flattened, immutable attribute table of one model class.
///
/// The base `id` attribute is merged in when the schema is built, so every
/// schema starts with a queryable string `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSchema {
    class: String,
    attributes: Vec<Attribute>,
    natural_sort: Vec<SortOrder>,
    search_fields: Vec<String>,
}

impl ModelSchema {
    pub fn builder(class: &str) -> ModelSchemaBuilder {
        ModelSchemaBuilder {
            class: class.to_string(),
            attributes: vec![Attribute::string("id").queryable()],
            natural_sort: Vec::new(),
            search_fields: Vec::new(),
        }
    }

    /// Compile a YAML model definition.
    pub fn from_definition(class: &str, def: &ModelDefinition) -> Result<Self> {
        let mut builder = ModelSchema::builder(class);
        for (key, attr_def) in &def.attributes {
            let mut attribute = match attr_def.attribute_type {
                AttributeType::String => Attribute::string(key),
                AttributeType::Number => Attribute::number(key),
                AttributeType::Boolean => Attribute::boolean(key),
                AttributeType::Datetime => Attribute::datetime(key),
                AttributeType::Object => Attribute::object(key),
                AttributeType::Collection => {
                    let item_class = attr_def.item_class.as_deref().ok_or_else(|| {
                        LiveDbError::Schema(format!("{class}.{key}: collection needs item_class"))
                    })?;
                    let joined: Vec<&str> =
                        attr_def.join_queryable_by.iter().map(String::as_str).collect();
                    Attribute::collection(key, item_class)
                        .join_on(attr_def.join_on.as_deref().unwrap_or("id"))
                        .join_queryable_by(&joined)
                }
                AttributeType::JoinedData => {
                    let table = attr_def.table.as_deref().ok_or_else(|| {
                        LiveDbError::Schema(format!("{class}.{key}: joined_data needs table"))
                    })?;
                    Attribute::joined_data(key, table)
                }
            };
            if let Some(json_key) = &attr_def.json_key {
                attribute = attribute.json_key(json_key);
            }
            if attr_def.queryable {
                attribute = attribute.queryable();
            }
            builder = builder.attribute(attribute);
        }
        for sort in &def.natural_sort {
            builder = builder.natural_sort_by(&sort.attribute, match sort.direction {
                SortDirection::Asc => Direction::Asc,
                SortDirection::Desc => Direction::Desc,
            });
        }
        let fields: Vec<&str> = def.search_fields.iter().map(String::as_str).collect();
        builder.search_fields(&fields).build()
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Look up an attribute by its model key.
    pub fn attribute(&self, model_key: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.model_key() == model_key)
    }

    pub fn attribute_by_json_key(&self, json_key: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.json_key_name() == json_key)
    }

    /// Attributes stored as columns of the primary table.
    pub fn column_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(|a| a.has_column() && a.model_key() != "id")
    }

    pub fn collection_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes
            .iter()
            .filter(|a| a.is_queryable() && matches!(a.kind(), AttributeKind::Collection { .. }))
    }

    pub fn joined_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(|a| a.is_joined_data())
    }

    pub fn natural_sort(&self) -> &[SortOrder] {
        &self.natural_sort
    }

    pub fn search_fields(&self) -> &[String] {
        &self.search_fields
    }

    pub fn is_searchable(&self) -> bool {
        !self.search_fields.is_empty()
    }
}

pub struct ModelSchemaBuilder {
    class: String,
    attributes: Vec<Attribute>,
    natural_sort: Vec<(String, Direction)>,
    search_fields: Vec<String>,
}

impl ModelSchemaBuilder {
    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Default ordering for queries that set none.
    pub fn natural_sort_by(mut self, model_key: &str, direction: Direction) -> Self {
        self.natural_sort.push((model_key.to_string(), direction));
        self
    }

    pub fn search_fields(mut self, fields: &[&str]) -> Self {
        self.search_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn build(self) -> Result<ModelSchema> {
        if self.class.is_empty() || !self.class.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(LiveDbError::Schema(format!(
                "Invalid model class name '{}'",
                self.class
            )));
        }

        let mut model_keys = HashSet::new();
        let mut json_keys = HashSet::new();
        for attribute in &self.attributes {
            if !model_keys.insert(attribute.model_key()) || !json_keys.insert(attribute.json_key_name()) {
                return Err(LiveDbError::Schema(format!(
                    "{}: duplicate attribute '{}'",
                    self.class,
                    attribute.model_key()
                )));
            }
        }

        let mut natural_sort = Vec::new();
        for (key, direction) in &self.natural_sort {
            let attribute = self
                .attributes
                .iter()
                .find(|a| a.model_key() == key)
                .ok_or_else(|| {
                    LiveDbError::Schema(format!("{}: unknown natural sort attribute '{key}'", self.class))
                })?;
            let order = SortOrder::new(attribute.clone(), *direction);
            order
                .validate()
                .map_err(|e| LiveDbError::Schema(format!("{}: {e}", self.class)))?;
            natural_sort.push(order);
        }

        Ok(ModelSchema {
            class: self.class,
            attributes: self.attributes,
            natural_sort,
            search_fields: self.search_fields,
        })
    }
}
