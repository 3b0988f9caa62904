use super::{ModelSchema, SchemaDefinition};
use crate::attributes::Attribute;
use crate::error::{LiveDbError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Class of the built-in key/value model used for opaque JSON documents.
pub const JSON_BLOB_CLASS: &str = "JSONBlob";

/// A Rust type that maps onto one registered model class.
///
/// Implementors get typed access through [`Model::decode`](crate::Model::decode)
/// and [`Model::encode`](crate::Model::encode).
pub trait ModelType: Serialize + DeserializeOwned {
    const CLASS: &'static str;

    fn schema() -> Result<ModelSchema>;
}

/// Lookup table from class name to schema, built once at startup.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, Arc<ModelSchema>>,
}

impl SchemaRegistry {
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder {
            schemas: Vec::new(),
        }
    }

    /// Registry holding only the built-in classes.
    pub fn empty() -> Result<Self> {
        Self::builder().build()
    }

    pub fn get(&self, class: &str) -> Option<&Arc<ModelSchema>> {
        self.schemas.get(class)
    }

    /// Like [`get`](Self::get) but fails with `UnknownClass`.
    pub fn require(&self, class: &str) -> Result<Arc<ModelSchema>> {
        self.schemas
            .get(class)
            .cloned()
            .ok_or_else(|| LiveDbError::UnknownClass(class.to_string()))
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModelSchema>> {
        self.schemas.values()
    }
}

pub struct SchemaRegistryBuilder {
    schemas: Vec<ModelSchema>,
}

impl SchemaRegistryBuilder {
    pub fn schema(mut self, schema: ModelSchema) -> Self {
        self.schemas.push(schema);
        self
    }

    pub fn model<T: ModelType>(self) -> Result<Self> {
        let schema = T::schema()?;
        if schema.class() != T::CLASS {
            return Err(LiveDbError::Schema(format!(
                "{} declares schema for class {}",
                T::CLASS,
                schema.class()
            )));
        }
        Ok(self.schema(schema))
    }

    /// Add every model of a parsed schema.yaml.
    pub fn definition(mut self, definition: &SchemaDefinition) -> Result<Self> {
        for (class, model) in &definition.models {
            self.schemas.push(ModelSchema::from_definition(class, model)?);
        }
        Ok(self)
    }

    pub fn build(self) -> Result<SchemaRegistry> {
        let mut schemas = BTreeMap::new();
        schemas.insert(JSON_BLOB_CLASS.to_string(), Arc::new(json_blob_schema()?));
        for schema in self.schemas {
            let class = schema.class().to_string();
            if schemas.insert(class.clone(), Arc::new(schema)).is_some() {
                return Err(LiveDbError::Schema(format!("Model class {class} registered twice")));
            }
        }
        Ok(SchemaRegistry { schemas })
    }
}

fn json_blob_schema() -> Result<ModelSchema> {
    ModelSchema::builder(JSON_BLOB_CLASS)
        .attribute(Attribute::object("json"))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_schema_str;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Contact {
        id: String,
        email: String,
    }

    impl ModelType for Contact {
        const CLASS: &'static str = "Contact";

        fn schema() -> Result<ModelSchema> {
            ModelSchema::builder("Contact")
                .attribute(Attribute::string("email").queryable())
                .build()
        }
    }

    #[test]
    fn test_builtin_json_blob() {
        let registry = SchemaRegistry::empty().unwrap();
        assert!(registry.get(JSON_BLOB_CLASS).is_some());
        assert!(matches!(registry.require("Nope"), Err(LiveDbError::UnknownClass(_))));
    }

    #[test]
    fn test_typed_and_yaml_models() {
        let def = parse_schema_str("models:\n  Thread:\n    attributes:\n      subject: { type: string }\n").unwrap();
        let registry = SchemaRegistry::builder()
            .model::<Contact>()
            .unwrap()
            .definition(&def)
            .unwrap()
            .build()
            .unwrap();
        let classes: Vec<&str> = registry.classes().collect();
        assert_eq!(classes, vec!["Contact", "JSONBlob", "Thread"]);
    }

    #[test]
    fn test_duplicate_class_rejected() {
        let result = SchemaRegistry::builder()
            .model::<Contact>()
            .unwrap()
            .model::<Contact>()
            .unwrap()
            .build();
        assert!(result.is_err());
    }
}
