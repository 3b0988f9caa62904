pub mod attributes;
pub mod change;
pub mod config;
pub mod database;
pub mod error;
pub mod model;
pub mod query;
pub mod schema;
pub mod store;
pub mod subscription;

pub use attributes::{Attribute, AttributeKind, Direction, Matcher, SortOrder};
pub use change::{ChangeBroadcast, ChangeEnvelope, ChangeKind, ChangeRecord, LocalBroadcastHub};
pub use config::DatabaseConfig;
pub use database::{Database, HookId, ModelOrId, MutationHook, QueryOutput, Transaction};
pub use error::{LiveDbError, Result};
pub use model::Model;
pub use query::{Query, QueryBuilder, QueryMode, QueryRange, QueryResultSet};
pub use schema::{ModelSchema, ModelType, SchemaDefinition, SchemaRegistry};
pub use store::delete_database_files;
pub use subscription::{LiveQuery, Observer, Unsubscribe};
