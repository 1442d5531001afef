//! Schema definitions: entity metadata and the sealed registry

pub mod metadata;
pub mod registry;
pub mod school;

pub use metadata::{Cardinality, EntityType, FieldDef, FieldType, ForeignKey, RelationshipSpec};
pub use registry::{RegistryStats, SchemaRegistry, SchemaRegistryBuilder};
