//! Schema Metadata - entity and relationship definitions

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{OrmError, OrmResult};

/// Scalar column types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Bool,
    Integer,
    BigInt,
    Float,
    Text,
    Bytes,
    Uuid,
    Timestamp,
    Date,
    Json,
}

/// A typed column of an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// How many related rows a relationship yields per owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    One,
    Many,
}

impl Cardinality {
    pub fn is_collection(self) -> bool {
        matches!(self, Cardinality::Many)
    }
}

/// Column binding between owner and target
///
/// `local_columns[i]` on the owner equals `remote_columns[i]` on the target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKey {
    pub local_columns: Vec<String>,
    pub remote_columns: Vec<String>,
}

impl ForeignKey {
    pub fn new<L, R>(local: &[L], remote: &[R]) -> Self
    where
        L: AsRef<str>,
        R: AsRef<str>,
    {
        Self {
            local_columns: local.iter().map(|c| c.as_ref().to_string()).collect(),
            remote_columns: remote.iter().map(|c| c.as_ref().to_string()).collect(),
        }
    }

    /// Single-column binding
    pub fn simple(local: &str, remote: &str) -> Self {
        Self::new(&[local], &[remote])
    }

    /// More than one column pair
    pub fn is_composite(&self) -> bool {
        self.local_columns.len() > 1
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.local_columns
            .iter()
            .map(String::as_str)
            .zip(self.remote_columns.iter().map(String::as_str))
    }

    fn validate(&self, owner: &str, relationship: &str) -> OrmResult<()> {
        if self.local_columns.is_empty() {
            return Err(OrmError::InvalidSchema(format!(
                "Relationship '{}.{}' binds no columns",
                owner, relationship
            )));
        }

        if self.local_columns.len() != self.remote_columns.len() {
            return Err(OrmError::InvalidSchema(format!(
                "Relationship '{}.{}' binds {} local column(s) to {} remote column(s)",
                owner,
                relationship,
                self.local_columns.len(),
                self.remote_columns.len()
            )));
        }

        Ok(())
    }
}

/// Declared relationship from an owning entity to a target entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipSpec {
    /// Owning entity name
    pub owner: String,

    /// Relationship (field) name on the owner
    pub name: String,

    /// Target entity name
    pub target: String,

    pub cardinality: Cardinality,

    pub foreign_key: ForeignKey,

    /// The owner may have no related row; forces outer-join semantics
    pub nullable: bool,

    /// Name of the relationship on the target pointing back at the owner
    pub inverse: Option<String>,

    /// Set from the foreign key when the relationship is declared
    pub composite_key: bool,
}

impl RelationshipSpec {
    fn new(
        owner: &str,
        name: &str,
        target: &str,
        cardinality: Cardinality,
        foreign_key: ForeignKey,
    ) -> Self {
        let composite_key = foreign_key.is_composite();
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            target: target.to_string(),
            cardinality,
            foreign_key,
            // A collection may always be empty
            nullable: cardinality.is_collection(),
            inverse: None,
            composite_key,
        }
    }

    /// Single-valued relationship
    pub fn one(owner: &str, name: &str, target: &str, foreign_key: ForeignKey) -> Self {
        Self::new(owner, name, target, Cardinality::One, foreign_key)
    }

    /// Collection relationship
    pub fn many(owner: &str, name: &str, target: &str, foreign_key: ForeignKey) -> Self {
        Self::new(owner, name, target, Cardinality::Many, foreign_key)
    }

    /// Declare the back-reference on the target
    pub fn with_inverse(mut self, inverse: &str) -> Self {
        self.inverse = Some(inverse.to_string());
        self
    }

    /// The owner may lack a related row
    pub fn optional(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn is_collection(&self) -> bool {
        self.cardinality.is_collection()
    }

    /// `Owner.name`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.owner, self.name)
    }
}

/// Static description of an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityType {
    pub name: String,
    pub table: String,
    pub fields: Vec<FieldDef>,
    /// Ordered primary-key columns
    pub primary_key: Vec<String>,
    pub relationships: Vec<RelationshipSpec>,
    /// Optimistic-locking version column
    pub version_field: Option<String>,
}

impl EntityType {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            fields: Vec::new(),
            primary_key: Vec::new(),
            relationships: Vec::new(),
            version_field: None,
        }
    }

    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Declare a relationship; its owner is set to this entity
    pub fn with_relationship(mut self, mut relationship: RelationshipSpec) -> Self {
        relationship.owner = self.name.clone();
        self.relationships.push(relationship);
        self
    }

    pub fn with_version_field(mut self, column: &str) -> Self {
        self.version_field = Some(column.to_string());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipSpec> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn has_composite_key(&self) -> bool {
        self.primary_key.len() > 1
    }

    /// Columns every load of this entity must include: the primary key and
    /// the local side of each relationship
    pub fn key_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        let local = self
            .relationships
            .iter()
            .flat_map(|r| r.foreign_key.local_columns.iter());
        for column in self.primary_key.iter().chain(local) {
            if !columns.contains(column) {
                columns.push(column.clone());
            }
        }
        columns
    }

    /// Check the entity in isolation; cross-entity checks happen at seal time
    pub fn validate(&self) -> OrmResult<()> {
        if self.name.is_empty() || self.table.is_empty() {
            return Err(OrmError::InvalidSchema(
                "Entity name and table must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(OrmError::InvalidSchema(format!(
                    "Entity '{}' declares field '{}' twice",
                    self.name, field.name
                )));
            }
        }

        if self.primary_key.is_empty() {
            return Err(OrmError::InvalidSchema(format!(
                "Entity '{}' has no primary key",
                self.name
            )));
        }

        for column in &self.primary_key {
            if !self.has_field(column) {
                return Err(OrmError::InvalidSchema(format!(
                    "Primary key column '{}' is not a field of '{}'",
                    column, self.name
                )));
            }
        }

        if let Some(version) = &self.version_field {
            if !self.has_field(version) {
                return Err(OrmError::InvalidSchema(format!(
                    "Version column '{}' is not a field of '{}'",
                    version, self.name
                )));
            }
        }

        let mut names = HashSet::new();
        for relationship in &self.relationships {
            if !names.insert(relationship.name.as_str()) || self.has_field(&relationship.name) {
                return Err(OrmError::InvalidSchema(format!(
                    "Entity '{}' declares '{}' more than once",
                    self.name, relationship.name
                )));
            }

            relationship
                .foreign_key
                .validate(&self.name, &relationship.name)?;

            for column in &relationship.foreign_key.local_columns {
                if !self.has_field(column) {
                    return Err(OrmError::InvalidSchema(format!(
                        "Relationship '{}.{}' binds unknown column '{}'",
                        self.name, relationship.name, column
                    )));
                }
            }
        }

        Ok(())
    }
}
