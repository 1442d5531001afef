//! Schema Registry - registration, sealing and read-only lookup

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{OrmError, OrmResult};
use super::metadata::{Cardinality, EntityType, RelationshipSpec};

/// Mutable registry used during process start
///
/// Entities are registered one by one; relationships may name targets that
/// are registered later. [`seal`](Self::seal) checks the cross-entity
/// references and produces the immutable [`SchemaRegistry`].
#[derive(Debug, Default)]
pub struct SchemaRegistryBuilder {
    entities: HashMap<String, EntityType>,
    order: Vec<String>,
}

impl SchemaRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity type
    pub fn register(&mut self, entity: EntityType) -> OrmResult<&mut Self> {
        if self.entities.contains_key(&entity.name) {
            return Err(OrmError::DuplicateEntity(entity.name));
        }

        entity.validate()?;

        tracing::debug!(
            "Registered entity {} ({} relationships)",
            entity.name,
            entity.relationships.len()
        );
        self.order.push(entity.name.clone());
        self.entities.insert(entity.name.clone(), entity);
        Ok(self)
    }

    /// Builder-style registration
    pub fn with_entity(mut self, entity: EntityType) -> OrmResult<Self> {
        self.register(entity)?;
        Ok(self)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// Freeze the registry
    pub fn seal(self) -> OrmResult<SchemaRegistry> {
        for name in &self.order {
            let entity = &self.entities[name];
            for relationship in &entity.relationships {
                self.check_relationship(entity, relationship)?;
            }
        }

        let registry = SchemaRegistry {
            entities: Arc::new(self.entities),
            order: Arc::new(self.order),
        };
        let stats = registry.stats();
        tracing::info!(
            "Schema registry sealed: {} entities, {} relationships",
            stats.total_entities,
            stats.total_relationships
        );
        Ok(registry)
    }

    fn check_relationship(&self, owner: &EntityType, relationship: &RelationshipSpec) -> OrmResult<()> {
        let Some(target) = self.entities.get(&relationship.target) else {
            return Err(OrmError::DanglingRelationship {
                entity: owner.name.clone(),
                relationship: relationship.name.clone(),
                target: relationship.target.clone(),
            });
        };

        for column in &relationship.foreign_key.remote_columns {
            if !target.has_field(column) {
                return Err(OrmError::InvalidSchema(format!(
                    "Relationship '{}' binds unknown column '{}.{}'",
                    relationship.qualified_name(),
                    target.name,
                    column
                )));
            }
        }

        if let Some(inverse) = &relationship.inverse {
            match target.relationship(inverse) {
                Some(back) if back.target == owner.name => {}
                Some(back) => {
                    return Err(OrmError::InvalidSchema(format!(
                        "Inverse '{}' of '{}' points at '{}' instead of '{}'",
                        back.qualified_name(),
                        relationship.qualified_name(),
                        back.target,
                        owner.name
                    )));
                }
                None => {
                    return Err(OrmError::InvalidSchema(format!(
                        "Inverse '{}.{}' of '{}' is not declared",
                        target.name,
                        inverse,
                        relationship.qualified_name()
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Sealed, read-only schema registry
///
/// Cloning is cheap and clones share the same storage, so one registry can
/// back any number of concurrent planning calls.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    entities: Arc<HashMap<String, EntityType>>,
    order: Arc<Vec<String>>,
}

impl SchemaRegistry {
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::new()
    }

    /// Look up an entity type by name
    pub fn lookup(&self, name: &str) -> OrmResult<&EntityType> {
        self.entities
            .get(name)
            .ok_or_else(|| OrmError::UnknownEntity(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// Look up a relationship declared on `entity`
    pub fn relationship(&self, entity: &str, name: &str) -> OrmResult<&RelationshipSpec> {
        let owner = self.lookup(entity)?;
        owner
            .relationship(name)
            .ok_or_else(|| OrmError::UnknownRelationship {
                entity: entity.to_string(),
                relationship: name.to_string(),
                path: name.to_string(),
            })
    }

    /// The declared inverse of a relationship, if any
    pub fn inverse_of(&self, relationship: &RelationshipSpec) -> Option<&RelationshipSpec> {
        let inverse = relationship.inverse.as_deref()?;
        self.entities.get(&relationship.target)?.relationship(inverse)
    }

    /// Entity names in registration order
    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut cardinality_counts = BTreeMap::new();
        let mut composite_relationships = 0;
        let mut bidirectional_relationships = 0;

        let relationships = self.entities.values().flat_map(|e| e.relationships.iter());
        for relationship in relationships {
            let label = match relationship.cardinality {
                Cardinality::One => "one",
                Cardinality::Many => "many",
            };
            *cardinality_counts.entry(label).or_insert(0) += 1;
            if relationship.composite_key {
                composite_relationships += 1;
            }
            if relationship.inverse.is_some() {
                bidirectional_relationships += 1;
            }
        }

        RegistryStats {
            total_entities: self.entities.len(),
            total_relationships: cardinality_counts.values().sum(),
            composite_relationships,
            bidirectional_relationships,
            cardinality_counts,
        }
    }
}

/// Statistics about a sealed registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_entities: usize,
    pub total_relationships: usize,
    pub composite_relationships: usize,
    pub bidirectional_relationships: usize,
    pub cardinality_counts: BTreeMap<&'static str, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::metadata::{FieldDef, FieldType, ForeignKey};

    fn student() -> EntityType {
        EntityType::new("Student", "students")
            .with_field(FieldDef::new("id", FieldType::Integer))
            .with_primary_key(&["id"])
            .with_relationship(
                RelationshipSpec::many("", "emails", "Email", ForeignKey::simple("id", "student_id"))
                    .with_inverse("student"),
            )
    }

    fn email() -> EntityType {
        EntityType::new("Email", "emails")
            .with_field(FieldDef::new("email", FieldType::Text))
            .with_field(FieldDef::new("student_id", FieldType::Integer))
            .with_primary_key(&["email", "student_id"])
            .with_relationship(RelationshipSpec::one(
                "",
                "student",
                "Student",
                ForeignKey::simple("student_id", "id"),
            ))
    }

    #[test]
    fn test_duplicate_entity() {
        let mut builder = SchemaRegistry::builder();
        builder.register(student()).unwrap();
        assert_eq!(
            builder.register(student()).unwrap_err(),
            OrmError::DuplicateEntity("Student".into())
        );
    }

    #[test]
    fn test_forward_references_resolve_at_seal() {
        let registry = SchemaRegistry::builder()
            .with_entity(student())
            .unwrap()
            .with_entity(email())
            .unwrap()
            .seal()
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.entity_names().collect::<Vec<_>>(), vec!["Student", "Email"]);
        let emails = registry.relationship("Student", "emails").unwrap();
        assert_eq!(registry.inverse_of(emails).unwrap().name, "student");
    }

    #[test]
    fn test_dangling_relationship() {
        let err = SchemaRegistry::builder()
            .with_entity(student())
            .unwrap()
            .seal()
            .unwrap_err();
        assert_eq!(
            err,
            OrmError::DanglingRelationship {
                entity: "Student".into(),
                relationship: "emails".into(),
                target: "Email".into(),
            }
        );
    }

    #[test]
    fn test_missing_inverse_and_remote_column() {
        let email_without_inverse = EntityType::new("Email", "emails")
            .with_field(FieldDef::new("email", FieldType::Text))
            .with_field(FieldDef::new("student_id", FieldType::Integer))
            .with_primary_key(&["email"]);
        let err = SchemaRegistry::builder()
            .with_entity(student())
            .unwrap()
            .with_entity(email_without_inverse)
            .unwrap()
            .seal()
            .unwrap_err();
        assert!(matches!(err, OrmError::InvalidSchema(msg) if msg.contains("Email.student")));

        let email_without_column = EntityType::new("Email", "emails")
            .with_field(FieldDef::new("email", FieldType::Text))
            .with_primary_key(&["email"]);
        assert!(SchemaRegistry::builder()
            .with_entity(student())
            .unwrap()
            .with_entity(email_without_column)
            .unwrap()
            .seal()
            .is_err());
    }

    #[test]
    fn test_lookup_and_stats() {
        let registry = SchemaRegistry::builder()
            .with_entity(student())
            .unwrap()
            .with_entity(email())
            .unwrap()
            .seal()
            .unwrap();

        assert_eq!(registry.lookup("Teacher").unwrap_err(), OrmError::UnknownEntity("Teacher".into()));
        assert!(matches!(
            registry.relationship("Student", "clazz"),
            Err(OrmError::UnknownRelationship { .. })
        ));

        let stats = registry.stats();
        assert_eq!(stats.total_entities, 2);
        assert_eq!(stats.total_relationships, 2);
        assert_eq!(stats.bidirectional_relationships, 1);
        assert_eq!(stats.cardinality_counts["many"], 1);
    }
}
