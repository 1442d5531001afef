//! Materialized entities and the access guard
//!
//! Every declared relationship of an entity carries an explicit
//! [`RelationState`]. Reading a relationship is a function of that state;
//! the only I/O path is [`Entity::load_relation`], and only for `Guarded`.

use std::collections::BTreeMap;
use std::sync::Weak;

use crate::backends::DatabaseValue;
use crate::error::{OrmError, OrmResult};
use crate::resolver::RelationPath;
use crate::schema::{Cardinality, EntityType};
use super::LoadContext;

/// Loading state of one relationship field
#[derive(Debug, Clone, PartialEq)]
pub enum RelationState {
    /// No directive covered it and lazy access is not allowed
    NotRequested,
    /// Forbidden by an explicit or wildcard directive
    Forbidden,
    /// A single explicit fetch is permitted
    Guarded,
    Populated(Related),
}

impl RelationState {
    pub fn is_populated(&self) -> bool {
        matches!(self, RelationState::Populated(_))
    }

    fn empty(cardinality: Cardinality) -> Self {
        match cardinality {
            Cardinality::One => RelationState::Populated(Related::One(None)),
            Cardinality::Many => RelationState::Populated(Related::Many(Vec::new())),
        }
    }
}

/// Populated relationship value
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    One(Option<Box<Entity>>),
    Many(Vec<Entity>),
}

impl Related {
    pub fn len(&self) -> usize {
        match self {
            Related::One(entity) => usize::from(entity.is_some()),
            Related::Many(entities) => entities.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = &Entity> + '_> {
        match self {
            Related::One(entity) => Box::new(entity.iter().map(|e| &**e)),
            Related::Many(entities) => Box::new(entities.iter()),
        }
    }
}

/// A row of one entity type with guarded relationship fields
#[derive(Debug, Clone)]
pub struct Entity {
    pub(crate) entity_type: String,
    pub(crate) level: RelationPath,
    pub(crate) values: BTreeMap<String, DatabaseValue>,
    pub(crate) unloaded: Vec<String>,
    pub(crate) version_field: Option<String>,
    pub(crate) relations: BTreeMap<String, RelationState>,
    pub(crate) context: Weak<LoadContext>,
}

impl Entity {
    /// A new, unsaved entity; all of its relationships start out empty
    pub fn new_transient<I, K>(entity_type: &EntityType, values: I) -> Self
    where
        I: IntoIterator<Item = (K, DatabaseValue)>,
        K: Into<String>,
    {
        let mut columns: BTreeMap<String, DatabaseValue> = entity_type
            .field_names()
            .map(|f| (f.to_string(), DatabaseValue::Null))
            .collect();
        for (column, value) in values {
            columns.insert(column.into(), value);
        }

        Self {
            entity_type: entity_type.name.clone(),
            level: RelationPath::root(),
            values: columns,
            unloaded: Vec::new(),
            version_field: entity_type.version_field.clone(),
            relations: entity_type
                .relationships
                .iter()
                .map(|r| (r.name.clone(), RelationState::empty(r.cardinality)))
                .collect(),
            context: Weak::new(),
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Path from the query root to this entity's level
    pub fn level(&self) -> &RelationPath {
        &self.level
    }

    /// True once the result graph this entity came from is gone
    pub fn is_detached(&self) -> bool {
        self.context.strong_count() == 0
    }

    /// Guarded column access
    pub fn column(&self, name: &str) -> OrmResult<&DatabaseValue> {
        if let Some(value) = self.values.get(name) {
            return Ok(value);
        }
        if self.unloaded.iter().any(|c| c == name) {
            if self.is_detached() {
                return Err(OrmError::detached(&self.entity_type, name));
            }
            return Err(OrmError::lazy_access(&self.entity_type, name));
        }
        Err(OrmError::UnknownField {
            entity: self.entity_type.clone(),
            field: name.to_string(),
        })
    }

    /// Loaded column values
    pub fn values(&self) -> &BTreeMap<String, DatabaseValue> {
        &self.values
    }

    pub fn set_value(&mut self, column: &str, value: DatabaseValue) -> OrmResult<()> {
        self.column(column)?;
        self.values.insert(column.to_string(), value);
        Ok(())
    }

    /// Optimistic-locking version as loaded
    pub fn version(&self) -> Option<&DatabaseValue> {
        self.version_field
            .as_deref()
            .and_then(|field| self.values.get(field))
    }

    pub fn state(&self, name: &str) -> Option<&RelationState> {
        self.relations.get(name)
    }

    pub fn relation_names(&self) -> impl Iterator<Item = &str> {
        self.relations.keys().map(String::as_str)
    }

    /// Read a relationship without performing I/O
    pub fn relation(&self, name: &str) -> OrmResult<&Related> {
        match self.relations.get(name) {
            None => Err(self.not_a_relationship(name)),
            Some(RelationState::Populated(related)) => Ok(related),
            Some(_) if self.is_detached() => Err(OrmError::detached(&self.entity_type, name)),
            Some(RelationState::Forbidden) | Some(RelationState::NotRequested) => {
                Err(OrmError::lazy_access(&self.entity_type, name))
            }
            Some(RelationState::Guarded) => Err(OrmError::FetchRequired {
                entity: self.entity_type.clone(),
                field: name.to_string(),
            }),
        }
    }

    /// Single-valued relationship
    pub fn one(&self, name: &str) -> OrmResult<Option<&Entity>> {
        match self.relation(name)? {
            Related::One(entity) => Ok(entity.as_deref()),
            Related::Many(_) => Err(self.cardinality_mismatch(name)),
        }
    }

    /// Collection relationship
    pub fn many(&self, name: &str) -> OrmResult<&[Entity]> {
        match self.relation(name)? {
            Related::Many(entities) => Ok(entities),
            Related::One(_) => Err(self.cardinality_mismatch(name)),
        }
    }

    pub fn many_mut(&mut self, name: &str) -> OrmResult<&mut Vec<Entity>> {
        self.relation(name)?;
        let mismatch = self.cardinality_mismatch(name);
        match self.relations.get_mut(name) {
            Some(RelationState::Populated(Related::Many(entities))) => Ok(entities),
            _ => Err(mismatch),
        }
    }

    /// Mutable single-valued relationship, e.g. to fetch a guarded
    /// relationship one level further down
    pub fn one_mut(&mut self, name: &str) -> OrmResult<Option<&mut Entity>> {
        self.relation(name)?;
        let mismatch = self.cardinality_mismatch(name);
        match self.relations.get_mut(name) {
            Some(RelationState::Populated(Related::One(entity))) => Ok(entity.as_deref_mut()),
            _ => Err(mismatch),
        }
    }

    /// Perform the single permitted fetch of a `Guarded` relationship and
    /// cache it on this entity
    ///
    /// Already populated relationships are returned as they are. Forbidden
    /// and unrequested relationships fail exactly like [`relation`](Self::relation).
    pub async fn load_relation(&mut self, name: &str) -> OrmResult<&Related> {
        match self.relations.get(name) {
            None => return Err(self.not_a_relationship(name)),
            Some(RelationState::Guarded) => {}
            Some(_) => return self.relation(name),
        }

        let context = self
            .context
            .upgrade()
            .ok_or_else(|| OrmError::detached(&self.entity_type, name))?;
        let related = super::fetch_relation(&context, self, name).await?;
        self.relations
            .insert(name.to_string(), RelationState::Populated(related));
        self.relation(name)
    }

    /// Copy with columns only; populated relationships become `NotRequested`
    pub(crate) fn snapshot(&self) -> Entity {
        let relations = self
            .relations
            .iter()
            .map(|(name, state)| {
                let state = match state {
                    RelationState::Populated(_) => RelationState::NotRequested,
                    other => other.clone(),
                };
                (name.clone(), state)
            })
            .collect();

        Entity {
            relations,
            ..self.clone_shallow()
        }
    }

    fn clone_shallow(&self) -> Entity {
        Entity {
            entity_type: self.entity_type.clone(),
            level: self.level.clone(),
            values: self.values.clone(),
            unloaded: self.unloaded.clone(),
            version_field: self.version_field.clone(),
            relations: BTreeMap::new(),
            context: self.context.clone(),
        }
    }

    fn not_a_relationship(&self, name: &str) -> OrmError {
        OrmError::NotARelationship {
            entity: self.entity_type.clone(),
            field: name.to_string(),
        }
    }

    fn cardinality_mismatch(&self, name: &str) -> OrmError {
        OrmError::CardinalityMismatch {
            entity: self.entity_type.clone(),
            field: name.to_string(),
        }
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.entity_type == other.entity_type
            && self.values == other.values
            && self.unloaded == other.unloaded
            && self.relations == other.relations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::school;

    fn transient_student() -> Entity {
        Entity::new_transient(
            &school::student(),
            [("id", DatabaseValue::Int32(9)), ("name", "Dora".into())],
        )
    }

    #[test]
    fn test_transient_entity_is_fully_populated() {
        let student = transient_student();
        assert!(student.is_detached());
        assert!(student.many("emails").unwrap().is_empty());
        assert_eq!(student.one("clazz").unwrap(), None);
        assert_eq!(student.column("gender").unwrap(), &DatabaseValue::Null);
        assert_eq!(student.column("name").unwrap(), &DatabaseValue::from("Dora"));
    }

    #[test]
    fn test_access_errors() {
        let mut student = transient_student();
        assert!(matches!(
            student.one("emails"),
            Err(OrmError::CardinalityMismatch { .. })
        ));
        assert!(matches!(
            student.relation("name"),
            Err(OrmError::NotARelationship { .. })
        ));
        assert!(matches!(
            student.column("nickname"),
            Err(OrmError::UnknownField { .. })
        ));

        student.relations.insert("emails".into(), RelationState::Forbidden);
        // Without a live query context every non-populated access is detached
        assert_eq!(
            student.relation("emails").unwrap_err(),
            OrmError::detached("Student", "emails")
        );
    }

    #[tokio::test]
    async fn test_detached_load_relation() {
        let mut student = transient_student();
        student.relations.insert("emails".into(), RelationState::Guarded);
        assert_eq!(
            student.load_relation("emails").await.unwrap_err(),
            OrmError::detached("Student", "emails")
        );
        assert!(student.load_relation("clazz").await.unwrap().is_empty());
    }

    #[test]
    fn test_mutable_relation_access() {
        let mut student = transient_student();
        student.many_mut("emails").unwrap().push(Entity::new_transient(
            &school::email(),
            [("email", DatabaseValue::from("dora@school.example"))],
        ));
        assert_eq!(student.many("emails").unwrap().len(), 1);
        assert!(student.one_mut("clazz").unwrap().is_none());

        assert!(matches!(
            student.many_mut("clazz"),
            Err(OrmError::CardinalityMismatch { .. })
        ));
        assert!(matches!(
            student.one_mut("emails"),
            Err(OrmError::CardinalityMismatch { .. })
        ));
        assert!(matches!(
            student.one_mut("name"),
            Err(OrmError::NotARelationship { .. })
        ));
    }

    #[test]
    fn test_snapshot_drops_populated_relations() {
        let student = transient_student();
        let snapshot = student.snapshot();
        assert_eq!(snapshot.values, student.values);
        assert_eq!(snapshot.state("emails"), Some(&RelationState::NotRequested));
    }
}
