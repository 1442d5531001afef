//! Bidirectional consistency hook
//!
//! A relationship and its inverse are two independent directed links. After
//! one side is mutated through the hook, the other side is updated only when
//! the relationship declares an inverse. The back-reference is a column
//! snapshot of the parent, never a shared alias.

use crate::error::{OrmError, OrmResult};
use crate::schema::{Cardinality, RelationshipSpec, SchemaRegistry};
use super::entity::{Entity, Related, RelationState};

#[derive(Debug, Clone, Copy)]
pub struct InverseHook<'r> {
    registry: &'r SchemaRegistry,
}

impl<'r> InverseHook<'r> {
    pub fn new(registry: &'r SchemaRegistry) -> Self {
        Self { registry }
    }

    /// Push `child` onto `parent`'s populated collection `relationship`
    pub fn attach(&self, parent: &mut Entity, relationship: &str, mut child: Entity) -> OrmResult<()> {
        let spec = self.spec(parent, relationship, Cardinality::Many)?;
        // Fails unless the collection is populated
        parent.many(relationship)?;

        self.link_back(parent, spec, &mut child);
        parent.many_mut(relationship)?.push(child);
        tracing::debug!("Attached entity to {}", spec.qualified_name());
        Ok(())
    }

    /// Replace `parent`'s single-valued `relationship`
    pub fn assign(&self, parent: &mut Entity, relationship: &str, child: Option<Entity>) -> OrmResult<()> {
        let spec = self.spec(parent, relationship, Cardinality::One)?;
        parent.one(relationship)?;

        let child = child.map(|mut child| {
            self.link_back(parent, spec, &mut child);
            Box::new(child)
        });
        parent.relations.insert(
            relationship.to_string(),
            RelationState::Populated(Related::One(child)),
        );
        Ok(())
    }

    fn spec(&self, parent: &Entity, relationship: &str, expected: Cardinality) -> OrmResult<&'r RelationshipSpec> {
        let spec = self
            .registry
            .lookup(parent.entity_type())?
            .relationship(relationship)
            .ok_or_else(|| OrmError::NotARelationship {
                entity: parent.entity_type().to_string(),
                field: relationship.to_string(),
            })?;
        if spec.cardinality != expected {
            return Err(OrmError::CardinalityMismatch {
                entity: parent.entity_type().to_string(),
                field: relationship.to_string(),
            });
        }
        Ok(spec)
    }

    /// Mirror the link on the child when an inverse is declared
    fn link_back(&self, parent: &Entity, spec: &RelationshipSpec, child: &mut Entity) {
        let Some(inverse) = self.registry.inverse_of(spec) else {
            return;
        };
        let back = parent.snapshot();
        match inverse.cardinality {
            Cardinality::One => {
                child.relations.insert(
                    inverse.name.clone(),
                    RelationState::Populated(Related::One(Some(Box::new(back)))),
                );
            }
            Cardinality::Many => {
                if let Some(RelationState::Populated(Related::Many(owners))) =
                    child.relations.get_mut(&inverse.name)
                {
                    owners.push(back);
                }
            }
        }
    }
}
