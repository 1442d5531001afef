//! Sample school-data schema
//!
//! Students with e-mail addresses and a class enrolment, classes taught by
//! teachers, clubs run by teachers, and e-mail verifications keyed by the
//! composite `(email, student_id)` pair. Used by the demo, the benchmarks
//! and the integration tests.

use chrono::{TimeZone, Utc};

use crate::backends::{DatabaseValue, MemoryEngine, Row};
use crate::error::OrmResult;
use super::metadata::{EntityType, FieldDef, FieldType, ForeignKey, RelationshipSpec};
use super::registry::SchemaRegistry;

pub fn student() -> EntityType {
    EntityType::new("Student", "students")
        .with_field(FieldDef::new("id", FieldType::Integer))
        .with_field(FieldDef::new("name", FieldType::Text))
        .with_field(FieldDef::new("gender", FieldType::Text).nullable())
        .with_field(FieldDef::new("address", FieldType::Text).nullable())
        .with_field(FieldDef::new("score", FieldType::Float).nullable())
        .with_field(FieldDef::new("updated_at", FieldType::Timestamp))
        .with_primary_key(&["id"])
        .with_version_field("updated_at")
        .with_relationship(
            RelationshipSpec::many("", "emails", "Email", ForeignKey::simple("id", "student_id"))
                .with_inverse("student"),
        )
        .with_relationship(
            RelationshipSpec::one("", "clazz", "StudentClazz", ForeignKey::simple("id", "student_id"))
                .with_inverse("student")
                .optional(),
        )
        .with_relationship(RelationshipSpec::many(
            "",
            "clubs",
            "StudentClub",
            ForeignKey::simple("id", "student_id"),
        ))
}

pub fn email() -> EntityType {
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
        .with_relationship(RelationshipSpec::many(
            "",
            "verifications",
            "EmailVerification",
            ForeignKey::new(&["email", "student_id"], &["email", "student_id"]),
        ))
}

pub fn email_verification() -> EntityType {
    EntityType::new("EmailVerification", "email_verifications")
        .with_field(FieldDef::new("email", FieldType::Text))
        .with_field(FieldDef::new("student_id", FieldType::Integer))
        .with_field(FieldDef::new("verified_at", FieldType::Timestamp))
        .with_primary_key(&["email", "student_id", "verified_at"])
}

pub fn student_clazz() -> EntityType {
    EntityType::new("StudentClazz", "student_clazz")
        .with_field(FieldDef::new("student_id", FieldType::Integer))
        .with_field(FieldDef::new("class_id", FieldType::Integer))
        .with_primary_key(&["student_id"])
        .with_relationship(
            RelationshipSpec::one("", "student", "Student", ForeignKey::simple("student_id", "id"))
                .with_inverse("clazz"),
        )
        .with_relationship(RelationshipSpec::one(
            "",
            "clazz",
            "Clazz",
            ForeignKey::simple("class_id", "id"),
        ))
        .with_relationship(RelationshipSpec::many(
            "",
            "clazzTeacher",
            "TeacherClazz",
            ForeignKey::simple("class_id", "class_id"),
        ))
}

pub fn clazz() -> EntityType {
    EntityType::new("Clazz", "clazz")
        .with_field(FieldDef::new("id", FieldType::Integer))
        .with_field(FieldDef::new("name", FieldType::Text))
        .with_primary_key(&["id"])
        .with_relationship(RelationshipSpec::many(
            "",
            "clazzTeacher",
            "TeacherClazz",
            ForeignKey::simple("id", "class_id"),
        ))
}

pub fn teacher() -> EntityType {
    EntityType::new("Teacher", "teachers")
        .with_field(FieldDef::new("id", FieldType::Integer))
        .with_field(FieldDef::new("name", FieldType::Text))
        .with_primary_key(&["id"])
}

pub fn teacher_clazz() -> EntityType {
    EntityType::new("TeacherClazz", "teacher_clazz")
        .with_field(FieldDef::new("teacher_id", FieldType::Integer))
        .with_field(FieldDef::new("class_id", FieldType::Integer))
        .with_primary_key(&["teacher_id", "class_id"])
        .with_relationship(RelationshipSpec::one(
            "",
            "teacher",
            "Teacher",
            ForeignKey::simple("teacher_id", "id"),
        ))
        .with_relationship(RelationshipSpec::one(
            "",
            "clazz",
            "Clazz",
            ForeignKey::simple("class_id", "id"),
        ))
}

pub fn club() -> EntityType {
    EntityType::new("Club", "clubs")
        .with_field(FieldDef::new("id", FieldType::Integer))
        .with_field(FieldDef::new("name", FieldType::Text))
        .with_field(FieldDef::new("teacher_id", FieldType::Integer).nullable())
        .with_primary_key(&["id"])
        .with_relationship(
            RelationshipSpec::one("", "teacher", "Teacher", ForeignKey::simple("teacher_id", "id"))
                .optional(),
        )
}

pub fn student_club() -> EntityType {
    EntityType::new("StudentClub", "student_club")
        .with_field(FieldDef::new("student_id", FieldType::Integer))
        .with_field(FieldDef::new("club_id", FieldType::Integer))
        .with_primary_key(&["student_id", "club_id"])
        .with_relationship(RelationshipSpec::one(
            "",
            "student",
            "Student",
            ForeignKey::simple("student_id", "id"),
        ))
        .with_relationship(RelationshipSpec::one(
            "",
            "club",
            "Club",
            ForeignKey::simple("club_id", "id"),
        ))
}

/// Build and seal the school registry
pub fn registry() -> OrmResult<SchemaRegistry> {
    SchemaRegistry::builder()
        .with_entity(student())?
        .with_entity(email())?
        .with_entity(email_verification())?
        .with_entity(student_clazz())?
        .with_entity(clazz())?
        .with_entity(teacher())?
        .with_entity(teacher_clazz())?
        .with_entity(club())?
        .with_entity(student_club())?
        .seal()
}

fn row<const N: usize>(pairs: [(&str, DatabaseValue); N]) -> Row {
    Row::from_pairs(pairs)
}

/// Seed an in-memory engine with a small, fixed data set
///
/// Three students: Alice (two e-mails, class 1, one club), Bob (one e-mail,
/// class 2) and Carol (no e-mail, no class). Class 1 has two teachers.
pub fn seed(engine: &MemoryEngine) {
    let updated_at = |day: u32| {
        DatabaseValue::DateTime(
            Utc.with_ymd_and_hms(2024, 1, day, 9, 0, 0)
                .single()
                .unwrap_or_default(),
        )
    };

    for (id, name, gender, address, score) in [
        (1, "Alice", Some("female"), Some("12 Elm Street"), Some(91.5)),
        (2, "Bob", Some("male"), None, Some(78.0)),
        (3, "Carol", None, Some("3 Oak Lane"), None),
    ] {
        engine.insert(
            "students",
            row([
                ("id", DatabaseValue::Int32(id)),
                ("name", name.into()),
                ("gender", gender.into()),
                ("address", address.into()),
                ("score", score.into()),
                ("updated_at", updated_at(id as u32)),
            ]),
        );
    }

    for (address, student_id) in [
        ("alice@school.example", 1),
        ("alice@home.example", 1),
        ("bob@school.example", 2),
    ] {
        engine.insert(
            "emails",
            row([
                ("email", address.into()),
                ("student_id", DatabaseValue::Int32(student_id)),
            ]),
        );
    }

    engine.insert(
        "email_verifications",
        row([
            ("email", "alice@school.example".into()),
            ("student_id", DatabaseValue::Int32(1)),
            ("verified_at", updated_at(2)),
        ]),
    );

    for (id, name) in [(1, "Mathematics"), (2, "History")] {
        engine.insert("clazz", row([("id", DatabaseValue::Int32(id)), ("name", name.into())]));
    }

    for (student_id, class_id) in [(1, 1), (2, 2)] {
        engine.insert(
            "student_clazz",
            row([
                ("student_id", DatabaseValue::Int32(student_id)),
                ("class_id", DatabaseValue::Int32(class_id)),
            ]),
        );
    }

    for (id, name) in [(1, "Mr. Gauss"), (2, "Ms. Noether")] {
        engine.insert("teachers", row([("id", DatabaseValue::Int32(id)), ("name", name.into())]));
    }

    for (teacher_id, class_id) in [(1, 1), (2, 1), (2, 2)] {
        engine.insert(
            "teacher_clazz",
            row([
                ("teacher_id", DatabaseValue::Int32(teacher_id)),
                ("class_id", DatabaseValue::Int32(class_id)),
            ]),
        );
    }

    for (id, name, teacher_id) in [(1, "Chess", Some(1)), (2, "Drama", None)] {
        engine.insert(
            "clubs",
            row([
                ("id", DatabaseValue::Int32(id)),
                ("name", name.into()),
                ("teacher_id", teacher_id.map(DatabaseValue::Int32).into()),
            ]),
        );
    }

    engine.insert(
        "student_club",
        row([
            ("student_id", DatabaseValue::Int32(1)),
            ("club_id", DatabaseValue::Int32(1)),
        ]),
    );
}
