pub use sea_orm_migration::prelude::*;

mod m20250101_000001_bootstrap;
mod m20250101_000002_initial_schema;
mod m20250101_000003_knowledge_base;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_bootstrap::Migration),
            Box::new(m20250101_000002_initial_schema::Migration),
            Box::new(m20250101_000003_knowledge_base::Migration),
        ]
    }
}

/// Enumerated column domains. The Rust side validates values against the
/// same vocabularies; on PostgreSQL they are also declared as native types.
pub const ENUM_TYPES: &[(&str, &[&str])] = &[
    ("user_role", &["farmer", "staff", "admin"]),
    (
        "activity_kind",
        &[
            "sowing",
            "irrigation",
            "fertilizer",
            "pesticide",
            "harvest",
            "plowing",
            "weeding",
            "pruning",
            "other",
        ],
    ),
    ("advisory_severity", &["low", "medium", "high", "critical"]),
    (
        "notification_status",
        &["pending", "sent", "failed", "delivered"],
    ),
    (
        "consent_kind",
        &[
            "data_processing",
            "marketing",
            "analytics",
            "location",
            "notifications",
            "voice_recording",
            "data_sharing",
        ],
    ),
];

pub const EXTENSIONS: &[&str] = &["uuid-ossp", "pg_trgm", "postgis", "vector"];
