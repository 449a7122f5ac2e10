use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::DatabaseBackend;

use crate::{ENUM_TYPES, EXTENSIONS};

#[derive(DeriveMigrationName)]
pub struct Migration;

/// Statements that enable the database extensions and declare the enum types.
///
/// Every statement tolerates being run against an already bootstrapped
/// database: extensions use `IF NOT EXISTS` and type creation swallows
/// `duplicate_object`.
pub fn bootstrap_statements() -> Vec<String> {
    let mut stmts: Vec<String> = EXTENSIONS
        .iter()
        .map(|ext| format!("CREATE EXTENSION IF NOT EXISTS \"{}\"", ext))
        .collect();

    for (name, values) in ENUM_TYPES {
        let quoted = values
            .iter()
            .map(|v| format!("'{}'", v))
            .collect::<Vec<_>>()
            .join(", ");
        stmts.push(format!(
            "DO $$ BEGIN CREATE TYPE {} AS ENUM ({}); \
             EXCEPTION WHEN duplicate_object THEN null; END $$",
            name, quoted
        ));
    }

    stmts
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Extensions and native enum types only exist on PostgreSQL
        if manager.get_database_backend() != DatabaseBackend::Postgres {
            return Ok(());
        }

        let conn = manager.get_connection();
        for stmt in bootstrap_statements() {
            conn.execute_unprepared(&stmt).await?;
        }
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        if manager.get_database_backend() != DatabaseBackend::Postgres {
            return Ok(());
        }

        let conn = manager.get_connection();
        for (name, _) in ENUM_TYPES.iter().rev() {
            conn.execute_unprepared(&format!("DROP TYPE IF EXISTS {}", name))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_statements_are_idempotent_forms() {
        let stmts = bootstrap_statements();
        assert_eq!(stmts.len(), EXTENSIONS.len() + ENUM_TYPES.len());

        for stmt in &stmts[..EXTENSIONS.len()] {
            assert!(stmt.starts_with("CREATE EXTENSION IF NOT EXISTS"));
        }
        for stmt in &stmts[EXTENSIONS.len()..] {
            assert!(stmt.contains("EXCEPTION WHEN duplicate_object THEN null"));
        }
    }

    #[test]
    fn test_bootstrap_declares_every_enum_value() {
        let stmts = bootstrap_statements().join("\n");
        assert!(stmt_contains(&stmts, "CREATE TYPE user_role AS ENUM ('farmer', 'staff', 'admin')"));
        assert!(stmt_contains(&stmts, "'voice_recording'"));
        assert!(stmt_contains(&stmts, "'pruning', 'other'"));
        assert!(stmt_contains(&stmts, "CREATE EXTENSION IF NOT EXISTS \"uuid-ossp\""));
    }

    fn stmt_contains(haystack: &str, needle: &str) -> bool {
        haystack.contains(needle)
    }
}
