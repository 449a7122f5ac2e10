use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use tempfile::NamedTempFile;

/// Test database with automatic cleanup
pub struct TestDb {
    connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with migrations applied
    pub async fn new() -> Self {
        // Create temporary SQLite database file
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        let connection = Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");

        migration::Migrator::up(&connection, None)
            .await
            .expect("Failed to run migrations");

        Self {
            connection,
            _temp_file: temp_file,
        }
    }

    /// Get database connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }
}

/// Record a granted consent for `user_id`
pub async fn grant_consent(
    db: &DatabaseConnection,
    user_id: &str,
    kind: krishi_sakhi::types::ConsentKind,
) {
    krishi_sakhi::storage::record_consent(db, user_id, kind, true, None)
        .await
        .expect("Failed to record consent");
}
