//! Demo data loader for the `seed-demo` command.
use crate::storage::{self, NewFarm, NewFarmer, NewField};
use crate::types::UserRole;
use miette::{IntoDiagnostic, Result};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::fs;

/// One account in the seed file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedUser {
    /// Phone number, normalized before lookup
    pub phone: String,
    #[serde(default = "default_role")]
    pub role: UserRole,
    /// Farmer profile to attach; staff accounts usually have none
    #[serde(default)]
    pub farmer: Option<SeedFarmer>,
}

fn default_role() -> UserRole {
    UserRole::Farmer
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedFarmer {
    #[serde(flatten)]
    pub profile: NewFarmer,
    #[serde(default)]
    pub farms: Vec<SeedFarm>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedFarm {
    #[serde(flatten)]
    pub farm: NewFarm,
    #[serde(default)]
    pub fields: Vec<NewField>,
}

/// Root structure of the seed JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedFile {
    pub users: Vec<SeedUser>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub users_created: usize,
    pub roles_updated: usize,
    pub farmers_created: usize,
    pub farms_created: usize,
    pub fields_created: usize,
}

/// Load a seed file and apply it (idempotent)
pub async fn seed_from_file(db: &DatabaseConnection, file_path: &str) -> Result<SeedReport> {
    tracing::info!("Loading demo data from {}", file_path);

    let content = fs::read_to_string(file_path)
        .into_diagnostic()
        .map_err(|e| miette::miette!("Failed to read seed file at '{}': {}", file_path, e))?;

    let seed: SeedFile = serde_json::from_str(&content)
        .into_diagnostic()
        .map_err(|e| {
            miette::miette!(
                "Failed to parse seed file: {}\n\nExpected format:\n{{\n  \"users\": [\n    {{\n      \"phone\": \"+919876543210\",\n      \"role\": \"farmer\",\n      \"farmer\": {{\n        \"name\": \"Ravi\",\n        \"district\": \"Thrissur\",\n        \"farms\": [{{ \"name\": \"Home\", \"fields\": [{{ \"name\": \"Paddy\", \"crop\": \"rice\" }}] }}]\n      }}\n    }}\n  ]\n}}",
                e
            )
        })?;

    let report = apply_seed(db, &seed).await?;
    tracing::info!(
        users_created = report.users_created,
        roles_updated = report.roles_updated,
        farmers_created = report.farmers_created,
        farms_created = report.farms_created,
        fields_created = report.fields_created,
        "Demo seed complete"
    );
    Ok(report)
}

pub async fn apply_seed(db: &DatabaseConnection, seed: &SeedFile) -> Result<SeedReport> {
    let mut report = SeedReport::default();
    for entry in &seed.users {
        seed_user(db, entry, &mut report).await?;
    }
    Ok(report)
}

async fn seed_user(
    db: &DatabaseConnection,
    entry: &SeedUser,
    report: &mut SeedReport,
) -> Result<()> {
    let phone = crate::auth::normalize_phone(&entry.phone)?;
    let (user, created) = storage::get_or_create_user_by_phone(db, &phone).await?;
    if created {
        tracing::info!(%phone, "Creating user");
        report.users_created += 1;
    }
    if storage::user_role(&user) != entry.role {
        storage::set_user_role(db, &user.id, entry.role).await?;
        report.roles_updated += 1;
    }

    let Some(seed_farmer) = &entry.farmer else {
        return Ok(());
    };
    let farmer = match storage::get_farmer_by_user(db, &user.id).await? {
        Some(existing) => existing,
        None => {
            report.farmers_created += 1;
            storage::create_farmer(db, &user.id, seed_farmer.profile.clone()).await?
        }
    };

    // Farms and fields are matched by name
    let existing_farms = storage::list_farms(db, &farmer.id).await?;
    for seed_farm in &seed_farmer.farms {
        let farm = match existing_farms.iter().find(|f| f.name == seed_farm.farm.name) {
            Some(f) => f.clone(),
            None => {
                report.farms_created += 1;
                storage::create_farm(db, &farmer.id, seed_farm.farm.clone()).await?
            }
        };

        let existing_fields = storage::list_fields_for_farm(db, &farm.id).await?;
        for field in &seed_farm.fields {
            if existing_fields.iter().any(|f| f.name == field.name) {
                continue;
            }
            storage::create_field(db, &farm.id, field.clone()).await?;
            report.fields_created += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::tests::test_context;

    fn seed() -> SeedFile {
        serde_json::from_value(serde_json::json!({
            "users": [
                {
                    "phone": "+919876543210",
                    "farmer": {
                        "name": "Ravi",
                        "district": "Thrissur",
                        "primary_crops": ["rice"],
                        "farms": [
                            {
                                "name": "Home",
                                "area_ha": 1.5,
                                "fields": [
                                    {"name": "Paddy", "crop": "rice", "stage": "transplanting"},
                                    {"name": "Banana plot", "crop": "banana"}
                                ]
                            }
                        ]
                    }
                },
                {"phone": "+919800000001", "role": "staff"}
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_seed_creates_everything() {
        let t = test_context().await;
        let db = &t.ctx.db;
        let report = apply_seed(db, &seed()).await.unwrap();
        assert_eq!(report.users_created, 2);
        assert_eq!(report.roles_updated, 1);
        assert_eq!(report.farmers_created, 1);
        assert_eq!(report.farms_created, 1);
        assert_eq!(report.fields_created, 2);

        let staff = storage::get_user_by_phone(db, "+919800000001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(storage::user_role(&staff), UserRole::Staff);
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let t = test_context().await;
        let db = &t.ctx.db;
        apply_seed(db, &seed()).await.unwrap();
        let second = apply_seed(db, &seed()).await.unwrap();
        assert_eq!(second, SeedReport::default());
    }

    #[tokio::test]
    async fn test_seed_from_file() {
        let t = test_context().await;
        let db = &t.ctx.db;
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), serde_json::to_string(&seed()).unwrap()).unwrap();
        let report = seed_from_file(db, file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(report.fields_created, 2);
    }

    #[tokio::test]
    async fn test_seed_rejects_bad_json() {
        let t = test_context().await;
        let db = &t.ctx.db;
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "{\"users\": 5}").unwrap();
        assert!(seed_from_file(db, file.path().to_str().unwrap())
            .await
            .is_err());
    }
}
