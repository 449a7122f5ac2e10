use krishi_sakhi::entities;
use krishi_sakhi::storage::{self, NewFarm, NewFarmer, NewField};
use krishi_sakhi::types::UserRole;
use sea_orm::DatabaseConnection;

/// Builder for creating test users
pub struct UserBuilder {
    phone: String,
    role: UserRole,
}

impl UserBuilder {
    pub fn new(phone: &str) -> Self {
        Self {
            phone: phone.to_string(),
            role: UserRole::Farmer,
        }
    }

    pub fn staff(mut self) -> Self {
        self.role = UserRole::Staff;
        self
    }

    pub fn admin(mut self) -> Self {
        self.role = UserRole::Admin;
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> entities::user::Model {
        storage::create_user(db, &self.phone, self.role, "ml-IN")
            .await
            .expect("Failed to create test user")
    }
}

/// Builder for creating a farmer profile with one farm
pub struct FarmerBuilder {
    user_id: String,
    name: String,
    district: String,
    crops: Vec<String>,
}

impl FarmerBuilder {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            name: "Test Farmer".to_string(),
            district: "Thrissur".to_string(),
            crops: vec!["rice".to_string()],
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn in_district(mut self, district: &str) -> Self {
        self.district = district.to_string();
        self
    }

    pub fn with_crops(mut self, crops: &[&str]) -> Self {
        self.crops = crops.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Creates the farmer and a farm named "Home"
    pub async fn create(
        self,
        db: &DatabaseConnection,
    ) -> (entities::farmer::Model, entities::farm::Model) {
        let farmer = storage::create_farmer(
            db,
            &self.user_id,
            NewFarmer {
                name: self.name,
                district: self.district,
                panchayat: None,
                village: None,
                lat: Some(10.52),
                lon: Some(76.21),
                soil_type: None,
                irrigation_source: None,
                primary_crops: self.crops,
                language_pref: Some("en".to_string()),
            },
        )
        .await
        .expect("Failed to create test farmer");

        let farm = storage::create_farm(
            db,
            &farmer.id,
            NewFarm {
                name: "Home".to_string(),
                area_ha: Some(1.0),
                lat: None,
                lon: None,
            },
        )
        .await
        .expect("Failed to create test farm");

        (farmer, farm)
    }
}

/// Builder for creating test fields
pub struct FieldBuilder {
    farm_id: String,
    field: NewField,
}

impl FieldBuilder {
    pub fn new(farm_id: &str) -> Self {
        Self {
            farm_id: farm_id.to_string(),
            field: NewField {
                name: "Plot A".to_string(),
                ..NewField::default()
            },
        }
    }

    pub fn crop(mut self, crop: &str) -> Self {
        self.field.crop = Some(crop.to_string());
        self
    }

    pub fn stage(mut self, stage: &str) -> Self {
        self.field.stage = Some(stage.to_string());
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> entities::field::Model {
        storage::create_field(db, &self.farm_id, self.field)
            .await
            .expect("Failed to create test field")
    }
}
