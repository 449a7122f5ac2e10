use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "farmers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub user_id: String,
    pub name: String,
    pub district: String,
    pub panchayat: Option<String>,
    pub village: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub soil_type: Option<String>,
    pub irrigation_source: Option<String>,
    pub primary_crops: String, // JSON array of crop names
    pub language_pref: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
