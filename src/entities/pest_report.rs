use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "pest_reports")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub crop: String,
    pub pest_name: String,
    pub district: String,
    pub severity: String, // low | medium | high | critical
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub timestamp: i64,
    pub symptoms: Option<String>,
    pub control_measures: Option<String>,
    pub source: String,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
