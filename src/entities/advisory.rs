use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "advisories")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub farmer_id: String,
    pub field_id: Option<String>,
    pub timestamp: i64,
    pub title: String,
    pub text: String,
    pub severity: String,
    pub tags: String,                // JSON array
    pub source: String,
    pub source_data: Option<String>, // JSON object
    pub rule_name: Option<String>,
    pub is_acknowledged: bool,
    pub acknowledged_at: Option<i64>,
    pub is_read: bool,
    pub read_at: Option<i64>,
    pub is_active: bool,
    pub expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
