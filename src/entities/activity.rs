use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "activities")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub farmer_id: String,
    pub field_id: Option<String>,
    pub timestamp: i64,
    pub kind: String,
    pub text_raw: Option<String>,
    pub text_processed: Option<String>,
    pub audio_media_id: Option<String>,
    pub data_json: Option<String>,
    pub language: String,
    pub intent: Option<String>,
    pub confidence_score: Option<i32>, // 0..=100
    pub is_verified: bool,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
