use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "reminders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub farmer_id: String,
    pub field_id: Option<String>,
    pub kind: String,
    pub title: String,
    pub text: String,
    pub due_ts: i64,
    pub repeat_every_secs: Option<i64>,
    pub is_paused: bool,
    pub priority: i32, // lower fires first
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
