use crate::entities;
use crate::errors::SakhiError;
use crate::settings::Database as DbCfg;
use crate::types::{
    ActivityKind, AdvisorySeverity, AdvisorySource, AuditAction, ConsentKind,
    NotificationChannel, NotificationStatus, PestSeverity, ReminderKind, UserRole,
};
use base64ct::Encoding;
use chrono::Utc;
use rand::RngCore;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, Database, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, SakhiError> {
    let db = Database::connect(&cfg.url).await?;
    Ok(db)
}

/// Apply pending schema migrations
pub async fn migrate(db: &DatabaseConnection) -> Result<(), SakhiError> {
    use sea_orm_migration::MigratorTrait;

    migration::Migrator::up(db, None).await?;
    Ok(())
}

pub fn random_id() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

fn now() -> i64 {
    Utc::now().timestamp()
}

fn parse_string_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// 1-based page number and page size, clamped to sane bounds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Page {
    pub page: u64,
    pub size: u64,
}

impl Page {
    pub const DEFAULT_SIZE: u64 = 20;
    pub const MAX_SIZE: u64 = 100;

    pub fn new(page: Option<u64>, size: Option<u64>) -> Result<Self, SakhiError> {
        let page = page.unwrap_or(1);
        let size = size.unwrap_or(Self::DEFAULT_SIZE);
        if page < 1 {
            return Err(SakhiError::BadRequest("page must be >= 1".into()));
        }
        if !(1..=Self::MAX_SIZE).contains(&size) {
            return Err(SakhiError::BadRequest(format!(
                "size must be between 1 and {}",
                Self::MAX_SIZE
            )));
        }
        Ok(Self { page, size })
    }

    pub fn offset(&self) -> u64 {
        (self.page - 1) * self.size
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            size: Self::DEFAULT_SIZE,
        }
    }
}

// ============================================================================
// Users
// ============================================================================

pub async fn get_user(
    db: &DatabaseConnection,
    user_id: &str,
) -> Result<Option<entities::user::Model>, SakhiError> {
    Ok(entities::User::find_by_id(user_id.to_string()).one(db).await?)
}

pub async fn get_user_by_phone(
    db: &DatabaseConnection,
    phone: &str,
) -> Result<Option<entities::user::Model>, SakhiError> {
    use entities::user::{Column, Entity};

    Ok(Entity::find().filter(Column::Phone.eq(phone)).one(db).await?)
}

/// Look up a user by phone, creating a verified farmer account on first login.
/// Returns the user and whether it was created.
pub async fn get_or_create_user_by_phone(
    db: &DatabaseConnection,
    phone: &str,
) -> Result<(entities::user::Model, bool), SakhiError> {
    if let Some(user) = get_user_by_phone(db, phone).await? {
        return Ok((user, false));
    }
    let user = create_user(db, phone, UserRole::Farmer, "ml-IN").await?;
    Ok((user, true))
}

pub async fn create_user(
    db: &DatabaseConnection,
    phone: &str,
    role: UserRole,
    locale: &str,
) -> Result<entities::user::Model, SakhiError> {
    let now = now();
    let user = entities::user::ActiveModel {
        id: Set(random_id()),
        phone: Set(phone.to_string()),
        role: Set(role.as_str().to_string()),
        locale: Set(locale.to_string()),
        is_active: Set(true),
        is_verified: Set(true),
        last_login_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    };
    Ok(user.insert(db).await?)
}

pub async fn touch_last_login(db: &DatabaseConnection, user_id: &str) -> Result<(), SakhiError> {
    if let Some(user) = get_user(db, user_id).await? {
        let now = now();
        let mut active: entities::user::ActiveModel = user.into();
        active.last_login_at = Set(Some(now));
        active.updated_at = Set(now);
        active.update(db).await?;
    }
    Ok(())
}

pub async fn set_user_role(
    db: &DatabaseConnection,
    user_id: &str,
    role: UserRole,
) -> Result<entities::user::Model, SakhiError> {
    let user = get_user(db, user_id)
        .await?
        .ok_or_else(|| SakhiError::not_found("User"))?;
    let mut active: entities::user::ActiveModel = user.into();
    active.role = Set(role.as_str().to_string());
    active.updated_at = Set(now());
    Ok(active.update(db).await?)
}

pub fn user_role(user: &entities::user::Model) -> UserRole {
    // Stored roles are written through UserRole; fall back to least privilege
    user.role.parse().unwrap_or(UserRole::Farmer)
}

// ============================================================================
// Farmers, farms, fields
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFarmer {
    pub name: String,
    pub district: String,
    pub panchayat: Option<String>,
    pub village: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub soil_type: Option<String>,
    pub irrigation_source: Option<String>,
    #[serde(default)]
    pub primary_crops: Vec<String>,
    pub language_pref: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FarmerUpdate {
    pub name: Option<String>,
    pub district: Option<String>,
    pub panchayat: Option<String>,
    pub village: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub soil_type: Option<String>,
    pub irrigation_source: Option<String>,
    pub primary_crops: Option<Vec<String>>,
    pub language_pref: Option<String>,
}

/// API shape of a farmer, with the crop list decoded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmerView {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub district: String,
    pub panchayat: Option<String>,
    pub village: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub soil_type: Option<String>,
    pub irrigation_source: Option<String>,
    pub primary_crops: Vec<String>,
    pub language_pref: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<entities::farmer::Model> for FarmerView {
    fn from(m: entities::farmer::Model) -> Self {
        Self {
            primary_crops: parse_string_list(&m.primary_crops),
            id: m.id,
            user_id: m.user_id,
            name: m.name,
            district: m.district,
            panchayat: m.panchayat,
            village: m.village,
            lat: m.lat,
            lon: m.lon,
            soil_type: m.soil_type,
            irrigation_source: m.irrigation_source,
            language_pref: m.language_pref,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

fn validate_coords(lat: Option<f64>, lon: Option<f64>) -> Result<(), SakhiError> {
    if let Some(lat) = lat {
        if !(-90.0..=90.0).contains(&lat) {
            return Err(SakhiError::BadRequest("lat must be within -90..90".into()));
        }
    }
    if let Some(lon) = lon {
        if !(-180.0..=180.0).contains(&lon) {
            return Err(SakhiError::BadRequest("lon must be within -180..180".into()));
        }
    }
    Ok(())
}

fn validate_area(area_ha: Option<f64>) -> Result<(), SakhiError> {
    match area_ha {
        Some(a) if !(a > 0.0) => Err(SakhiError::BadRequest("area_ha must be positive".into())),
        _ => Ok(()),
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), SakhiError> {
    if value.trim().is_empty() {
        return Err(SakhiError::BadRequest(format!("{} is required", field)));
    }
    Ok(())
}

pub async fn create_farmer(
    db: &DatabaseConnection,
    user_id: &str,
    input: NewFarmer,
) -> Result<entities::farmer::Model, SakhiError> {
    require_non_empty("name", &input.name)?;
    require_non_empty("district", &input.district)?;
    validate_coords(input.lat, input.lon)?;

    if get_user(db, user_id).await?.is_none() {
        return Err(SakhiError::not_found("User"));
    }
    if get_farmer_by_user(db, user_id).await?.is_some() {
        return Err(SakhiError::Conflict(
            "farmer profile already exists for this user".into(),
        ));
    }

    let now = now();
    let farmer = entities::farmer::ActiveModel {
        id: Set(random_id()),
        user_id: Set(user_id.to_string()),
        name: Set(input.name.trim().to_string()),
        district: Set(input.district.trim().to_string()),
        panchayat: Set(input.panchayat),
        village: Set(input.village),
        lat: Set(input.lat),
        lon: Set(input.lon),
        soil_type: Set(input.soil_type),
        irrigation_source: Set(input.irrigation_source),
        primary_crops: Set(serde_json::to_string(&input.primary_crops)?),
        language_pref: Set(input.language_pref.unwrap_or_else(|| "ml-IN".to_string())),
        created_at: Set(now),
        updated_at: Set(now),
    };
    Ok(farmer.insert(db).await?)
}

pub async fn get_farmer(
    db: &DatabaseConnection,
    farmer_id: &str,
) -> Result<Option<entities::farmer::Model>, SakhiError> {
    Ok(entities::Farmer::find_by_id(farmer_id.to_string()).one(db).await?)
}

pub async fn get_farmer_by_user(
    db: &DatabaseConnection,
    user_id: &str,
) -> Result<Option<entities::farmer::Model>, SakhiError> {
    use entities::farmer::{Column, Entity};

    Ok(Entity::find().filter(Column::UserId.eq(user_id)).one(db).await?)
}

pub async fn update_farmer(
    db: &DatabaseConnection,
    farmer_id: &str,
    update: FarmerUpdate,
) -> Result<entities::farmer::Model, SakhiError> {
    validate_coords(update.lat, update.lon)?;
    let farmer = get_farmer(db, farmer_id)
        .await?
        .ok_or_else(|| SakhiError::not_found("Farmer"))?;

    let mut active: entities::farmer::ActiveModel = farmer.into();
    if let Some(name) = update.name {
        require_non_empty("name", &name)?;
        active.name = Set(name.trim().to_string());
    }
    if let Some(district) = update.district {
        require_non_empty("district", &district)?;
        active.district = Set(district.trim().to_string());
    }
    if update.panchayat.is_some() {
        active.panchayat = Set(update.panchayat);
    }
    if update.village.is_some() {
        active.village = Set(update.village);
    }
    if update.lat.is_some() {
        active.lat = Set(update.lat);
    }
    if update.lon.is_some() {
        active.lon = Set(update.lon);
    }
    if update.soil_type.is_some() {
        active.soil_type = Set(update.soil_type);
    }
    if update.irrigation_source.is_some() {
        active.irrigation_source = Set(update.irrigation_source);
    }
    if let Some(crops) = update.primary_crops {
        active.primary_crops = Set(serde_json::to_string(&crops)?);
    }
    if let Some(lang) = update.language_pref {
        active.language_pref = Set(lang);
    }
    active.updated_at = Set(now());
    Ok(active.update(db).await?)
}

pub async fn list_farmers(
    db: &DatabaseConnection,
    district: Option<&str>,
    page: Page,
) -> Result<(Vec<entities::farmer::Model>, u64), SakhiError> {
    use entities::farmer::{Column, Entity};

    let mut query = Entity::find();
    if let Some(d) = district {
        query = query.filter(Column::District.eq(d));
    }
    let total = query.clone().count(db).await?;
    let items = query
        .order_by_asc(Column::Name)
        .offset(page.offset())
        .limit(page.size)
        .all(db)
        .await?;
    Ok((items, total))
}

pub async fn all_farmers(
    db: &DatabaseConnection,
) -> Result<Vec<entities::farmer::Model>, SakhiError> {
    Ok(entities::Farmer::find().all(db).await?)
}

/// Districts that have at least one farmer
pub async fn farmer_districts(db: &DatabaseConnection) -> Result<Vec<String>, SakhiError> {
    use entities::farmer::{Column, Entity};

    let districts: Vec<String> = Entity::find()
        .select_only()
        .column(Column::District)
        .distinct()
        .into_tuple()
        .all(db)
        .await?;
    Ok(districts)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFarm {
    pub name: String,
    pub area_ha: Option<f64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

pub async fn create_farm(
    db: &DatabaseConnection,
    farmer_id: &str,
    input: NewFarm,
) -> Result<entities::farm::Model, SakhiError> {
    require_non_empty("name", &input.name)?;
    validate_area(input.area_ha)?;
    validate_coords(input.lat, input.lon)?;

    let now = now();
    let farm = entities::farm::ActiveModel {
        id: Set(random_id()),
        farmer_id: Set(farmer_id.to_string()),
        name: Set(input.name.trim().to_string()),
        area_ha: Set(input.area_ha),
        lat: Set(input.lat),
        lon: Set(input.lon),
        created_at: Set(now),
        updated_at: Set(now),
    };
    Ok(farm.insert(db).await?)
}

pub async fn get_farm(
    db: &DatabaseConnection,
    farm_id: &str,
) -> Result<Option<entities::farm::Model>, SakhiError> {
    Ok(entities::Farm::find_by_id(farm_id.to_string()).one(db).await?)
}

pub async fn list_farms(
    db: &DatabaseConnection,
    farmer_id: &str,
) -> Result<Vec<entities::farm::Model>, SakhiError> {
    use entities::farm::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::FarmerId.eq(farmer_id))
        .order_by_asc(Column::CreatedAt)
        .all(db)
        .await?)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewField {
    pub name: String,
    pub crop: Option<String>,
    pub variety: Option<String>,
    pub sow_date: Option<String>,
    pub stage: Option<String>,
    pub area_ha: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub name: Option<String>,
    pub crop: Option<String>,
    pub variety: Option<String>,
    pub sow_date: Option<String>,
    pub stage: Option<String>,
    pub area_ha: Option<f64>,
}

fn validate_sow_date(sow_date: Option<&str>) -> Result<(), SakhiError> {
    if let Some(d) = sow_date {
        chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d")
            .map_err(|_| SakhiError::BadRequest("sow_date must be YYYY-MM-DD".into()))?;
    }
    Ok(())
}

pub async fn create_field(
    db: &DatabaseConnection,
    farm_id: &str,
    input: NewField,
) -> Result<entities::field::Model, SakhiError> {
    require_non_empty("name", &input.name)?;
    validate_area(input.area_ha)?;
    validate_sow_date(input.sow_date.as_deref())?;

    let now = now();
    let field = entities::field::ActiveModel {
        id: Set(random_id()),
        farm_id: Set(farm_id.to_string()),
        name: Set(input.name.trim().to_string()),
        crop: Set(input.crop),
        variety: Set(input.variety),
        sow_date: Set(input.sow_date),
        stage: Set(input.stage),
        area_ha: Set(input.area_ha),
        created_at: Set(now),
        updated_at: Set(now),
    };
    Ok(field.insert(db).await?)
}

pub async fn get_field(
    db: &DatabaseConnection,
    field_id: &str,
) -> Result<Option<entities::field::Model>, SakhiError> {
    Ok(entities::Field::find_by_id(field_id.to_string()).one(db).await?)
}

pub async fn list_fields_for_farm(
    db: &DatabaseConnection,
    farm_id: &str,
) -> Result<Vec<entities::field::Model>, SakhiError> {
    use entities::field::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::FarmId.eq(farm_id))
        .order_by_asc(Column::CreatedAt)
        .all(db)
        .await?)
}

pub async fn list_fields_for_farmer(
    db: &DatabaseConnection,
    farmer_id: &str,
) -> Result<Vec<entities::field::Model>, SakhiError> {
    use entities::field::{Column, Entity};

    let farm_ids: Vec<String> = list_farms(db, farmer_id)
        .await?
        .into_iter()
        .map(|f| f.id)
        .collect();
    if farm_ids.is_empty() {
        return Ok(Vec::new());
    }
    Ok(Entity::find()
        .filter(Column::FarmId.is_in(farm_ids))
        .order_by_asc(Column::CreatedAt)
        .all(db)
        .await?)
}

/// The field, if it exists and sits on one of the farmer's farms
pub async fn get_field_of_farmer(
    db: &DatabaseConnection,
    field_id: &str,
    farmer_id: &str,
) -> Result<Option<entities::field::Model>, SakhiError> {
    let Some(field) = get_field(db, field_id).await? else {
        return Ok(None);
    };
    match get_farm(db, &field.farm_id).await? {
        Some(farm) if farm.farmer_id == farmer_id => Ok(Some(field)),
        _ => Ok(None),
    }
}

/// Farmer owning a field, following field -> farm -> farmer
pub async fn farmer_id_for_field(
    db: &DatabaseConnection,
    field_id: &str,
) -> Result<Option<String>, SakhiError> {
    let Some(field) = get_field(db, field_id).await? else {
        return Ok(None);
    };
    Ok(get_farm(db, &field.farm_id).await?.map(|f| f.farmer_id))
}

pub async fn update_field(
    db: &DatabaseConnection,
    field_id: &str,
    update: FieldUpdate,
) -> Result<entities::field::Model, SakhiError> {
    validate_area(update.area_ha)?;
    validate_sow_date(update.sow_date.as_deref())?;
    let field = get_field(db, field_id)
        .await?
        .ok_or_else(|| SakhiError::not_found("Field"))?;

    let mut active: entities::field::ActiveModel = field.into();
    if let Some(name) = update.name {
        require_non_empty("name", &name)?;
        active.name = Set(name.trim().to_string());
    }
    if update.crop.is_some() {
        active.crop = Set(update.crop);
    }
    if update.variety.is_some() {
        active.variety = Set(update.variety);
    }
    if update.sow_date.is_some() {
        active.sow_date = Set(update.sow_date);
    }
    if update.stage.is_some() {
        active.stage = Set(update.stage);
    }
    if update.area_ha.is_some() {
        active.area_ha = Set(update.area_ha);
    }
    active.updated_at = Set(now());
    Ok(active.update(db).await?)
}

/// Crops a farmer grows: declared primary crops plus crops on their fields,
/// deduplicated case-insensitively in first-seen order
pub async fn farmer_crops(
    db: &DatabaseConnection,
    farmer: &entities::farmer::Model,
) -> Result<Vec<String>, SakhiError> {
    let mut crops = parse_string_list(&farmer.primary_crops);
    for field in list_fields_for_farmer(db, &farmer.id).await? {
        if let Some(crop) = field.crop {
            crops.push(crop);
        }
    }
    let mut seen = std::collections::HashSet::new();
    crops.retain(|c| seen.insert(c.to_lowercase()));
    Ok(crops)
}

// ============================================================================
// Media
// ============================================================================

pub async fn create_media(
    db: &DatabaseConnection,
    owner_user_id: &str,
    kind: &str,
    file_name: &str,
    rel_path: &str,
    mime: &str,
    size_bytes: i64,
) -> Result<entities::media::Model, SakhiError> {
    let media = entities::media::ActiveModel {
        id: Set(random_id()),
        owner_user_id: Set(owner_user_id.to_string()),
        kind: Set(kind.to_string()),
        file_name: Set(file_name.to_string()),
        rel_path: Set(rel_path.to_string()),
        mime: Set(mime.to_string()),
        size_bytes: Set(size_bytes),
        created_at: Set(now()),
    };
    Ok(media.insert(db).await?)
}

pub async fn get_media(
    db: &DatabaseConnection,
    media_id: &str,
) -> Result<Option<entities::media::Model>, SakhiError> {
    Ok(entities::Media::find_by_id(media_id.to_string()).one(db).await?)
}

// ============================================================================
// Activities
// ============================================================================

#[derive(Debug, Clone)]
pub struct NewActivity {
    pub farmer_id: String,
    pub field_id: Option<String>,
    pub kind: ActivityKind,
    pub text_raw: Option<String>,
    pub text_processed: Option<String>,
    pub audio_media_id: Option<String>,
    pub data: Option<Value>,
    pub language: String,
    pub intent: Option<String>,
    pub confidence_score: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    pub farmer_id: Option<String>,
    pub field_id: Option<String>,
    pub from: Option<i64>,
    pub to: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityView {
    pub id: String,
    pub farmer_id: String,
    pub field_id: Option<String>,
    pub timestamp: i64,
    pub kind: String,
    pub text_raw: Option<String>,
    pub text_processed: Option<String>,
    pub audio_media_id: Option<String>,
    pub data: Option<Value>,
    pub language: String,
    pub intent: Option<String>,
    pub confidence_score: Option<i32>,
    pub is_verified: bool,
    pub created_at: i64,
}

impl From<entities::activity::Model> for ActivityView {
    fn from(m: entities::activity::Model) -> Self {
        Self {
            data: m
                .data_json
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok()),
            id: m.id,
            farmer_id: m.farmer_id,
            field_id: m.field_id,
            timestamp: m.timestamp,
            kind: m.kind,
            text_raw: m.text_raw,
            text_processed: m.text_processed,
            audio_media_id: m.audio_media_id,
            language: m.language,
            intent: m.intent,
            confidence_score: m.confidence_score,
            is_verified: m.is_verified,
            created_at: m.created_at,
        }
    }
}

pub async fn create_activity(
    db: &DatabaseConnection,
    input: NewActivity,
) -> Result<entities::activity::Model, SakhiError> {
    let now = now();
    let data_json = match input.data {
        Some(v) => Some(serde_json::to_string(&v)?),
        None => None,
    };
    let activity = entities::activity::ActiveModel {
        id: Set(random_id()),
        farmer_id: Set(input.farmer_id),
        field_id: Set(input.field_id),
        timestamp: Set(now),
        kind: Set(input.kind.as_str().to_string()),
        text_raw: Set(input.text_raw),
        text_processed: Set(input.text_processed),
        audio_media_id: Set(input.audio_media_id),
        data_json: Set(data_json),
        language: Set(input.language),
        intent: Set(input.intent),
        confidence_score: Set(input.confidence_score.map(|c| c.clamp(0, 100))),
        is_verified: Set(false),
        created_at: Set(now),
    };
    Ok(activity.insert(db).await?)
}

pub async fn get_activity(
    db: &DatabaseConnection,
    activity_id: &str,
) -> Result<Option<entities::activity::Model>, SakhiError> {
    Ok(entities::Activity::find_by_id(activity_id.to_string())
        .one(db)
        .await?)
}

pub async fn list_activities(
    db: &DatabaseConnection,
    filter: &ActivityFilter,
    page: Page,
) -> Result<(Vec<entities::activity::Model>, u64), SakhiError> {
    use entities::activity::{Column, Entity};

    let mut cond = Condition::all();
    if let Some(farmer_id) = &filter.farmer_id {
        cond = cond.add(Column::FarmerId.eq(farmer_id.as_str()));
    }
    if let Some(field_id) = &filter.field_id {
        cond = cond.add(Column::FieldId.eq(field_id.as_str()));
    }
    if let Some(from) = filter.from {
        cond = cond.add(Column::Timestamp.gte(from));
    }
    if let Some(to) = filter.to {
        cond = cond.add(Column::Timestamp.lte(to));
    }

    let query = Entity::find().filter(cond);
    let total = query.clone().count(db).await?;
    let items = query
        .order_by_desc(Column::Timestamp)
        .order_by_desc(Column::CreatedAt)
        .offset(page.offset())
        .limit(page.size)
        .all(db)
        .await?;
    Ok((items, total))
}

// ============================================================================
// Advisories
// ============================================================================

#[derive(Debug, Clone)]
pub struct NewAdvisory {
    pub farmer_id: String,
    pub field_id: Option<String>,
    pub title: String,
    pub text: String,
    pub severity: AdvisorySeverity,
    pub tags: Vec<String>,
    pub source: AdvisorySource,
    pub source_data: Option<Value>,
    pub rule_name: Option<String>,
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryView {
    pub id: String,
    pub farmer_id: String,
    pub field_id: Option<String>,
    pub timestamp: i64,
    pub title: String,
    pub text: String,
    pub severity: String,
    pub tags: Vec<String>,
    pub source: String,
    pub source_data: Option<Value>,
    pub rule_name: Option<String>,
    pub is_acknowledged: bool,
    pub acknowledged_at: Option<i64>,
    pub is_read: bool,
    pub read_at: Option<i64>,
    pub expires_at: Option<i64>,
}

impl From<entities::advisory::Model> for AdvisoryView {
    fn from(m: entities::advisory::Model) -> Self {
        Self {
            tags: parse_string_list(&m.tags),
            source_data: m
                .source_data
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok()),
            id: m.id,
            farmer_id: m.farmer_id,
            field_id: m.field_id,
            timestamp: m.timestamp,
            title: m.title,
            text: m.text,
            severity: m.severity,
            source: m.source,
            rule_name: m.rule_name,
            is_acknowledged: m.is_acknowledged,
            acknowledged_at: m.acknowledged_at,
            is_read: m.is_read,
            read_at: m.read_at,
            expires_at: m.expires_at,
        }
    }
}

pub async fn create_advisory(
    db: &DatabaseConnection,
    input: NewAdvisory,
) -> Result<entities::advisory::Model, SakhiError> {
    require_non_empty("title", &input.title)?;
    let now = now();
    let source_data = match input.source_data {
        Some(v) => Some(serde_json::to_string(&v)?),
        None => None,
    };
    let advisory = entities::advisory::ActiveModel {
        id: Set(random_id()),
        farmer_id: Set(input.farmer_id),
        field_id: Set(input.field_id),
        timestamp: Set(now),
        title: Set(input.title),
        text: Set(input.text),
        severity: Set(input.severity.as_str().to_string()),
        tags: Set(serde_json::to_string(&input.tags)?),
        source: Set(input.source.as_str().to_string()),
        source_data: Set(source_data),
        rule_name: Set(input.rule_name),
        is_acknowledged: Set(false),
        acknowledged_at: Set(None),
        is_read: Set(false),
        read_at: Set(None),
        is_active: Set(true),
        expires_at: Set(input.expires_at),
        created_at: Set(now),
        updated_at: Set(now),
    };
    Ok(advisory.insert(db).await?)
}

/// Whether an active advisory with this title was issued to the farmer since `since`
pub async fn recent_advisory_exists(
    db: &DatabaseConnection,
    farmer_id: &str,
    title: &str,
    since: i64,
) -> Result<bool, SakhiError> {
    use entities::advisory::{Column, Entity};

    let count = Entity::find()
        .filter(Column::FarmerId.eq(farmer_id))
        .filter(Column::Title.eq(title))
        .filter(Column::IsActive.eq(true))
        .filter(Column::Timestamp.gte(since))
        .count(db)
        .await?;
    Ok(count > 0)
}

pub async fn get_advisory(
    db: &DatabaseConnection,
    advisory_id: &str,
) -> Result<Option<entities::advisory::Model>, SakhiError> {
    Ok(entities::Advisory::find_by_id(advisory_id.to_string())
        .one(db)
        .await?)
}

/// Active, unexpired advisories for a farmer, newest first
pub async fn list_advisories(
    db: &DatabaseConnection,
    farmer_id: &str,
    unread_only: bool,
    page: Page,
) -> Result<(Vec<entities::advisory::Model>, u64), SakhiError> {
    use entities::advisory::{Column, Entity};

    let now = now();
    let mut query = Entity::find()
        .filter(Column::FarmerId.eq(farmer_id))
        .filter(Column::IsActive.eq(true))
        .filter(
            Condition::any()
                .add(Column::ExpiresAt.is_null())
                .add(Column::ExpiresAt.gt(now)),
        );
    if unread_only {
        query = query.filter(Column::IsRead.eq(false));
    }
    let total = query.clone().count(db).await?;
    let items = query
        .order_by_desc(Column::Timestamp)
        .offset(page.offset())
        .limit(page.size)
        .all(db)
        .await?;
    Ok((items, total))
}

pub async fn mark_advisory_read(
    db: &DatabaseConnection,
    advisory_id: &str,
) -> Result<entities::advisory::Model, SakhiError> {
    let advisory = get_advisory(db, advisory_id)
        .await?
        .ok_or_else(|| SakhiError::not_found("Advisory"))?;
    if advisory.is_read {
        return Ok(advisory);
    }
    let now = now();
    let mut active: entities::advisory::ActiveModel = advisory.into();
    active.is_read = Set(true);
    active.read_at = Set(Some(now));
    active.updated_at = Set(now);
    Ok(active.update(db).await?)
}

/// Acknowledging also marks the advisory read
pub async fn acknowledge_advisory(
    db: &DatabaseConnection,
    advisory_id: &str,
) -> Result<entities::advisory::Model, SakhiError> {
    let advisory = get_advisory(db, advisory_id)
        .await?
        .ok_or_else(|| SakhiError::not_found("Advisory"))?;
    if advisory.is_acknowledged {
        return Ok(advisory);
    }
    let now = now();
    let was_read = advisory.is_read;
    let mut active: entities::advisory::ActiveModel = advisory.into();
    active.is_acknowledged = Set(true);
    active.acknowledged_at = Set(Some(now));
    if !was_read {
        active.is_read = Set(true);
        active.read_at = Set(Some(now));
    }
    active.updated_at = Set(now);
    Ok(active.update(db).await?)
}

// ============================================================================
// Reminders
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReminder {
    pub field_id: Option<String>,
    pub kind: ReminderKind,
    pub title: String,
    #[serde(default)]
    pub text: String,
    pub due_ts: i64,
    pub repeat_every_secs: Option<i64>,
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReminderUpdate {
    pub title: Option<String>,
    pub text: Option<String>,
    pub due_ts: Option<i64>,
    pub repeat_every_secs: Option<i64>,
    pub priority: Option<i32>,
    pub is_paused: Option<bool>,
}

fn validate_repeat(repeat_every_secs: Option<i64>) -> Result<(), SakhiError> {
    match repeat_every_secs {
        Some(secs) if secs < 60 => Err(SakhiError::BadRequest(
            "repeat_every_secs must be at least 60".into(),
        )),
        _ => Ok(()),
    }
}

pub async fn create_reminder(
    db: &DatabaseConnection,
    farmer_id: &str,
    input: NewReminder,
) -> Result<entities::reminder::Model, SakhiError> {
    require_non_empty("title", &input.title)?;
    validate_repeat(input.repeat_every_secs)?;

    let now = now();
    let reminder = entities::reminder::ActiveModel {
        id: Set(random_id()),
        farmer_id: Set(farmer_id.to_string()),
        field_id: Set(input.field_id),
        kind: Set(input.kind.as_str().to_string()),
        title: Set(input.title.trim().to_string()),
        text: Set(input.text),
        due_ts: Set(input.due_ts),
        repeat_every_secs: Set(input.repeat_every_secs),
        is_paused: Set(false),
        priority: Set(input.priority.unwrap_or(100)),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
    };
    Ok(reminder.insert(db).await?)
}

pub async fn get_reminder(
    db: &DatabaseConnection,
    reminder_id: &str,
) -> Result<Option<entities::reminder::Model>, SakhiError> {
    Ok(entities::Reminder::find_by_id(reminder_id.to_string())
        .one(db)
        .await?)
}

pub async fn list_reminders(
    db: &DatabaseConnection,
    farmer_id: &str,
    include_inactive: bool,
) -> Result<Vec<entities::reminder::Model>, SakhiError> {
    use entities::reminder::{Column, Entity};

    let mut query = Entity::find().filter(Column::FarmerId.eq(farmer_id));
    if !include_inactive {
        query = query.filter(Column::IsActive.eq(true));
    }
    Ok(query
        .order_by_asc(Column::DueTs)
        .order_by_asc(Column::Priority)
        .all(db)
        .await?)
}

pub async fn update_reminder(
    db: &DatabaseConnection,
    reminder_id: &str,
    update: ReminderUpdate,
) -> Result<entities::reminder::Model, SakhiError> {
    validate_repeat(update.repeat_every_secs)?;
    let reminder = get_reminder(db, reminder_id)
        .await?
        .ok_or_else(|| SakhiError::not_found("Reminder"))?;

    let mut active: entities::reminder::ActiveModel = reminder.into();
    if let Some(title) = update.title {
        require_non_empty("title", &title)?;
        active.title = Set(title.trim().to_string());
    }
    if let Some(text) = update.text {
        active.text = Set(text);
    }
    if let Some(due_ts) = update.due_ts {
        active.due_ts = Set(due_ts);
        // Rescheduling a finished one-shot reminder brings it back
        active.is_active = Set(true);
    }
    if update.repeat_every_secs.is_some() {
        active.repeat_every_secs = Set(update.repeat_every_secs);
    }
    if let Some(priority) = update.priority {
        active.priority = Set(priority);
    }
    if let Some(paused) = update.is_paused {
        active.is_paused = Set(paused);
    }
    active.updated_at = Set(now());
    Ok(active.update(db).await?)
}

/// Delete a reminder and cancel its pending notifications.
/// Returns the number of notifications cancelled.
pub async fn delete_reminder(
    db: &DatabaseConnection,
    reminder_id: &str,
) -> Result<u64, SakhiError> {
    use entities::notification::{Column, Entity};

    if get_reminder(db, reminder_id).await?.is_none() {
        return Err(SakhiError::not_found("Reminder"));
    }

    let txn = db.begin().await?;
    let cancelled = Entity::update_many()
        .col_expr(
            Column::Status,
            Expr::value(NotificationStatus::Cancelled.as_str()),
        )
        .col_expr(Column::UpdatedAt, Expr::value(now()))
        .filter(Column::ReminderId.eq(reminder_id))
        .filter(Column::Status.eq(NotificationStatus::Pending.as_str()))
        .exec(&txn)
        .await?
        .rows_affected;
    // Keep delivered history but detach it from the reminder being removed
    Entity::update_many()
        .col_expr(Column::ReminderId, Expr::value(Option::<String>::None))
        .filter(Column::ReminderId.eq(reminder_id))
        .exec(&txn)
        .await?;
    entities::Reminder::delete_by_id(reminder_id.to_string())
        .exec(&txn)
        .await?;
    txn.commit().await?;
    Ok(cancelled)
}

/// Active, unpaused reminders whose due time has passed, highest priority first
pub async fn due_reminders(
    db: &DatabaseConnection,
    now: i64,
) -> Result<Vec<entities::reminder::Model>, SakhiError> {
    use entities::reminder::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::IsActive.eq(true))
        .filter(Column::IsPaused.eq(false))
        .filter(Column::DueTs.lte(now))
        .order_by_asc(Column::Priority)
        .order_by_asc(Column::DueTs)
        .all(db)
        .await?)
}

/// Next due time strictly after `now` for a recurring reminder
pub fn next_due(due_ts: i64, repeat_every_secs: i64, now: i64) -> i64 {
    if repeat_every_secs <= 0 || due_ts > now {
        return due_ts;
    }
    let periods = (now - due_ts) / repeat_every_secs + 1;
    due_ts + periods * repeat_every_secs
}

/// Move a fired reminder forward: recurring ones get their next due time,
/// one-shot reminders are deactivated
pub async fn advance_reminder<C: ConnectionTrait>(
    db: &C,
    reminder: entities::reminder::Model,
    now: i64,
) -> Result<entities::reminder::Model, SakhiError> {
    let repeat = reminder.repeat_every_secs;
    let due_ts = reminder.due_ts;
    let mut active: entities::reminder::ActiveModel = reminder.into();
    match repeat {
        Some(secs) if secs > 0 => active.due_ts = Set(next_due(due_ts, secs, now)),
        _ => active.is_active = Set(false),
    }
    active.updated_at = Set(now);
    Ok(active.update(db).await?)
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub farmer_id: String,
    pub reminder_id: Option<String>,
    pub channel: NotificationChannel,
    pub recipient: String,
    pub title: Option<String>,
    pub message: String,
    pub scheduled_at: i64,
    pub max_retries: i32,
}

pub async fn create_notification<C: ConnectionTrait>(
    db: &C,
    input: NewNotification,
) -> Result<entities::notification::Model, SakhiError> {
    let now = now();
    let notification = entities::notification::ActiveModel {
        id: Set(random_id()),
        farmer_id: Set(input.farmer_id),
        reminder_id: Set(input.reminder_id),
        channel: Set(input.channel.as_str().to_string()),
        recipient: Set(input.recipient),
        title: Set(input.title),
        message: Set(input.message),
        status: Set(NotificationStatus::Pending.as_str().to_string()),
        scheduled_at: Set(input.scheduled_at),
        sent_at: Set(None),
        delivered_at: Set(None),
        error_message: Set(None),
        retry_count: Set(0),
        max_retries: Set(input.max_retries),
        created_at: Set(now),
        updated_at: Set(now),
    };
    Ok(notification.insert(db).await?)
}

pub async fn get_notification(
    db: &DatabaseConnection,
    notification_id: &str,
) -> Result<Option<entities::notification::Model>, SakhiError> {
    Ok(entities::Notification::find_by_id(notification_id.to_string())
        .one(db)
        .await?)
}

pub fn notification_status(
    n: &entities::notification::Model,
) -> Result<NotificationStatus, SakhiError> {
    n.status
        .parse()
        .map_err(|e: String| SakhiError::Other(format!("notification {}: {}", n.id, e)))
}

/// Apply a delivery state transition, rejecting anything the state machine
/// does not allow. Retrying (failed -> pending) consumes one retry.
pub async fn transition_notification(
    db: &DatabaseConnection,
    notification_id: &str,
    next: NotificationStatus,
    error_message: Option<String>,
) -> Result<entities::notification::Model, SakhiError> {
    let notification = get_notification(db, notification_id)
        .await?
        .ok_or_else(|| SakhiError::not_found("Notification"))?;
    let current = notification_status(&notification)?;

    if !current.can_transition_to(next) {
        return Err(SakhiError::Conflict(format!(
            "notification cannot move from {} to {}",
            current, next
        )));
    }
    if current == NotificationStatus::Failed
        && next == NotificationStatus::Pending
        && notification.retry_count >= notification.max_retries
    {
        return Err(SakhiError::Conflict(
            "notification has exhausted its retries".into(),
        ));
    }

    let now = now();
    let retry_count = notification.retry_count;
    let mut active: entities::notification::ActiveModel = notification.into();
    active.status = Set(next.as_str().to_string());
    match next {
        NotificationStatus::Sent => {
            active.sent_at = Set(Some(now));
            active.error_message = Set(None);
        }
        NotificationStatus::Delivered => active.delivered_at = Set(Some(now)),
        NotificationStatus::Failed => {
            active.error_message = Set(error_message.or_else(|| Some("delivery failed".into())))
        }
        NotificationStatus::Pending => {
            active.retry_count = Set(retry_count + 1);
            active.scheduled_at = Set(now);
        }
        NotificationStatus::Cancelled => {}
    }
    active.updated_at = Set(now);
    Ok(active.update(db).await?)
}

/// Pending notifications that are due, oldest first
pub async fn due_notifications(
    db: &DatabaseConnection,
    now: i64,
    limit: u64,
) -> Result<Vec<entities::notification::Model>, SakhiError> {
    use entities::notification::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::Status.eq(NotificationStatus::Pending.as_str()))
        .filter(Column::ScheduledAt.lte(now))
        .order_by_asc(Column::ScheduledAt)
        .limit(limit)
        .all(db)
        .await?)
}

/// Failed notifications with retries left whose retry delay has elapsed
pub async fn retryable_notifications(
    db: &DatabaseConnection,
    now: i64,
    retry_delay_secs: i64,
) -> Result<Vec<entities::notification::Model>, SakhiError> {
    use entities::notification::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::Status.eq(NotificationStatus::Failed.as_str()))
        .filter(Expr::col(Column::RetryCount).lt(Expr::col(Column::MaxRetries)))
        .filter(Column::UpdatedAt.lte(now - retry_delay_secs))
        .order_by_asc(Column::UpdatedAt)
        .all(db)
        .await?)
}

pub async fn list_notifications(
    db: &DatabaseConnection,
    farmer_id: &str,
    status: Option<NotificationStatus>,
    page: Page,
) -> Result<(Vec<entities::notification::Model>, u64), SakhiError> {
    use entities::notification::{Column, Entity};

    let mut query = Entity::find().filter(Column::FarmerId.eq(farmer_id));
    if let Some(status) = status {
        query = query.filter(Column::Status.eq(status.as_str()));
    }
    let total = query.clone().count(db).await?;
    let items = query
        .order_by_desc(Column::ScheduledAt)
        .offset(page.offset())
        .limit(page.size)
        .all(db)
        .await?;
    Ok((items, total))
}

pub async fn count_pending_notifications(db: &DatabaseConnection) -> Result<u64, SakhiError> {
    use entities::notification::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::Status.eq(NotificationStatus::Pending.as_str()))
        .count(db)
        .await?)
}

// ============================================================================
// Consents
// ============================================================================

pub const CONSENT_VERSION: &str = "1.0";

/// Record a consent decision. Every grant or revoke is a new row; the latest
/// row per kind is the one in force.
pub async fn record_consent(
    db: &DatabaseConnection,
    user_id: &str,
    kind: ConsentKind,
    granted: bool,
    purpose: Option<String>,
) -> Result<entities::consent::Model, SakhiError> {
    let now = now();
    let consent = entities::consent::ActiveModel {
        id: Set(random_id()),
        user_id: Set(user_id.to_string()),
        kind: Set(kind.as_str().to_string()),
        granted: Set(granted),
        purpose: Set(purpose),
        version: Set(CONSENT_VERSION.to_string()),
        granted_at: Set(granted.then_some(now)),
        revoked_at: Set((!granted).then_some(now)),
        created_at: Set(now),
    };
    Ok(consent.insert(db).await?)
}

pub async fn consent_history(
    db: &DatabaseConnection,
    user_id: &str,
) -> Result<Vec<entities::consent::Model>, SakhiError> {
    use entities::consent::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::UserId.eq(user_id))
        .order_by_desc(Column::CreatedAt)
        .all(db)
        .await?)
}

/// Latest consent record per kind
pub async fn current_consents(
    db: &DatabaseConnection,
    user_id: &str,
) -> Result<HashMap<String, entities::consent::Model>, SakhiError> {
    let mut latest: HashMap<String, entities::consent::Model> = HashMap::new();
    // History is newest first, so the first row seen per kind wins
    for consent in consent_history(db, user_id).await? {
        latest.entry(consent.kind.clone()).or_insert(consent);
    }
    Ok(latest)
}

pub async fn has_consent(
    db: &DatabaseConnection,
    user_id: &str,
    kind: ConsentKind,
) -> Result<bool, SakhiError> {
    use entities::consent::{Column, Entity};

    let latest = Entity::find()
        .filter(Column::UserId.eq(user_id))
        .filter(Column::Kind.eq(kind.as_str()))
        .order_by_desc(Column::CreatedAt)
        .one(db)
        .await?;
    Ok(latest.map(|c| c.granted).unwrap_or(false))
}

// ============================================================================
// Audit
// ============================================================================

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub user_id: Option<String>,
    pub action: AuditAction,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub ip_address: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub metadata: Option<Value>,
}

impl AuditEntry {
    pub fn new(user_id: Option<&str>, action: AuditAction) -> Self {
        Self {
            user_id: user_id.map(str::to_string),
            action,
            target_type: None,
            target_id: None,
            ip_address: None,
            success: true,
            error_message: None,
            metadata: None,
        }
    }

    pub fn target(mut self, target_type: &str, target_id: &str) -> Self {
        self.target_type = Some(target_type.to_string());
        self.target_id = Some(target_id.to_string());
        self
    }

    pub fn ip(mut self, ip: Option<String>) -> Self {
        self.ip_address = ip;
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(error.into());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

pub async fn record_audit(
    db: &DatabaseConnection,
    entry: AuditEntry,
) -> Result<entities::audit_log::Model, SakhiError> {
    let metadata = match entry.metadata {
        Some(v) => Some(serde_json::to_string(&v)?),
        None => None,
    };
    let log = entities::audit_log::ActiveModel {
        id: Set(random_id()),
        user_id: Set(entry.user_id),
        action: Set(entry.action.as_str().to_string()),
        target_type: Set(entry.target_type),
        target_id: Set(entry.target_id),
        ip_address: Set(entry.ip_address),
        success: Set(entry.success),
        error_message: Set(entry.error_message),
        metadata: Set(metadata),
        timestamp: Set(now()),
    };
    Ok(log.insert(db).await?)
}

/// Record an audit entry without failing the surrounding operation
pub async fn audit(db: &DatabaseConnection, entry: AuditEntry) {
    let action = entry.action;
    if let Err(e) = record_audit(db, entry).await {
        tracing::warn!(action = %action, error = %e, "Failed to write audit log");
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub user_id: Option<String>,
    pub action: Option<AuditAction>,
    pub from: Option<i64>,
    pub to: Option<i64>,
}

pub async fn list_audit_logs(
    db: &DatabaseConnection,
    filter: &AuditFilter,
    page: Page,
) -> Result<(Vec<entities::audit_log::Model>, u64), SakhiError> {
    use entities::audit_log::{Column, Entity};

    let mut cond = Condition::all();
    if let Some(user_id) = &filter.user_id {
        cond = cond.add(Column::UserId.eq(user_id.as_str()));
    }
    if let Some(action) = filter.action {
        cond = cond.add(Column::Action.eq(action.as_str()));
    }
    if let Some(from) = filter.from {
        cond = cond.add(Column::Timestamp.gte(from));
    }
    if let Some(to) = filter.to {
        cond = cond.add(Column::Timestamp.lte(to));
    }
    let query = Entity::find().filter(cond);
    let total = query.clone().count(db).await?;
    let items = query
        .order_by_desc(Column::Timestamp)
        .offset(page.offset())
        .limit(page.size)
        .all(db)
        .await?;
    Ok((items, total))
}

pub async fn purge_audit_logs(
    db: &DatabaseConnection,
    retention_days: i64,
) -> Result<u64, SakhiError> {
    use entities::audit_log::{Column, Entity};

    let cutoff = now() - retention_days * 86_400;
    let result = Entity::delete_many()
        .filter(Column::Timestamp.lt(cutoff))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

// ============================================================================
// OTP challenges and throttling
// ============================================================================

pub async fn create_otp_challenge(
    db: &DatabaseConnection,
    phone: &str,
    code_hash: &str,
    ttl_secs: i64,
) -> Result<entities::otp_challenge::Model, SakhiError> {
    let now = now();
    let challenge = entities::otp_challenge::ActiveModel {
        req_id: Set(random_id()),
        phone: Set(phone.to_string()),
        code_hash: Set(code_hash.to_string()),
        created_at: Set(now),
        expires_at: Set(now + ttl_secs),
        consumed: Set(false),
    };
    Ok(challenge.insert(db).await?)
}

pub async fn get_otp_challenge(
    db: &DatabaseConnection,
    req_id: &str,
) -> Result<Option<entities::otp_challenge::Model>, SakhiError> {
    Ok(entities::OtpChallenge::find_by_id(req_id.to_string())
        .one(db)
        .await?)
}

/// Mark a live challenge consumed. Returns false when it was already
/// consumed or has expired; only one caller can ever get true.
pub async fn consume_otp_challenge(
    db: &DatabaseConnection,
    req_id: &str,
) -> Result<bool, SakhiError> {
    use entities::otp_challenge::{Column, Entity};

    let result = Entity::update_many()
        .col_expr(Column::Consumed, Expr::value(true))
        .filter(Column::ReqId.eq(req_id))
        .filter(Column::Consumed.eq(false))
        .filter(Column::ExpiresAt.gt(now()))
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

pub async fn get_otp_throttle(
    db: &DatabaseConnection,
    phone: &str,
) -> Result<Option<entities::otp_throttle::Model>, SakhiError> {
    Ok(entities::OtpThrottle::find_by_id(phone.to_string())
        .one(db)
        .await?)
}

pub async fn set_otp_throttle(
    db: &DatabaseConnection,
    phone: &str,
    attempts: i32,
    locked_until: Option<i64>,
) -> Result<(), SakhiError> {
    use entities::otp_throttle::{Column, Entity};
    use sea_orm::sea_query::OnConflict;

    let row = entities::otp_throttle::ActiveModel {
        phone: Set(phone.to_string()),
        attempts: Set(attempts),
        locked_until: Set(locked_until),
        updated_at: Set(now()),
    };
    Entity::insert(row)
        .on_conflict(
            OnConflict::column(Column::Phone)
                .update_columns([Column::Attempts, Column::LockedUntil, Column::UpdatedAt])
                .to_owned(),
        )
        .exec(db)
        .await?;
    Ok(())
}

/// Delete OTP challenges past expiry and unlocked, idle throttle rows
pub async fn cleanup_expired_otp(db: &DatabaseConnection) -> Result<u64, SakhiError> {
    let now = now();
    let challenges = {
        use entities::otp_challenge::{Column, Entity};
        Entity::delete_many()
            .filter(Column::ExpiresAt.lt(now))
            .exec(db)
            .await?
            .rows_affected
    };
    let throttles = {
        use entities::otp_throttle::{Column, Entity};
        Entity::delete_many()
            .filter(
                Condition::any()
                    .add(Column::LockedUntil.is_null())
                    .add(Column::LockedUntil.lt(now)),
            )
            .filter(Column::UpdatedAt.lt(now - 86_400))
            .exec(db)
            .await?
            .rows_affected
    };
    Ok(challenges + throttles)
}

// ============================================================================
// Refresh tokens
// ============================================================================

pub async fn store_refresh_token(
    db: &DatabaseConnection,
    jti: &str,
    user_id: &str,
    expires_at: i64,
    parent_jti: Option<String>,
) -> Result<entities::refresh_token::Model, SakhiError> {
    let token = entities::refresh_token::ActiveModel {
        jti: Set(jti.to_string()),
        user_id: Set(user_id.to_string()),
        created_at: Set(now()),
        expires_at: Set(expires_at),
        revoked: Set(false),
        parent_jti: Set(parent_jti),
    };
    Ok(token.insert(db).await?)
}

/// A refresh token that is neither revoked nor expired
pub async fn get_refresh_token(
    db: &DatabaseConnection,
    jti: &str,
) -> Result<Option<entities::refresh_token::Model>, SakhiError> {
    let Some(model) = entities::RefreshToken::find_by_id(jti.to_string())
        .one(db)
        .await?
    else {
        return Ok(None);
    };
    if model.revoked || now() > model.expires_at {
        return Ok(None);
    }
    Ok(Some(model))
}

/// Revoke a live refresh token. Returns false when it was already revoked
/// or expired, so concurrent rotations of one token yield a single winner.
pub async fn revoke_refresh_token(db: &DatabaseConnection, jti: &str) -> Result<bool, SakhiError> {
    use entities::refresh_token::{Column, Entity};

    let result = Entity::update_many()
        .col_expr(Column::Revoked, Expr::value(true))
        .filter(Column::Jti.eq(jti))
        .filter(Column::Revoked.eq(false))
        .filter(Column::ExpiresAt.gte(now()))
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

pub async fn revoke_user_refresh_tokens(
    db: &DatabaseConnection,
    user_id: &str,
) -> Result<u64, SakhiError> {
    use entities::refresh_token::{Column, Entity};

    let result = Entity::update_many()
        .col_expr(Column::Revoked, Expr::value(true))
        .filter(Column::UserId.eq(user_id))
        .filter(Column::Revoked.eq(false))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

pub async fn cleanup_expired_refresh_tokens(db: &DatabaseConnection) -> Result<u64, SakhiError> {
    use entities::refresh_token::{Column, Entity};

    let result = Entity::delete_many()
        .filter(Column::ExpiresAt.lt(now()))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

// ============================================================================
// External data: weather, pests, prices
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWeatherObs {
    pub district: String,
    pub timestamp: Option<i64>,
    pub temp_c: Option<f64>,
    pub temp_min_c: Option<f64>,
    pub temp_max_c: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed_ms: Option<f64>,
    pub rain_24h_mm: Option<f64>,
    #[serde(default)]
    pub is_forecast: bool,
    pub source: Option<String>,
}

pub async fn insert_weather_obs(
    db: &DatabaseConnection,
    input: NewWeatherObs,
) -> Result<entities::weather_obs::Model, SakhiError> {
    require_non_empty("district", &input.district)?;
    if let Some(h) = input.humidity {
        if !(0.0..=100.0).contains(&h) {
            return Err(SakhiError::BadRequest("humidity must be within 0..100".into()));
        }
    }
    let now = now();
    let obs = entities::weather_obs::ActiveModel {
        id: Set(random_id()),
        district: Set(input.district.trim().to_string()),
        timestamp: Set(input.timestamp.unwrap_or(now)),
        temp_c: Set(input.temp_c),
        temp_min_c: Set(input.temp_min_c),
        temp_max_c: Set(input.temp_max_c),
        humidity: Set(input.humidity),
        wind_speed_ms: Set(input.wind_speed_ms),
        rain_24h_mm: Set(input.rain_24h_mm),
        is_forecast: Set(input.is_forecast),
        source: Set(input.source.unwrap_or_else(|| "manual".to_string())),
        created_at: Set(now),
    };
    Ok(obs.insert(db).await?)
}

pub async fn latest_weather(
    db: &DatabaseConnection,
    district: &str,
) -> Result<Option<entities::weather_obs::Model>, SakhiError> {
    use entities::weather_obs::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::District.eq(district))
        .order_by_desc(Column::Timestamp)
        .one(db)
        .await?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPestReport {
    pub crop: String,
    pub pest_name: String,
    pub district: String,
    pub severity: PestSeverity,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub timestamp: Option<i64>,
    pub symptoms: Option<String>,
    pub control_measures: Option<String>,
    pub source: Option<String>,
}

pub async fn insert_pest_report(
    db: &DatabaseConnection,
    input: NewPestReport,
) -> Result<entities::pest_report::Model, SakhiError> {
    require_non_empty("crop", &input.crop)?;
    require_non_empty("pest_name", &input.pest_name)?;
    require_non_empty("district", &input.district)?;
    validate_coords(input.lat, input.lon)?;
    let now = now();
    let report = entities::pest_report::ActiveModel {
        id: Set(random_id()),
        crop: Set(input.crop.trim().to_string()),
        pest_name: Set(input.pest_name.trim().to_string()),
        district: Set(input.district.trim().to_string()),
        severity: Set(input.severity.as_str().to_string()),
        lat: Set(input.lat),
        lon: Set(input.lon),
        timestamp: Set(input.timestamp.unwrap_or(now)),
        symptoms: Set(input.symptoms),
        control_measures: Set(input.control_measures),
        source: Set(input.source.unwrap_or_else(|| "manual".to_string())),
        created_at: Set(now),
    };
    Ok(report.insert(db).await?)
}

pub async fn pest_reports_in_district(
    db: &DatabaseConnection,
    district: &str,
    since: i64,
) -> Result<Vec<entities::pest_report::Model>, SakhiError> {
    use entities::pest_report::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::District.eq(district))
        .filter(Column::Timestamp.gte(since))
        .order_by_desc(Column::Timestamp)
        .all(db)
        .await?)
}

/// Located pest reports inside a lat/lon bounding box
pub async fn pest_reports_in_box(
    db: &DatabaseConnection,
    bbox: crate::geo::BoundingBox,
    since: i64,
) -> Result<Vec<entities::pest_report::Model>, SakhiError> {
    use entities::pest_report::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::Lat.between(bbox.min_lat, bbox.max_lat))
        .filter(Column::Lon.between(bbox.min_lon, bbox.max_lon))
        .filter(Column::Timestamp.gte(since))
        .order_by_desc(Column::Timestamp)
        .all(db)
        .await?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPricePoint {
    pub market: String,
    pub commodity: String,
    pub variety: Option<String>,
    pub timestamp: Option<i64>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub modal_price: Option<f64>,
    pub unit: Option<String>,
    pub source: Option<String>,
}

pub async fn insert_price_point(
    db: &DatabaseConnection,
    input: NewPricePoint,
) -> Result<entities::price_point::Model, SakhiError> {
    require_non_empty("market", &input.market)?;
    require_non_empty("commodity", &input.commodity)?;
    if let (Some(min), Some(max)) = (input.min_price, input.max_price) {
        if min > max {
            return Err(SakhiError::BadRequest(
                "min_price must not exceed max_price".into(),
            ));
        }
    }
    let now = now();
    let point = entities::price_point::ActiveModel {
        id: Set(random_id()),
        market: Set(input.market.trim().to_string()),
        commodity: Set(input.commodity.trim().to_string()),
        variety: Set(input.variety),
        timestamp: Set(input.timestamp.unwrap_or(now)),
        min_price: Set(input.min_price),
        max_price: Set(input.max_price),
        modal_price: Set(input.modal_price),
        unit: Set(input.unit.unwrap_or_else(|| "quintal".to_string())),
        source: Set(input.source.unwrap_or_else(|| "manual".to_string())),
        created_at: Set(now),
    };
    Ok(point.insert(db).await?)
}

pub async fn latest_prices(
    db: &DatabaseConnection,
    commodity: &str,
    limit: u64,
) -> Result<Vec<entities::price_point::Model>, SakhiError> {
    use entities::price_point::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::Commodity.eq(commodity))
        .order_by_desc(Column::Timestamp)
        .limit(limit)
        .all(db)
        .await?)
}

// ============================================================================
// Knowledge base
// ============================================================================

#[derive(Debug, Clone)]
pub struct NewKbDoc {
    pub title: String,
    pub source: String,
    pub language: String,
    pub url: Option<String>,
    pub content: String,
}

/// Chunk text with its character span and embedding
#[derive(Debug, Clone)]
pub struct NewKbChunk {
    pub text: String,
    pub start_char: usize,
    pub end_char: usize,
    pub embedding: Vec<f32>,
}

pub async fn create_kb_doc(
    db: &DatabaseConnection,
    doc: NewKbDoc,
    chunks: Vec<NewKbChunk>,
) -> Result<(entities::kb_doc::Model, Vec<entities::kb_chunk::Model>), SakhiError> {
    require_non_empty("title", &doc.title)?;
    require_non_empty("content", &doc.content)?;
    let now = now();
    let doc_id = random_id();

    let txn = db.begin().await?;
    let doc = entities::kb_doc::ActiveModel {
        id: Set(doc_id.clone()),
        title: Set(doc.title.trim().to_string()),
        source: Set(doc.source),
        language: Set(doc.language),
        url: Set(doc.url),
        word_count: Set(doc.content.split_whitespace().count() as i32),
        content: Set(doc.content),
        is_active: Set(true),
        created_at: Set(now),
    }
    .insert(&txn)
    .await?;

    let mut stored = Vec::with_capacity(chunks.len());
    for (ord, chunk) in chunks.into_iter().enumerate() {
        let row = entities::kb_chunk::ActiveModel {
            id: Set(random_id()),
            doc_id: Set(doc_id.clone()),
            ord: Set(ord as i32),
            text: Set(chunk.text),
            start_char: Set(chunk.start_char as i32),
            end_char: Set(chunk.end_char as i32),
            embedding: Set(serde_json::to_string(&chunk.embedding)?),
            created_at: Set(now),
        }
        .insert(&txn)
        .await?;
        stored.push(row);
    }
    txn.commit().await?;
    Ok((doc, stored))
}

pub async fn get_kb_doc(
    db: &DatabaseConnection,
    doc_id: &str,
) -> Result<Option<entities::kb_doc::Model>, SakhiError> {
    Ok(entities::KbDoc::find_by_id(doc_id.to_string()).one(db).await?)
}

pub async fn list_kb_docs(
    db: &DatabaseConnection,
    language: Option<&str>,
) -> Result<Vec<entities::kb_doc::Model>, SakhiError> {
    use entities::kb_doc::{Column, Entity};

    let mut query = Entity::find().filter(Column::IsActive.eq(true));
    if let Some(lang) = language {
        query = query.filter(Column::Language.eq(lang));
    }
    Ok(query.order_by_asc(Column::Title).all(db).await?)
}

pub async fn kb_doc_chunks(
    db: &DatabaseConnection,
    doc_id: &str,
) -> Result<Vec<entities::kb_chunk::Model>, SakhiError> {
    use entities::kb_chunk::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::DocId.eq(doc_id))
        .order_by_asc(Column::Ord)
        .all(db)
        .await?)
}

/// Chunks of all active documents, paired with their document
pub async fn searchable_chunks(
    db: &DatabaseConnection,
    language: Option<&str>,
) -> Result<Vec<(entities::kb_doc::Model, entities::kb_chunk::Model)>, SakhiError> {
    use entities::kb_chunk::{Column, Entity};

    let docs = list_kb_docs(db, language).await?;
    if docs.is_empty() {
        return Ok(Vec::new());
    }
    let by_id: HashMap<String, entities::kb_doc::Model> =
        docs.into_iter().map(|d| (d.id.clone(), d)).collect();
    let chunks = Entity::find()
        .filter(Column::DocId.is_in(by_id.keys().cloned().collect::<Vec<_>>()))
        .all(db)
        .await?;
    Ok(chunks
        .into_iter()
        .filter_map(|c| by_id.get(&c.doc_id).map(|d| (d.clone(), c)))
        .collect())
}

pub async fn delete_kb_doc(db: &DatabaseConnection, doc_id: &str) -> Result<(), SakhiError> {
    use entities::kb_chunk::{Column, Entity};

    if get_kb_doc(db, doc_id).await?.is_none() {
        return Err(SakhiError::not_found("Document"));
    }
    let txn = db.begin().await?;
    Entity::delete_many()
        .filter(Column::DocId.eq(doc_id))
        .exec(&txn)
        .await?;
    entities::KbDoc::delete_by_id(doc_id.to_string())
        .exec(&txn)
        .await?;
    txn.commit().await?;
    Ok(())
}

// ============================================================================
// Privacy: export and erasure
// ============================================================================

/// Everything held about a user, as one JSON document
pub async fn export_user_data(db: &DatabaseConnection, user_id: &str) -> Result<Value, SakhiError> {
    let user = get_user(db, user_id)
        .await?
        .ok_or_else(|| SakhiError::not_found("User"))?;
    let farmer = get_farmer_by_user(db, user_id).await?;

    let mut farms = Vec::new();
    let mut fields = Vec::new();
    let mut activities = Vec::new();
    let mut advisories = Vec::new();
    let mut reminders = Vec::new();
    let mut notifications = Vec::new();

    if let Some(farmer) = &farmer {
        farms = list_farms(db, &farmer.id).await?;
        fields = list_fields_for_farmer(db, &farmer.id).await?;
        activities = {
            use entities::activity::{Column, Entity};
            Entity::find()
                .filter(Column::FarmerId.eq(farmer.id.as_str()))
                .order_by_desc(Column::Timestamp)
                .all(db)
                .await?
                .into_iter()
                .map(ActivityView::from)
                .collect()
        };
        advisories = {
            use entities::advisory::{Column, Entity};
            Entity::find()
                .filter(Column::FarmerId.eq(farmer.id.as_str()))
                .order_by_desc(Column::Timestamp)
                .all(db)
                .await?
                .into_iter()
                .map(AdvisoryView::from)
                .collect()
        };
        reminders = list_reminders(db, &farmer.id, true).await?;
        notifications = {
            use entities::notification::{Column, Entity};
            Entity::find()
                .filter(Column::FarmerId.eq(farmer.id.as_str()))
                .order_by_desc(Column::CreatedAt)
                .all(db)
                .await?
        };
    }

    let consents = consent_history(db, user_id).await?;
    let audit_logs = {
        use entities::audit_log::{Column, Entity};
        Entity::find()
            .filter(Column::UserId.eq(user_id))
            .order_by_desc(Column::Timestamp)
            .all(db)
            .await?
    };

    Ok(json!({
        "export_info": {
            "user_id": user_id,
            "exported_at": now(),
            "format_version": "1.0",
        },
        "user": user,
        "farmer": farmer.map(FarmerView::from),
        "farms": farms,
        "fields": fields,
        "activities": activities,
        "advisories": advisories,
        "reminders": reminders,
        "notifications": notifications,
        "consents": consents,
        "audit_logs": audit_logs,
    }))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErasureSummary {
    pub activities: u64,
    pub advisories: u64,
    pub reminders: u64,
    pub notifications: u64,
    pub fields: u64,
    pub farms: u64,
    pub farmer: u64,
    pub consents: u64,
    pub media: u64,
    pub refresh_tokens_revoked: u64,
    /// Media files to remove from disk, relative to the media root
    #[serde(skip)]
    pub media_paths: Vec<String>,
}

/// Delete farmer-linked data and anonymize the user. Audit logs are kept.
pub async fn erase_user_data(
    db: &DatabaseConnection,
    user_id: &str,
) -> Result<ErasureSummary, SakhiError> {
    let user = get_user(db, user_id)
        .await?
        .ok_or_else(|| SakhiError::not_found("User"))?;
    let farmer = get_farmer_by_user(db, user_id).await?;
    let mut summary = ErasureSummary::default();

    let txn = db.begin().await?;

    if let Some(farmer) = farmer {
        let fid = farmer.id.as_str();
        summary.notifications = entities::Notification::delete_many()
            .filter(entities::notification::Column::FarmerId.eq(fid))
            .exec(&txn)
            .await?
            .rows_affected;
        summary.reminders = entities::Reminder::delete_many()
            .filter(entities::reminder::Column::FarmerId.eq(fid))
            .exec(&txn)
            .await?
            .rows_affected;
        summary.advisories = entities::Advisory::delete_many()
            .filter(entities::advisory::Column::FarmerId.eq(fid))
            .exec(&txn)
            .await?
            .rows_affected;
        summary.activities = entities::Activity::delete_many()
            .filter(entities::activity::Column::FarmerId.eq(fid))
            .exec(&txn)
            .await?
            .rows_affected;

        let farm_ids: Vec<String> = entities::Farm::find()
            .filter(entities::farm::Column::FarmerId.eq(fid))
            .all(&txn)
            .await?
            .into_iter()
            .map(|f| f.id)
            .collect();
        if !farm_ids.is_empty() {
            summary.fields = entities::Field::delete_many()
                .filter(entities::field::Column::FarmId.is_in(farm_ids))
                .exec(&txn)
                .await?
                .rows_affected;
        }
        summary.farms = entities::Farm::delete_many()
            .filter(entities::farm::Column::FarmerId.eq(fid))
            .exec(&txn)
            .await?
            .rows_affected;
        summary.farmer = entities::Farmer::delete_by_id(farmer.id.clone())
            .exec(&txn)
            .await?
            .rows_affected;
    }

    summary.media_paths = entities::Media::find()
        .filter(entities::media::Column::OwnerUserId.eq(user_id))
        .all(&txn)
        .await?
        .into_iter()
        .map(|m| m.rel_path)
        .collect();
    summary.media = entities::Media::delete_many()
        .filter(entities::media::Column::OwnerUserId.eq(user_id))
        .exec(&txn)
        .await?
        .rows_affected;
    summary.consents = entities::Consent::delete_many()
        .filter(entities::consent::Column::UserId.eq(user_id))
        .exec(&txn)
        .await?
        .rows_affected;
    summary.refresh_tokens_revoked = entities::RefreshToken::update_many()
        .col_expr(entities::refresh_token::Column::Revoked, Expr::value(true))
        .filter(entities::refresh_token::Column::UserId.eq(user_id))
        .filter(entities::refresh_token::Column::Revoked.eq(false))
        .exec(&txn)
        .await?
        .rows_affected;

    let now = now();
    let mut active: entities::user::ActiveModel = user.into();
    active.phone = Set(format!("deleted:{}", user_id));
    active.is_active = Set(false);
    active.is_verified = Set(false);
    active.updated_at = Set(now);
    active.update(&txn).await?;

    txn.commit().await?;
    Ok(summary)
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemStats {
    pub users: u64,
    pub farmers: u64,
    pub activities: u64,
    pub advisories: u64,
    pub pending_notifications: u64,
    pub kb_documents: u64,
}

pub async fn system_stats(db: &DatabaseConnection) -> Result<SystemStats, SakhiError> {
    Ok(SystemStats {
        users: entities::User::find().count(db).await?,
        farmers: entities::Farmer::find().count(db).await?,
        activities: entities::Activity::find().count(db).await?,
        advisories: entities::Advisory::find().count(db).await?,
        pending_notifications: count_pending_notifications(db).await?,
        kb_documents: entities::KbDoc::find().count(db).await?,
    })
}

pub async fn ping(db: &DatabaseConnection) -> Result<(), SakhiError> {
    db.ping().await?;
    Ok(())
}
