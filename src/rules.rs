//! Advisory rules engine.
//!
//! Rules are evaluated against a [`Facts`] snapshot for one farmer. Evaluation
//! is pure; [`generate_for_farmer`] gathers the facts, applies the duplicate
//! window, persists what fired and pushes it to the farmer's live channel.

use crate::entities;
use crate::errors::SakhiError;
use crate::llm::{AdvisoryContext, LlmProvider};
use crate::storage::{self, AdvisoryView, NewAdvisory};
use crate::types::{AdvisorySeverity, AdvisorySource, PestSeverity};
use crate::ws::{ConnectionHub, MessageType, RealtimeMessage};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::{json, Value};

/// Pest reports older than this are ignored
pub const PEST_LOOKBACK_SECS: i64 = 7 * 24 * 3600;
/// An advisory with the same title is not re-issued within this window
pub const DEDUPE_WINDOW_SECS: i64 = 24 * 3600;

const GENERAL_ADVISORY_TITLE: &str = "General Farming Advisory";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeatherMetric {
    Rain24hMm,
    WindSpeedMs,
    TempMaxC,
    TempMinC,
}

impl WeatherMetric {
    fn read(&self, obs: &entities::weather_obs::Model) -> Option<f64> {
        match self {
            WeatherMetric::Rain24hMm => obs.rain_24h_mm,
            WeatherMetric::WindSpeedMs => obs.wind_speed_ms,
            WeatherMetric::TempMaxC => obs.temp_max_c,
            WeatherMetric::TempMinC => obs.temp_min_c,
        }
    }

    fn key(&self) -> &'static str {
        match self {
            WeatherMetric::Rain24hMm => "rain_24h_mm",
            WeatherMetric::WindSpeedMs => "wind_speed_ms",
            WeatherMetric::TempMaxC => "temp_max_c",
            WeatherMetric::TempMinC => "temp_min_c",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Threshold {
    Above(f64),
    Below(f64),
}

impl Threshold {
    fn holds(&self, value: f64) -> bool {
        match *self {
            Threshold::Above(limit) => value > limit,
            Threshold::Below(limit) => value < limit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WeatherRule {
    pub name: String,
    pub condition: String,
    pub metric: WeatherMetric,
    pub threshold: Threshold,
    pub severity: AdvisorySeverity,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct PestRule {
    pub name: String,
    pub crop: String,
    pub pest: String,
    pub severity: AdvisorySeverity,
}

#[derive(Debug, Clone)]
pub struct CropStageRule {
    pub name: String,
    pub crop: String,
    pub stage: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub enum RuleKind {
    Weather(WeatherRule),
    Pest(PestRule),
    CropStage(CropStageRule),
}

#[derive(Debug, Clone)]
pub struct Rule {
    /// Lower runs first
    pub priority: i32,
    pub kind: RuleKind,
}

impl Rule {
    pub fn name(&self) -> &str {
        match &self.kind {
            RuleKind::Weather(r) => &r.name,
            RuleKind::Pest(r) => &r.name,
            RuleKind::CropStage(r) => &r.name,
        }
    }
}

/// Everything the rules look at for one farmer
#[derive(Debug, Clone, Default)]
pub struct Facts {
    pub farmer_id: String,
    pub district: String,
    pub language: String,
    pub weather: Option<entities::weather_obs::Model>,
    pub pest_reports: Vec<entities::pest_report::Model>,
    pub crops: Vec<String>,
    pub fields: Vec<entities::field::Model>,
}

impl Facts {
    fn grows(&self, crop: &str) -> bool {
        self.crops.iter().any(|c| c.eq_ignore_ascii_case(crop))
    }
}

/// An advisory the rules want to issue, before dedupe and persistence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdvisoryDraft {
    pub title: String,
    pub text: String,
    pub severity: AdvisorySeverity,
    pub source: AdvisorySource,
    pub tags: Vec<String>,
    pub metadata: Value,
    pub rule_name: String,
    pub field_id: Option<String>,
}

fn weather_rule(
    priority: i32,
    name: &str,
    condition: &str,
    metric: WeatherMetric,
    threshold: Threshold,
    severity: AdvisorySeverity,
    text: &str,
) -> Rule {
    Rule {
        priority,
        kind: RuleKind::Weather(WeatherRule {
            name: name.to_string(),
            condition: condition.to_string(),
            metric,
            threshold,
            severity,
            text: text.to_string(),
        }),
    }
}

fn pest_rule(priority: i32, name: &str, crop: &str, pest: &str, severity: AdvisorySeverity) -> Rule {
    Rule {
        priority,
        kind: RuleKind::Pest(PestRule {
            name: name.to_string(),
            crop: crop.to_string(),
            pest: pest.to_string(),
            severity,
        }),
    }
}

fn crop_stage_rule(priority: i32, name: &str, crop: &str, stage: &str, text: &str) -> Rule {
    Rule {
        priority,
        kind: RuleKind::CropStage(CropStageRule {
            name: name.to_string(),
            crop: crop.to_string(),
            stage: stage.to_string(),
            text: text.to_string(),
        }),
    }
}

/// Built-in rule set, sorted by priority
pub fn builtin_rules() -> Vec<Rule> {
    use AdvisorySeverity::*;
    use WeatherMetric::*;

    let mut rules = vec![
        weather_rule(10, "Rain", "rain_forecast", Rain24hMm, Threshold::Above(10.0), Medium,
            "മഴ പ്രതീക്ഷിക്കുന്നു. തളിക്കൽ ഒഴിവാക്കുക."),
        weather_rule(20, "Wind", "high_wind", WindSpeedMs, Threshold::Above(6.0), Medium,
            "ഉയർന്ന കാറ്റ്. തളിക്കൽ താമസിപ്പിക്കുക."),
        weather_rule(15, "Heat", "high_temperature", TempMaxC, Threshold::Above(35.0), High,
            "ഉയർന്ന താപനില. ജലസേചനം വർദ്ധിപ്പിക്കുക."),
        weather_rule(25, "Cold", "low_temperature", TempMinC, Threshold::Below(20.0), Medium,
            "താഴ്ന്ന താപനില. സസ്യ സംരക്ഷണം ആവശ്യമാണ്."),
        pest_rule(5, "Rice Blast", "Rice", "Rice Blast", High),
        pest_rule(5, "Brown Plant Hopper", "Rice", "Brown Plant Hopper", High),
        pest_rule(10, "Banana Aphid", "Banana", "Banana Aphid", Medium),
        pest_rule(5, "Fruit Borer", "Brinjal", "Fruit Borer", High),
        crop_stage_rule(30, "Rice Harvest Time", "Rice", "maturity",
            "പാട്ട വിളവെടുപ്പിന് തയ്യാറാണ്. വിളവെടുപ്പ് പദ്ധതിയാക്കുക."),
        crop_stage_rule(30, "Rice Transplanting", "Rice", "transplanting",
            "പാട്ട നടാനുള്ള സമയമാണ്. നടൽ പദ്ധതിയാക്കുക."),
        crop_stage_rule(30, "Banana Harvest Time", "Banana", "maturity",
            "വാഴ വിളവെടുപ്പിന് തയ്യാറാണ്. വിളവെടുപ്പ് പദ്ധതിയാക്കുക."),
    ];
    rules.sort_by_key(|r| r.priority);
    rules
}

fn eval_weather(rule: &WeatherRule, facts: &Facts) -> Option<AdvisoryDraft> {
    let obs = facts.weather.as_ref()?;
    // A missing reading never triggers
    let value = rule.metric.read(obs)?;
    if !rule.threshold.holds(value) {
        return None;
    }
    Some(AdvisoryDraft {
        title: format!("Weather Advisory - {}", rule.name),
        text: rule.text.clone(),
        severity: rule.severity,
        source: AdvisorySource::Weather,
        tags: vec!["weather".into(), rule.condition.clone()],
        metadata: json!({
            "district": facts.district,
            "observation_id": obs.id,
            "observed_at": obs.timestamp,
            rule.metric.key(): value,
        }),
        rule_name: rule.name.clone(),
        field_id: None,
    })
}

fn eval_pest(rule: &PestRule, facts: &Facts) -> Option<AdvisoryDraft> {
    if !facts.grows(&rule.crop) {
        return None;
    }
    let report = facts.pest_reports.iter().find(|r| {
        r.crop.eq_ignore_ascii_case(&rule.crop)
            && r.pest_name.eq_ignore_ascii_case(&rule.pest)
            && matches!(
                r.severity.parse::<PestSeverity>(),
                Ok(PestSeverity::High | PestSeverity::Critical)
            )
    })?;
    Some(AdvisoryDraft {
        title: format!("Pest Alert - {}", rule.pest),
        text: format!(
            "{} detected in {}. Please take immediate action.",
            rule.pest, rule.crop
        ),
        severity: rule.severity,
        source: AdvisorySource::PestAlert,
        tags: vec!["pest".into(), rule.crop.to_lowercase(), rule.pest.to_lowercase()],
        metadata: json!({
            "district": facts.district,
            "report_id": report.id,
            "reported_at": report.timestamp,
            "report_severity": report.severity,
            "control_measures": report.control_measures,
        }),
        rule_name: rule.name.clone(),
        field_id: None,
    })
}

fn eval_crop_stage(rule: &CropStageRule, facts: &Facts) -> Option<AdvisoryDraft> {
    let field = facts.fields.iter().find(|f| {
        matches!(
            (&f.crop, &f.stage),
            (Some(crop), Some(stage))
                if crop.eq_ignore_ascii_case(&rule.crop) && stage.eq_ignore_ascii_case(&rule.stage)
        )
    })?;
    Some(AdvisoryDraft {
        title: format!("Crop Stage Advisory - {}", rule.crop),
        text: rule.text.clone(),
        severity: AdvisorySeverity::Medium,
        source: AdvisorySource::CropCalendar,
        tags: vec!["crop_stage".into(), rule.crop.to_lowercase(), rule.stage.to_lowercase()],
        metadata: json!({
            "field_id": field.id,
            "field_name": field.name,
            "stage": rule.stage,
        }),
        rule_name: rule.name.clone(),
        field_id: Some(field.id.clone()),
    })
}

/// Evaluate `rules` in priority order
pub fn evaluate(rules: &[Rule], facts: &Facts) -> Vec<AdvisoryDraft> {
    let mut ordered: Vec<&Rule> = rules.iter().collect();
    ordered.sort_by_key(|r| r.priority);
    ordered
        .into_iter()
        .filter_map(|rule| match &rule.kind {
            RuleKind::Weather(r) => eval_weather(r, facts),
            RuleKind::Pest(r) => eval_pest(r, facts),
            RuleKind::CropStage(r) => eval_crop_stage(r, facts),
        })
        .collect()
}

/// Collect the facts for a farmer, optionally narrowed to one field
pub async fn build_facts(
    db: &DatabaseConnection,
    farmer: &entities::farmer::Model,
    field_id: Option<&str>,
) -> Result<Facts, SakhiError> {
    let since = Utc::now().timestamp() - PEST_LOOKBACK_SECS;
    let fields = match field_id {
        Some(id) => vec![storage::get_field_of_farmer(db, id, &farmer.id)
            .await?
            .ok_or_else(|| SakhiError::not_found("Field"))?],
        None => storage::list_fields_for_farmer(db, &farmer.id).await?,
    };
    Ok(Facts {
        farmer_id: farmer.id.clone(),
        district: farmer.district.clone(),
        language: farmer.language_pref.clone(),
        weather: storage::latest_weather(db, &farmer.district).await?,
        pest_reports: storage::pest_reports_in_district(db, &farmer.district, since).await?,
        crops: storage::farmer_crops(db, farmer).await?,
        fields,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateResponse {
    pub advisories: Vec<AdvisoryView>,
    pub generated: usize,
}

async fn persist(
    db: &DatabaseConnection,
    hub: &ConnectionHub,
    farmer_id: &str,
    draft: AdvisoryDraft,
) -> Result<AdvisoryView, SakhiError> {
    let advisory = storage::create_advisory(
        db,
        NewAdvisory {
            farmer_id: farmer_id.to_string(),
            field_id: draft.field_id,
            title: draft.title,
            text: draft.text,
            severity: draft.severity,
            tags: draft.tags,
            source: draft.source,
            source_data: Some(draft.metadata),
            rule_name: Some(draft.rule_name),
            expires_at: None,
        },
    )
    .await?;
    let view = AdvisoryView::from(advisory);
    hub.send_to_farmer(
        farmer_id,
        RealtimeMessage::new(MessageType::Advisory, json!(view)),
    );
    Ok(view)
}

fn llm_context(facts: &Facts) -> AdvisoryContext {
    AdvisoryContext {
        district: facts.district.clone(),
        crops: facts.crops.clone(),
        language: facts.language.clone(),
        rain_24h_mm: facts.weather.as_ref().and_then(|w| w.rain_24h_mm),
        wind_speed_ms: facts.weather.as_ref().and_then(|w| w.wind_speed_ms),
        temp_max_c: facts.weather.as_ref().and_then(|w| w.temp_max_c),
        pest_alert: !facts.pest_reports.is_empty(),
    }
}

/// Run the rules for a farmer and store the advisories that are not
/// duplicates. When no rule fired at all the LLM supplies a general one.
pub async fn generate_for_farmer(
    db: &DatabaseConnection,
    llm: &LlmProvider,
    hub: &ConnectionHub,
    rules: &[Rule],
    farmer: &entities::farmer::Model,
    field_id: Option<&str>,
) -> Result<GenerateResponse, SakhiError> {
    let facts = build_facts(db, farmer, field_id).await?;
    let drafts = evaluate(rules, &facts);
    let since = Utc::now().timestamp() - DEDUPE_WINDOW_SECS;

    let mut advisories = Vec::new();
    let mut skipped = 0usize;
    for draft in drafts {
        if storage::recent_advisory_exists(db, &farmer.id, &draft.title, since).await? {
            tracing::debug!(farmer_id = %farmer.id, title = %draft.title, "Skipping duplicate advisory");
            skipped += 1;
            continue;
        }
        advisories.push(persist(db, hub, &farmer.id, draft).await?);
    }

    if advisories.is_empty()
        && skipped == 0
        && !storage::recent_advisory_exists(db, &farmer.id, GENERAL_ADVISORY_TITLE, since).await?
    {
        let text = llm.advise(&llm_context(&facts)).await;
        let draft = AdvisoryDraft {
            title: GENERAL_ADVISORY_TITLE.to_string(),
            text,
            severity: AdvisorySeverity::Low,
            source: AdvisorySource::AiModel,
            tags: vec!["general".into()],
            metadata: json!({ "provider": llm.name(), "district": facts.district }),
            rule_name: "llm_general".to_string(),
            field_id: field_id.map(str::to_string),
        };
        advisories.push(persist(db, hub, &farmer.id, draft).await?);
    }

    tracing::info!(
        farmer_id = %farmer.id,
        generated = advisories.len(),
        skipped,
        "Advisory generation finished"
    );
    Ok(GenerateResponse {
        generated: advisories.len(),
        advisories,
    })
}

/// Generate advisories for every farmer. Failures for one farmer are logged
/// and do not stop the run. Returns the number of advisories stored.
pub async fn generate_for_all(
    db: &DatabaseConnection,
    llm: &LlmProvider,
    hub: &ConnectionHub,
    rules: &[Rule],
) -> Result<usize, SakhiError> {
    let mut total = 0;
    for farmer in storage::all_farmers(db).await? {
        match generate_for_farmer(db, llm, hub, rules, &farmer, None).await {
            Ok(resp) => total += resp.generated,
            Err(e) => tracing::error!(farmer_id = %farmer.id, error = %e, "Advisory generation failed"),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(rain: Option<f64>, wind: Option<f64>, tmax: Option<f64>, tmin: Option<f64>) -> entities::weather_obs::Model {
        entities::weather_obs::Model {
            id: "obs-1".into(),
            district: "Thrissur".into(),
            timestamp: 1_700_000_000,
            temp_c: None,
            temp_min_c: tmin,
            temp_max_c: tmax,
            humidity: None,
            wind_speed_ms: wind,
            rain_24h_mm: rain,
            is_forecast: true,
            source: "test".into(),
            created_at: 1_700_000_000,
        }
    }

    fn report(crop: &str, pest: &str, severity: &str) -> entities::pest_report::Model {
        entities::pest_report::Model {
            id: format!("{crop}-{pest}"),
            crop: crop.into(),
            pest_name: pest.into(),
            district: "Thrissur".into(),
            severity: severity.into(),
            lat: None,
            lon: None,
            timestamp: 1_700_000_000,
            symptoms: None,
            control_measures: None,
            source: "test".into(),
            created_at: 1_700_000_000,
        }
    }

    fn field(crop: &str, stage: &str) -> entities::field::Model {
        entities::field::Model {
            id: "field-1".into(),
            farm_id: "farm-1".into(),
            name: "North plot".into(),
            crop: Some(crop.into()),
            variety: None,
            sow_date: None,
            stage: Some(stage.into()),
            area_ha: Some(0.5),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn facts() -> Facts {
        Facts {
            farmer_id: "farmer-1".into(),
            district: "Thrissur".into(),
            language: "ml-IN".into(),
            ..Facts::default()
        }
    }

    fn titles(drafts: &[AdvisoryDraft]) -> Vec<&str> {
        drafts.iter().map(|d| d.title.as_str()).collect()
    }

    #[test]
    fn test_rain_fires_above_threshold() {
        let mut f = facts();
        f.weather = Some(obs(Some(25.0), Some(2.0), Some(30.0), Some(22.0)));
        let drafts = evaluate(&builtin_rules(), &f);
        assert_eq!(titles(&drafts), vec!["Weather Advisory - Rain"]);
        assert_eq!(drafts[0].severity, AdvisorySeverity::Medium);
        assert_eq!(drafts[0].source, AdvisorySource::Weather);
        assert_eq!(drafts[0].tags, vec!["weather", "rain_forecast"]);
        assert_eq!(drafts[0].metadata["rain_24h_mm"], 25.0);
    }

    #[test]
    fn test_thresholds_are_strict() {
        let mut f = facts();
        f.weather = Some(obs(Some(10.0), Some(6.0), Some(35.0), Some(20.0)));
        assert!(evaluate(&builtin_rules(), &f).is_empty());
    }

    #[test]
    fn test_missing_readings_never_fire() {
        let mut f = facts();
        f.weather = Some(obs(None, None, None, None));
        assert!(evaluate(&builtin_rules(), &f).is_empty());
        f.weather = None;
        assert!(evaluate(&builtin_rules(), &f).is_empty());
    }

    #[test]
    fn test_weather_rules_in_priority_order() {
        let mut f = facts();
        f.weather = Some(obs(Some(50.0), Some(9.0), Some(38.0), Some(18.0)));
        let drafts = evaluate(&builtin_rules(), &f);
        assert_eq!(
            titles(&drafts),
            vec![
                "Weather Advisory - Rain",
                "Weather Advisory - Heat",
                "Weather Advisory - Wind",
                "Weather Advisory - Cold",
            ]
        );
        assert_eq!(drafts[1].severity, AdvisorySeverity::High);
    }

    #[test]
    fn test_pest_rule_needs_crop_and_severity() {
        let mut f = facts();
        f.pest_reports = vec![report("rice", "rice blast", "high")];
        // Farmer does not grow rice
        assert!(evaluate(&builtin_rules(), &f).is_empty());

        f.crops = vec!["RICE".into()];
        let drafts = evaluate(&builtin_rules(), &f);
        assert_eq!(titles(&drafts), vec!["Pest Alert - Rice Blast"]);
        assert_eq!(drafts[0].text, "Rice Blast detected in Rice. Please take immediate action.");
        assert_eq!(drafts[0].tags, vec!["pest", "rice", "rice blast"]);

        f.pest_reports = vec![report("Rice", "Rice Blast", "medium")];
        assert!(evaluate(&builtin_rules(), &f).is_empty());
    }

    #[test]
    fn test_crop_stage_rule() {
        let mut f = facts();
        f.fields = vec![field("rice", "Maturity")];
        let drafts = evaluate(&builtin_rules(), &f);
        assert_eq!(titles(&drafts), vec!["Crop Stage Advisory - Rice"]);
        assert_eq!(drafts[0].source, AdvisorySource::CropCalendar);
        assert_eq!(drafts[0].field_id.as_deref(), Some("field-1"));

        f.fields = vec![field("rice", "tillering")];
        assert!(evaluate(&builtin_rules(), &f).is_empty());
    }

    #[test]
    fn test_custom_rule_priority_respected() {
        let rules = vec![
            weather_rule(50, "Late", "late", WeatherMetric::Rain24hMm, Threshold::Above(0.0), AdvisorySeverity::Low, "late"),
            weather_rule(1, "Early", "early", WeatherMetric::Rain24hMm, Threshold::Above(0.0), AdvisorySeverity::Low, "early"),
        ];
        let mut f = facts();
        f.weather = Some(obs(Some(1.0), None, None, None));
        assert_eq!(
            titles(&evaluate(&rules, &f)),
            vec!["Weather Advisory - Early", "Weather Advisory - Late"]
        );
    }

    mod generation {
        use super::*;
        use crate::storage::{NewFarmer, NewWeatherObs};
        use sea_orm::Database;
        use sea_orm_migration::MigratorTrait;
        use tempfile::NamedTempFile;

        async fn setup() -> (DatabaseConnection, NamedTempFile, entities::farmer::Model) {
            let temp_file = NamedTempFile::new().expect("Failed to create temp file");
            let db_url = format!("sqlite://{}?mode=rwc", temp_file.path().display());
            let db = Database::connect(&db_url).await.expect("Failed to connect");
            migration::Migrator::up(&db, None).await.expect("Failed to migrate");

            let (user, _) = storage::get_or_create_user_by_phone(&db, "+919444444444")
                .await
                .unwrap();
            let farmer = storage::create_farmer(
                &db,
                &user.id,
                NewFarmer {
                    name: "Lakshmi".into(),
                    district: "Thrissur".into(),
                    panchayat: None,
                    village: None,
                    lat: None,
                    lon: None,
                    soil_type: None,
                    irrigation_source: None,
                    primary_crops: vec!["Rice".into()],
                    language_pref: None,
                },
            )
            .await
            .unwrap();
            (db, temp_file, farmer)
        }

        fn llm() -> LlmProvider {
            crate::llm::build(&crate::settings::Llm::default()).unwrap()
        }

        #[tokio::test]
        async fn test_generate_dedupes_within_window() {
            let (db, _tmp, farmer) = setup().await;
            storage::insert_weather_obs(
                &db,
                NewWeatherObs {
                    district: "Thrissur".into(),
                    timestamp: None,
                    temp_c: None,
                    temp_min_c: None,
                    temp_max_c: None,
                    humidity: None,
                    wind_speed_ms: None,
                    rain_24h_mm: Some(40.0),
                    is_forecast: true,
                    source: None,
                },
            )
            .await
            .unwrap();
            let hub = ConnectionHub::new(30);
            let rules = builtin_rules();

            let first = generate_for_farmer(&db, &llm(), &hub, &rules, &farmer, None)
                .await
                .unwrap();
            assert_eq!(first.generated, 1);
            assert_eq!(first.advisories[0].title, "Weather Advisory - Rain");

            // Same facts again: duplicate skipped, and no LLM filler either
            let second = generate_for_farmer(&db, &llm(), &hub, &rules, &farmer, None)
                .await
                .unwrap();
            assert_eq!(second.generated, 0);
        }

        #[tokio::test]
        async fn test_generate_falls_back_to_llm() {
            let (db, _tmp, farmer) = setup().await;
            let hub = ConnectionHub::new(30);

            let resp = generate_for_farmer(&db, &llm(), &hub, &builtin_rules(), &farmer, None)
                .await
                .unwrap();
            assert_eq!(resp.generated, 1);
            let advisory = &resp.advisories[0];
            assert_eq!(advisory.source, "ai_model");
            assert_eq!(advisory.severity, "low");
            assert!(!advisory.text.is_empty());
        }

        #[tokio::test]
        async fn test_generate_rejects_foreign_field() {
            let (db, _tmp, farmer) = setup().await;
            let hub = ConnectionHub::new(30);
            let err = generate_for_farmer(&db, &llm(), &hub, &builtin_rules(), &farmer, Some("nope"))
                .await
                .unwrap_err();
            assert!(matches!(err, SakhiError::NotFound(_)));
        }
    }
}
