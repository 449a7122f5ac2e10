use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

fn cascade(
    name: &str,
    from: (impl IntoIden + 'static, impl IntoIden + 'static),
    to: (impl IntoIden + 'static, impl IntoIden + 'static),
) -> ForeignKeyCreateStatement {
    ForeignKey::create()
        .name(name)
        .from(from.0, from.1)
        .to(to.0, to.1)
        .on_delete(ForeignKeyAction::Cascade)
        .to_owned()
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Enable foreign keys for SQLite
        if manager.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        // Users authenticate by phone number only
        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(string(Users::Id).primary_key())
                    .col(string_uniq(Users::Phone))
                    .col(string(Users::Role).default("farmer"))
                    .col(string(Users::Locale).default("ml-IN"))
                    .col(boolean(Users::IsActive).default(true))
                    .col(boolean(Users::IsVerified).default(false))
                    .col(big_integer_null(Users::LastLoginAt))
                    .col(big_integer(Users::CreatedAt))
                    .col(big_integer(Users::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Farmers::Table)
                    .if_not_exists()
                    .col(string(Farmers::Id).primary_key())
                    .col(string_uniq(Farmers::UserId))
                    .col(string(Farmers::Name))
                    .col(string(Farmers::District))
                    .col(string_null(Farmers::Panchayat))
                    .col(string_null(Farmers::Village))
                    .col(double_null(Farmers::Lat))
                    .col(double_null(Farmers::Lon))
                    .col(string_null(Farmers::SoilType))
                    .col(string_null(Farmers::IrrigationSource))
                    .col(text(Farmers::PrimaryCrops).default("[]"))
                    .col(string(Farmers::LanguagePref).default("ml-IN"))
                    .col(big_integer(Farmers::CreatedAt))
                    .col(big_integer(Farmers::UpdatedAt))
                    .foreign_key(&mut cascade(
                        "fk_farmers_user",
                        (Farmers::Table, Farmers::UserId),
                        (Users::Table, Users::Id),
                    ))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_farmers_district")
                    .table(Farmers::Table)
                    .col(Farmers::District)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Farms::Table)
                    .if_not_exists()
                    .col(string(Farms::Id).primary_key())
                    .col(string(Farms::FarmerId))
                    .col(string(Farms::Name))
                    .col(double_null(Farms::AreaHa))
                    .col(double_null(Farms::Lat))
                    .col(double_null(Farms::Lon))
                    .col(big_integer(Farms::CreatedAt))
                    .col(big_integer(Farms::UpdatedAt))
                    .foreign_key(&mut cascade(
                        "fk_farms_farmer",
                        (Farms::Table, Farms::FarmerId),
                        (Farmers::Table, Farmers::Id),
                    ))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Fields::Table)
                    .if_not_exists()
                    .col(string(Fields::Id).primary_key())
                    .col(string(Fields::FarmId))
                    .col(string(Fields::Name))
                    .col(string_null(Fields::Crop))
                    .col(string_null(Fields::Variety))
                    .col(string_null(Fields::SowDate))
                    .col(string_null(Fields::Stage))
                    .col(double_null(Fields::AreaHa))
                    .col(big_integer(Fields::CreatedAt))
                    .col(big_integer(Fields::UpdatedAt))
                    .foreign_key(&mut cascade(
                        "fk_fields_farm",
                        (Fields::Table, Fields::FarmId),
                        (Farms::Table, Farms::Id),
                    ))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Media::Table)
                    .if_not_exists()
                    .col(string(Media::Id).primary_key())
                    .col(string(Media::OwnerUserId))
                    .col(string(Media::Kind))
                    .col(string(Media::FileName))
                    .col(string(Media::RelPath))
                    .col(string(Media::Mime))
                    .col(big_integer(Media::SizeBytes))
                    .col(big_integer(Media::CreatedAt))
                    .foreign_key(&mut cascade(
                        "fk_media_owner",
                        (Media::Table, Media::OwnerUserId),
                        (Users::Table, Users::Id),
                    ))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Activities::Table)
                    .if_not_exists()
                    .col(string(Activities::Id).primary_key())
                    .col(string(Activities::FarmerId))
                    .col(string_null(Activities::FieldId))
                    .col(big_integer(Activities::Timestamp))
                    .col(string(Activities::Kind))
                    .col(text_null(Activities::TextRaw))
                    .col(text_null(Activities::TextProcessed))
                    .col(string_null(Activities::AudioMediaId))
                    .col(text_null(Activities::DataJson))
                    .col(string(Activities::Language))
                    .col(string_null(Activities::Intent))
                    .col(integer_null(Activities::ConfidenceScore))
                    .col(boolean(Activities::IsVerified).default(false))
                    .col(big_integer(Activities::CreatedAt))
                    .foreign_key(&mut cascade(
                        "fk_activities_farmer",
                        (Activities::Table, Activities::FarmerId),
                        (Farmers::Table, Farmers::Id),
                    ))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_activities_farmer_ts")
                    .table(Activities::Table)
                    .col(Activities::FarmerId)
                    .col(Activities::Timestamp)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Advisories::Table)
                    .if_not_exists()
                    .col(string(Advisories::Id).primary_key())
                    .col(string(Advisories::FarmerId))
                    .col(string_null(Advisories::FieldId))
                    .col(big_integer(Advisories::Timestamp))
                    .col(string(Advisories::Title))
                    .col(text(Advisories::Text))
                    .col(string(Advisories::Severity).default("medium"))
                    .col(text(Advisories::Tags).default("[]"))
                    .col(string(Advisories::Source))
                    .col(text_null(Advisories::SourceData))
                    .col(string_null(Advisories::RuleName))
                    .col(boolean(Advisories::IsAcknowledged).default(false))
                    .col(big_integer_null(Advisories::AcknowledgedAt))
                    .col(boolean(Advisories::IsRead).default(false))
                    .col(big_integer_null(Advisories::ReadAt))
                    .col(boolean(Advisories::IsActive).default(true))
                    .col(big_integer_null(Advisories::ExpiresAt))
                    .col(big_integer(Advisories::CreatedAt))
                    .col(big_integer(Advisories::UpdatedAt))
                    .foreign_key(&mut cascade(
                        "fk_advisories_farmer",
                        (Advisories::Table, Advisories::FarmerId),
                        (Farmers::Table, Farmers::Id),
                    ))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_advisories_farmer_ts")
                    .table(Advisories::Table)
                    .col(Advisories::FarmerId)
                    .col(Advisories::Timestamp)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Reminders::Table)
                    .if_not_exists()
                    .col(string(Reminders::Id).primary_key())
                    .col(string(Reminders::FarmerId))
                    .col(string_null(Reminders::FieldId))
                    .col(string(Reminders::Kind))
                    .col(string(Reminders::Title))
                    .col(text(Reminders::Text))
                    .col(big_integer(Reminders::DueTs))
                    .col(big_integer_null(Reminders::RepeatEverySecs))
                    .col(boolean(Reminders::IsPaused).default(false))
                    .col(integer(Reminders::Priority).default(100))
                    .col(boolean(Reminders::IsActive).default(true))
                    .col(big_integer(Reminders::CreatedAt))
                    .col(big_integer(Reminders::UpdatedAt))
                    .foreign_key(&mut cascade(
                        "fk_reminders_farmer",
                        (Reminders::Table, Reminders::FarmerId),
                        (Farmers::Table, Farmers::Id),
                    ))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_reminders_due")
                    .table(Reminders::Table)
                    .col(Reminders::DueTs)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Notifications::Table)
                    .if_not_exists()
                    .col(string(Notifications::Id).primary_key())
                    .col(string(Notifications::FarmerId))
                    .col(string_null(Notifications::ReminderId))
                    .col(string(Notifications::Channel))
                    .col(string(Notifications::Recipient))
                    .col(string_null(Notifications::Title))
                    .col(text(Notifications::Message))
                    .col(string(Notifications::Status).default("pending"))
                    .col(big_integer(Notifications::ScheduledAt))
                    .col(big_integer_null(Notifications::SentAt))
                    .col(big_integer_null(Notifications::DeliveredAt))
                    .col(text_null(Notifications::ErrorMessage))
                    .col(integer(Notifications::RetryCount).default(0))
                    .col(integer(Notifications::MaxRetries).default(3))
                    .col(big_integer(Notifications::CreatedAt))
                    .col(big_integer(Notifications::UpdatedAt))
                    .foreign_key(&mut cascade(
                        "fk_notifications_farmer",
                        (Notifications::Table, Notifications::FarmerId),
                        (Farmers::Table, Farmers::Id),
                    ))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_notifications_status")
                    .table(Notifications::Table)
                    .col(Notifications::Status)
                    .col(Notifications::ScheduledAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Consents::Table)
                    .if_not_exists()
                    .col(string(Consents::Id).primary_key())
                    .col(string(Consents::UserId))
                    .col(string(Consents::Kind))
                    .col(boolean(Consents::Granted))
                    .col(text_null(Consents::Purpose))
                    .col(string(Consents::Version).default("1.0"))
                    .col(big_integer_null(Consents::GrantedAt))
                    .col(big_integer_null(Consents::RevokedAt))
                    .col(big_integer(Consents::CreatedAt))
                    .foreign_key(&mut cascade(
                        "fk_consents_user",
                        (Consents::Table, Consents::UserId),
                        (Users::Table, Users::Id),
                    ))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_consents_user_kind")
                    .table(Consents::Table)
                    .col(Consents::UserId)
                    .col(Consents::Kind)
                    .to_owned(),
            )
            .await?;

        // Audit logs outlive user erasure, so no foreign key on user_id
        manager
            .create_table(
                Table::create()
                    .table(AuditLogs::Table)
                    .if_not_exists()
                    .col(string(AuditLogs::Id).primary_key())
                    .col(string_null(AuditLogs::UserId))
                    .col(string(AuditLogs::Action))
                    .col(string_null(AuditLogs::TargetType))
                    .col(string_null(AuditLogs::TargetId))
                    .col(string_null(AuditLogs::IpAddress))
                    .col(boolean(AuditLogs::Success).default(true))
                    .col(text_null(AuditLogs::ErrorMessage))
                    .col(text_null(AuditLogs::Metadata))
                    .col(big_integer(AuditLogs::Timestamp))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_audit_logs_timestamp")
                    .table(AuditLogs::Table)
                    .col(AuditLogs::Timestamp)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(OtpChallenges::Table)
                    .if_not_exists()
                    .col(string(OtpChallenges::ReqId).primary_key())
                    .col(string(OtpChallenges::Phone))
                    .col(string(OtpChallenges::CodeHash))
                    .col(big_integer(OtpChallenges::CreatedAt))
                    .col(big_integer(OtpChallenges::ExpiresAt))
                    .col(boolean(OtpChallenges::Consumed).default(false))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(OtpThrottles::Table)
                    .if_not_exists()
                    .col(string(OtpThrottles::Phone).primary_key())
                    .col(integer(OtpThrottles::Attempts).default(0))
                    .col(big_integer_null(OtpThrottles::LockedUntil))
                    .col(big_integer(OtpThrottles::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(RefreshTokens::Table)
                    .if_not_exists()
                    .col(string(RefreshTokens::Jti).primary_key())
                    .col(string(RefreshTokens::UserId))
                    .col(big_integer(RefreshTokens::CreatedAt))
                    .col(big_integer(RefreshTokens::ExpiresAt))
                    .col(boolean(RefreshTokens::Revoked).default(false))
                    .col(string_null(RefreshTokens::ParentJti))
                    .foreign_key(&mut cascade(
                        "fk_refresh_tokens_user",
                        (RefreshTokens::Table, RefreshTokens::UserId),
                        (Users::Table, Users::Id),
                    ))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(WeatherObs::Table)
                    .if_not_exists()
                    .col(string(WeatherObs::Id).primary_key())
                    .col(string(WeatherObs::District))
                    .col(big_integer(WeatherObs::Timestamp))
                    .col(double_null(WeatherObs::TempC))
                    .col(double_null(WeatherObs::TempMinC))
                    .col(double_null(WeatherObs::TempMaxC))
                    .col(double_null(WeatherObs::Humidity))
                    .col(double_null(WeatherObs::WindSpeedMs))
                    .col(double_null(WeatherObs::Rain24hMm))
                    .col(boolean(WeatherObs::IsForecast).default(false))
                    .col(string(WeatherObs::Source))
                    .col(big_integer(WeatherObs::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_weather_obs_district_ts")
                    .table(WeatherObs::Table)
                    .col(WeatherObs::District)
                    .col(WeatherObs::Timestamp)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(PestReports::Table)
                    .if_not_exists()
                    .col(string(PestReports::Id).primary_key())
                    .col(string(PestReports::Crop))
                    .col(string(PestReports::PestName))
                    .col(string(PestReports::District))
                    .col(string(PestReports::Severity))
                    .col(double_null(PestReports::Lat))
                    .col(double_null(PestReports::Lon))
                    .col(big_integer(PestReports::Timestamp))
                    .col(text_null(PestReports::Symptoms))
                    .col(text_null(PestReports::ControlMeasures))
                    .col(string(PestReports::Source))
                    .col(big_integer(PestReports::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_pest_reports_district_ts")
                    .table(PestReports::Table)
                    .col(PestReports::District)
                    .col(PestReports::Timestamp)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(PricePoints::Table)
                    .if_not_exists()
                    .col(string(PricePoints::Id).primary_key())
                    .col(string(PricePoints::Market))
                    .col(string(PricePoints::Commodity))
                    .col(string_null(PricePoints::Variety))
                    .col(big_integer(PricePoints::Timestamp))
                    .col(double_null(PricePoints::MinPrice))
                    .col(double_null(PricePoints::MaxPrice))
                    .col(double_null(PricePoints::ModalPrice))
                    .col(string(PricePoints::Unit).default("kg"))
                    .col(string(PricePoints::Source))
                    .col(big_integer(PricePoints::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_price_points_commodity_ts")
                    .table(PricePoints::Table)
                    .col(PricePoints::Commodity)
                    .col(PricePoints::Timestamp)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(JobExecutions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(JobExecutions::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(string(JobExecutions::JobName))
                    .col(big_integer(JobExecutions::StartedAt))
                    .col(big_integer_null(JobExecutions::CompletedAt))
                    .col(big_integer_null(JobExecutions::Success))
                    .col(text_null(JobExecutions::ErrorMessage))
                    .col(big_integer_null(JobExecutions::RecordsProcessed))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_job_executions_started")
                    .table(JobExecutions::Table)
                    .col(JobExecutions::StartedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JobExecutions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(PricePoints::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(PestReports::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(WeatherObs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RefreshTokens::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(OtpThrottles::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(OtpChallenges::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AuditLogs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Consents::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Notifications::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Reminders::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Advisories::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Activities::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Media::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Fields::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Farms::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Farmers::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
    Phone,
    Role,
    Locale,
    IsActive,
    IsVerified,
    LastLoginAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Farmers {
    Table,
    Id,
    UserId,
    Name,
    District,
    Panchayat,
    Village,
    Lat,
    Lon,
    SoilType,
    IrrigationSource,
    PrimaryCrops,
    LanguagePref,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Farms {
    Table,
    Id,
    FarmerId,
    Name,
    AreaHa,
    Lat,
    Lon,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Fields {
    Table,
    Id,
    FarmId,
    Name,
    Crop,
    Variety,
    SowDate,
    Stage,
    AreaHa,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Media {
    Table,
    Id,
    OwnerUserId,
    Kind,
    FileName,
    RelPath,
    Mime,
    SizeBytes,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Activities {
    Table,
    Id,
    FarmerId,
    FieldId,
    Timestamp,
    Kind,
    TextRaw,
    TextProcessed,
    AudioMediaId,
    DataJson,
    Language,
    Intent,
    ConfidenceScore,
    IsVerified,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Advisories {
    Table,
    Id,
    FarmerId,
    FieldId,
    Timestamp,
    Title,
    Text,
    Severity,
    Tags,
    Source,
    SourceData,
    RuleName,
    IsAcknowledged,
    AcknowledgedAt,
    IsRead,
    ReadAt,
    IsActive,
    ExpiresAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Reminders {
    Table,
    Id,
    FarmerId,
    FieldId,
    Kind,
    Title,
    Text,
    DueTs,
    RepeatEverySecs,
    IsPaused,
    Priority,
    IsActive,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Notifications {
    Table,
    Id,
    FarmerId,
    ReminderId,
    Channel,
    Recipient,
    Title,
    Message,
    Status,
    ScheduledAt,
    SentAt,
    DeliveredAt,
    ErrorMessage,
    RetryCount,
    MaxRetries,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Consents {
    Table,
    Id,
    UserId,
    Kind,
    Granted,
    Purpose,
    Version,
    GrantedAt,
    RevokedAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum AuditLogs {
    Table,
    Id,
    UserId,
    Action,
    TargetType,
    TargetId,
    IpAddress,
    Success,
    ErrorMessage,
    Metadata,
    Timestamp,
}

#[derive(DeriveIden)]
enum OtpChallenges {
    Table,
    ReqId,
    Phone,
    CodeHash,
    CreatedAt,
    ExpiresAt,
    Consumed,
}

#[derive(DeriveIden)]
enum OtpThrottles {
    Table,
    Phone,
    Attempts,
    LockedUntil,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum RefreshTokens {
    Table,
    Jti,
    UserId,
    CreatedAt,
    ExpiresAt,
    Revoked,
    ParentJti,
}

#[derive(DeriveIden)]
enum WeatherObs {
    Table,
    Id,
    District,
    Timestamp,
    TempC,
    TempMinC,
    TempMaxC,
    Humidity,
    WindSpeedMs,
    #[sea_orm(iden = "rain_24h_mm")]
    Rain24hMm,
    IsForecast,
    Source,
    CreatedAt,
}

#[derive(DeriveIden)]
enum PestReports {
    Table,
    Id,
    Crop,
    PestName,
    District,
    Severity,
    Lat,
    Lon,
    Timestamp,
    Symptoms,
    ControlMeasures,
    Source,
    CreatedAt,
}

#[derive(DeriveIden)]
enum PricePoints {
    Table,
    Id,
    Market,
    Commodity,
    Variety,
    Timestamp,
    MinPrice,
    MaxPrice,
    ModalPrice,
    Unit,
    Source,
    CreatedAt,
}

#[derive(DeriveIden)]
enum JobExecutions {
    Table,
    Id,
    JobName,
    StartedAt,
    CompletedAt,
    Success,
    ErrorMessage,
    RecordsProcessed,
}
