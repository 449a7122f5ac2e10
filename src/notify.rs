//! Outbound notification providers plus the reminder dispatch and delivery
//! passes run by the scheduler.

use crate::entities;
use crate::errors::SakhiError;
use crate::settings::Notify as NotifyCfg;
use crate::storage::{self, NewNotification};
use crate::types::{ConsentKind, NotificationChannel, NotificationStatus};
use crate::ws::{ConnectionHub, MessageType, RealtimeMessage};
use chrono::Utc;
use reqwest::Client;
use sea_orm::{DatabaseConnection, TransactionTrait};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("unknown notification provider: {0}")]
    UnknownProvider(String),
    #[error("webhook provider requires notify.webhook_url")]
    MissingWebhookUrl,
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Message handed to a provider
#[derive(Debug, Clone, Serialize)]
pub struct Outbound {
    pub channel: String,
    pub recipient: String,
    pub title: Option<String>,
    pub message: String,
}

impl From<&entities::notification::Model> for Outbound {
    fn from(n: &entities::notification::Model) -> Self {
        Self {
            channel: n.channel.clone(),
            recipient: n.recipient.clone(),
            title: n.title.clone(),
            message: n.message.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleNotifier;

impl ConsoleNotifier {
    fn send(&self, msg: &Outbound) -> Result<(), NotifyError> {
        tracing::info!(
            channel = %msg.channel,
            recipient = %msg.recipient,
            title = ?msg.title,
            message = %msg.message,
            "Notification (console)"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| NotifyError::Delivery(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, url })
    }

    async fn send(&self, msg: &Outbound) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(msg)
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError::Delivery(format!(
                "webhook returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum NotifyProvider {
    Console(ConsoleNotifier),
    Webhook(WebhookNotifier),
}

impl NotifyProvider {
    pub async fn send(&self, msg: &Outbound) -> Result<(), NotifyError> {
        match self {
            NotifyProvider::Console(p) => p.send(msg),
            NotifyProvider::Webhook(p) => p.send(msg).await,
        }
    }
}

pub fn build(cfg: &NotifyCfg) -> Result<NotifyProvider, NotifyError> {
    match cfg.provider.to_ascii_lowercase().as_str() {
        "console" => Ok(NotifyProvider::Console(ConsoleNotifier)),
        "webhook" => {
            let url = cfg.webhook_url.clone().ok_or(NotifyError::MissingWebhookUrl)?;
            Ok(NotifyProvider::Webhook(WebhookNotifier::new(url)?))
        }
        other => Err(NotifyError::UnknownProvider(other.to_string())),
    }
}

// ============================================================================
// Reminder dispatch
// ============================================================================

/// Notifications a due reminder should produce: in-app always, SMS only with
/// the `notifications` consent. Nothing for missing farmers or inactive users.
async fn notifications_for(
    db: &DatabaseConnection,
    cfg: &NotifyCfg,
    reminder: &entities::reminder::Model,
    now: i64,
) -> Result<Vec<NewNotification>, SakhiError> {
    let Some(farmer) = storage::get_farmer(db, &reminder.farmer_id).await? else {
        return Ok(Vec::new());
    };
    let Some(user) = storage::get_user(db, &farmer.user_id).await?.filter(|u| u.is_active)
    else {
        return Ok(Vec::new());
    };

    let mut channels = vec![NotificationChannel::InApp];
    if storage::has_consent(db, &user.id, ConsentKind::Notifications).await? {
        channels.push(NotificationChannel::Sms);
    }

    Ok(channels
        .into_iter()
        .map(|channel| NewNotification {
            farmer_id: farmer.id.clone(),
            reminder_id: Some(reminder.id.clone()),
            channel,
            recipient: match channel {
                NotificationChannel::InApp => farmer.id.clone(),
                _ => user.phone.clone(),
            },
            title: Some(reminder.title.clone()),
            message: if reminder.text.is_empty() {
                reminder.title.clone()
            } else {
                reminder.text.clone()
            },
            scheduled_at: now,
            max_retries: cfg.max_retries,
        })
        .collect())
}

/// Queue one reminder's notifications and advance it in a single transaction
async fn fire_reminder(
    db: &DatabaseConnection,
    cfg: &NotifyCfg,
    hub: &ConnectionHub,
    reminder: entities::reminder::Model,
    now: i64,
) -> Result<u64, SakhiError> {
    let outgoing = notifications_for(db, cfg, &reminder, now).await?;
    let queued = outgoing.len() as u64;
    let farmer_id = reminder.farmer_id.clone();
    let payload = json!(reminder);

    let txn = db.begin().await?;
    for notification in outgoing {
        storage::create_notification(&txn, notification).await?;
    }
    storage::advance_reminder(&txn, reminder, now).await?;
    txn.commit().await?;

    if queued > 0 {
        hub.send_to_farmer(&farmer_id, RealtimeMessage::new(MessageType::Reminder, payload));
    }
    Ok(queued)
}

/// Queue notifications for every due reminder and move the reminders on.
/// A reminder that fails is left due for the next pass. Returns the number
/// of notifications queued.
pub async fn dispatch_due_reminders(
    db: &DatabaseConnection,
    cfg: &NotifyCfg,
    hub: &ConnectionHub,
) -> Result<u64, SakhiError> {
    let now = Utc::now().timestamp();
    let mut queued = 0;
    for reminder in storage::due_reminders(db, now).await? {
        let reminder_id = reminder.id.clone();
        match fire_reminder(db, cfg, hub, reminder, now).await {
            Ok(n) => queued += n,
            Err(e) => {
                tracing::error!(reminder_id = %reminder_id, error = %e, "Failed to dispatch reminder");
            }
        }
    }
    Ok(queued)
}

// ============================================================================
// Delivery
// ============================================================================

const DELIVERY_BATCH: u64 = 200;

async fn deliver_one(
    db: &DatabaseConnection,
    provider: &NotifyProvider,
    hub: &ConnectionHub,
    n: &entities::notification::Model,
) -> Result<NotificationStatus, SakhiError> {
    if n.channel == NotificationChannel::InApp.as_str() {
        storage::transition_notification(db, &n.id, NotificationStatus::Sent, None).await?;
        let live = hub.send_to_farmer(
            &n.farmer_id,
            RealtimeMessage::new(MessageType::Notification, json!(n)),
        );
        if live {
            storage::transition_notification(db, &n.id, NotificationStatus::Delivered, None)
                .await?;
            return Ok(NotificationStatus::Delivered);
        }
        // Stays sent until the app acknowledges it
        return Ok(NotificationStatus::Sent);
    }

    match provider.send(&Outbound::from(n)).await {
        Ok(()) => {
            storage::transition_notification(db, &n.id, NotificationStatus::Sent, None).await?;
            Ok(NotificationStatus::Sent)
        }
        Err(e) => {
            tracing::warn!(notification_id = %n.id, error = %e, "Notification delivery failed");
            storage::transition_notification(
                db,
                &n.id,
                NotificationStatus::Failed,
                Some(e.to_string()),
            )
            .await?;
            Ok(NotificationStatus::Failed)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub retried: u64,
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
}

impl DeliveryReport {
    pub fn processed(&self) -> u64 {
        self.sent + self.delivered + self.failed
    }
}

/// Requeue failed notifications whose retry delay has passed, then hand
/// every due pending notification to its channel
pub async fn deliver_notifications(
    db: &DatabaseConnection,
    cfg: &NotifyCfg,
    provider: &NotifyProvider,
    hub: &ConnectionHub,
) -> Result<DeliveryReport, SakhiError> {
    let now = Utc::now().timestamp();
    let mut report = DeliveryReport::default();

    for n in storage::retryable_notifications(db, now, cfg.retry_delay_secs).await? {
        storage::transition_notification(db, &n.id, NotificationStatus::Pending, None).await?;
        report.retried += 1;
    }

    for n in storage::due_notifications(db, now, DELIVERY_BATCH).await? {
        match deliver_one(db, provider, hub, &n).await {
            Ok(NotificationStatus::Delivered) => report.delivered += 1,
            Ok(NotificationStatus::Failed) => report.failed += 1,
            Ok(_) => report.sent += 1,
            Err(e) => {
                tracing::error!(notification_id = %n.id, error = %e, "Failed to process notification")
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{NewFarmer, NewReminder};
    use crate::types::ReminderKind;
    use sea_orm::{ConnectionTrait, Database};
    use sea_orm_migration::MigratorTrait;
    use tempfile::NamedTempFile;

    struct TestDb {
        connection: DatabaseConnection,
        _temp_file: NamedTempFile,
    }

    impl TestDb {
        async fn new() -> Self {
            let temp_file = NamedTempFile::new().expect("Failed to create temp file");
            let db_url = format!("sqlite://{}?mode=rwc", temp_file.path().display());
            let connection = Database::connect(&db_url)
                .await
                .expect("Failed to connect to test database");
            migration::Migrator::up(&connection, None)
                .await
                .expect("Failed to run migrations");
            Self {
                connection,
                _temp_file: temp_file,
            }
        }
    }

    async fn farmer_with_reminder(
        db: &DatabaseConnection,
        sms_consent: bool,
    ) -> (entities::farmer::Model, entities::reminder::Model) {
        let (user, _) = storage::get_or_create_user_by_phone(db, "+919333333333")
            .await
            .unwrap();
        let farmer = storage::create_farmer(
            db,
            &user.id,
            NewFarmer {
                name: "Anil".into(),
                district: "Kottayam".into(),
                panchayat: None,
                village: None,
                lat: None,
                lon: None,
                soil_type: None,
                irrigation_source: None,
                primary_crops: vec![],
                language_pref: None,
            },
        )
        .await
        .unwrap();
        if sms_consent {
            storage::record_consent(db, &user.id, ConsentKind::Notifications, true, None)
                .await
                .unwrap();
        }
        let reminder = storage::create_reminder(
            db,
            &farmer.id,
            NewReminder {
                field_id: None,
                kind: ReminderKind::Irrigation,
                title: "Irrigate".into(),
                text: "Irrigate the banana plot".into(),
                due_ts: Utc::now().timestamp() - 5,
                repeat_every_secs: None,
                priority: None,
            },
        )
        .await
        .unwrap();
        (farmer, reminder)
    }

    #[test]
    fn test_build_providers() {
        assert!(matches!(
            build(&NotifyCfg::default()),
            Ok(NotifyProvider::Console(_))
        ));
        let webhook = NotifyCfg {
            provider: "webhook".into(),
            ..NotifyCfg::default()
        };
        assert!(matches!(build(&webhook), Err(NotifyError::MissingWebhookUrl)));
    }

    #[tokio::test]
    async fn test_dispatch_respects_sms_consent() {
        let t = TestDb::new().await;
        let db = &t.connection;
        let hub = ConnectionHub::new(30);
        let cfg = NotifyCfg::default();

        let (farmer, reminder) = farmer_with_reminder(db, true).await;
        assert_eq!(dispatch_due_reminders(db, &cfg, &hub).await.unwrap(), 2);

        let (items, _) = storage::list_notifications(db, &farmer.id, None, storage::Page::default())
            .await
            .unwrap();
        let mut channels: Vec<_> = items.iter().map(|n| n.channel.as_str()).collect();
        channels.sort();
        assert_eq!(channels, vec!["in_app", "sms"]);

        // One-shot reminder is done
        let reminder = storage::get_reminder(db, &reminder.id).await.unwrap().unwrap();
        assert!(!reminder.is_active);
        assert_eq!(dispatch_due_reminders(db, &cfg, &hub).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_dispatch_leaves_reminder_due() {
        let t = TestDb::new().await;
        let db = &t.connection;
        let hub = ConnectionHub::new(30);
        let cfg = NotifyCfg::default();

        let (_, reminder) = farmer_with_reminder(db, true).await;
        // Inserts into notifications now fail
        db.execute_unprepared("DROP TABLE notifications").await.unwrap();

        assert_eq!(dispatch_due_reminders(db, &cfg, &hub).await.unwrap(), 0);
        let after = storage::get_reminder(db, &reminder.id).await.unwrap().unwrap();
        assert!(after.is_active);
        assert_eq!(after.due_ts, reminder.due_ts);
    }

    #[tokio::test]
    async fn test_delivery_pass() {
        let t = TestDb::new().await;
        let db = &t.connection;
        let hub = ConnectionHub::new(30);
        let cfg = NotifyCfg::default();
        let provider = build(&cfg).unwrap();

        let (farmer, _) = farmer_with_reminder(db, true).await;
        dispatch_due_reminders(db, &cfg, &hub).await.unwrap();

        // No live socket: in_app stays sent, sms goes out via the console
        let report = deliver_notifications(db, &cfg, &provider, &hub).await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(report.processed(), 2);

        let (sent, _) = storage::list_notifications(
            db,
            &farmer.id,
            Some(NotificationStatus::Sent),
            storage::Page::default(),
        )
        .await
        .unwrap();
        assert_eq!(sent.len(), 2);

        // Nothing left to do
        let again = deliver_notifications(db, &cfg, &provider, &hub).await.unwrap();
        assert_eq!(again, DeliveryReport::default());
    }

    #[tokio::test]
    async fn test_failed_webhook_is_retried() {
        let t = TestDb::new().await;
        let db = &t.connection;
        let hub = ConnectionHub::new(30);
        let cfg = NotifyCfg {
            provider: "webhook".into(),
            webhook_url: Some("http://127.0.0.1:9/hook".into()),
            retry_delay_secs: 0,
            ..NotifyCfg::default()
        };
        let provider = build(&cfg).unwrap();

        let (farmer, _) = farmer_with_reminder(db, true).await;
        dispatch_due_reminders(db, &cfg, &hub).await.unwrap();

        let report = deliver_notifications(db, &cfg, &provider, &hub).await.unwrap();
        assert_eq!(report.failed, 1, "sms through the dead webhook fails");
        assert_eq!(report.sent, 1, "in_app does not use the webhook");

        let report = deliver_notifications(db, &cfg, &provider, &hub).await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.failed, 1);

        let (failed, _) = storage::list_notifications(
            db,
            &farmer.id,
            Some(NotificationStatus::Failed),
            storage::Page::default(),
        )
        .await
        .unwrap();
        assert_eq!(failed[0].retry_count, 1);
        assert!(failed[0].error_message.is_some());
    }
}
