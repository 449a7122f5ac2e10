//! Enumerated column domains.
//!
//! Values are stored as lowercase strings; every enum here round-trips through
//! `as_str` / `FromStr` and serializes with the same spelling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(
                        "invalid {} '{}'",
                        stringify!($name),
                        other
                    )),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum! {
    UserRole {
        Farmer => "farmer",
        Staff => "staff",
        Admin => "admin",
    }
}

string_enum! {
    ActivityKind {
        Sowing => "sowing",
        Irrigation => "irrigation",
        Fertilizer => "fertilizer",
        Pesticide => "pesticide",
        Harvest => "harvest",
        Plowing => "plowing",
        Weeding => "weeding",
        Pruning => "pruning",
        Other => "other",
    }
}

string_enum! {
    /// Ordered from least to most urgent
    AdvisorySeverity {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
}

string_enum! {
    AdvisorySource {
        RuleEngine => "rule_engine",
        Weather => "weather",
        PestAlert => "pest_alert",
        PriceAlert => "price_alert",
        CropCalendar => "crop_calendar",
        Expert => "expert",
        AiModel => "ai_model",
        Manual => "manual",
    }
}

string_enum! {
    NotificationStatus {
        Pending => "pending",
        Sent => "sent",
        Failed => "failed",
        Delivered => "delivered",
        Cancelled => "cancelled",
    }
}

string_enum! {
    NotificationChannel {
        Sms => "sms",
        Whatsapp => "whatsapp",
        Push => "push",
        Email => "email",
        InApp => "in_app",
    }
}

string_enum! {
    ConsentKind {
        DataProcessing => "data_processing",
        Marketing => "marketing",
        Analytics => "analytics",
        Location => "location",
        Notifications => "notifications",
        VoiceRecording => "voice_recording",
        DataSharing => "data_sharing",
    }
}

string_enum! {
    ReminderKind {
        FarmingActivity => "farming_activity",
        WeatherAlert => "weather_alert",
        PestAlert => "pest_alert",
        HarvestTime => "harvest_time",
        Irrigation => "irrigation",
        Fertilizer => "fertilizer",
        Pesticide => "pesticide",
        MarketVisit => "market_visit",
        Payment => "payment",
        Custom => "custom",
    }
}

string_enum! {
    AuditAction {
        Create => "create",
        Read => "read",
        Update => "update",
        Delete => "delete",
        Login => "login",
        Logout => "logout",
        ExportData => "export_data",
        DeleteData => "delete_data",
        ConsentGrant => "consent_grant",
        ConsentRevoke => "consent_revoke",
        FileUpload => "file_upload",
        SystemAction => "system_action",
    }
}

string_enum! {
    /// Severity vocabulary of field pest reports
    PestSeverity {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
}

impl AdvisorySeverity {
    pub fn is_urgent(&self) -> bool {
        matches!(self, AdvisorySeverity::High | AdvisorySeverity::Critical)
    }
}

impl NotificationStatus {
    /// Whether the delivery state machine allows moving from `self` to `next`.
    ///
    /// `failed -> pending` is the retry edge; the retry budget is checked by
    /// the caller since it lives on the row, not in the status.
    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Sent, Delivered)
                | (Sent, Failed)
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Delivered | NotificationStatus::Cancelled
        )
    }
}

impl UserRole {
    pub fn is_staff_or_admin(&self) -> bool {
        matches!(self, UserRole::Staff | UserRole::Admin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_vocabularies_match_schema() {
        for (name, values) in migration::ENUM_TYPES {
            let ours: Vec<&str> = match *name {
                "user_role" => UserRole::ALL.iter().map(|v| v.as_str()).collect(),
                "activity_kind" => ActivityKind::ALL.iter().map(|v| v.as_str()).collect(),
                "advisory_severity" => AdvisorySeverity::ALL.iter().map(|v| v.as_str()).collect(),
                "consent_kind" => ConsentKind::ALL.iter().map(|v| v.as_str()).collect(),
                "notification_status" => NotificationStatus::ALL
                    .iter()
                    .map(|v| v.as_str())
                    .filter(|v| *v != "cancelled")
                    .collect(),
                other => panic!("unexpected enum type {}", other),
            };
            assert_eq!(ours, values.to_vec(), "vocabulary mismatch for {}", name);
        }
    }

    #[test]
    fn test_from_str_rejects_unknown() {
        assert_eq!("staff".parse::<UserRole>(), Ok(UserRole::Staff));
        assert!("superuser".parse::<UserRole>().is_err());
        assert!("Sowing".parse::<ActivityKind>().is_err());
    }

    #[test]
    fn test_serde_uses_storage_spelling() {
        let json = serde_json::to_string(&ConsentKind::VoiceRecording).unwrap();
        assert_eq!(json, "\"voice_recording\"");
        let parsed: NotificationChannel = serde_json::from_str("\"in_app\"").unwrap();
        assert_eq!(parsed, NotificationChannel::InApp);
    }

    #[test]
    fn test_notification_transitions() {
        use NotificationStatus::*;
        assert!(Pending.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Failed.can_transition_to(Pending));
        assert!(!Delivered.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Delivered));
        assert!(Delivered.is_terminal());
        assert!(!Failed.is_terminal());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(AdvisorySeverity::Critical > AdvisorySeverity::Low);
        assert!(AdvisorySeverity::High.is_urgent());
        assert!(!AdvisorySeverity::Medium.is_urgent());
    }
}
