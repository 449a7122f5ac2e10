pub mod activity;
pub mod advisory;
pub mod audit_log;
pub mod consent;
pub mod farm;
pub mod farmer;
pub mod field;
pub mod job_execution;
pub mod kb_chunk;
pub mod kb_doc;
pub mod media;
pub mod notification;
pub mod otp_challenge;
pub mod otp_throttle;
pub mod pest_report;
pub mod price_point;
pub mod refresh_token;
pub mod reminder;
pub mod user;
pub mod weather_obs;

pub use activity::Entity as Activity;
pub use advisory::Entity as Advisory;
pub use audit_log::Entity as AuditLog;
pub use consent::Entity as Consent;
pub use farm::Entity as Farm;
pub use farmer::Entity as Farmer;
pub use field::Entity as Field;
pub use job_execution::Entity as JobExecution;
pub use kb_chunk::Entity as KbChunk;
pub use kb_doc::Entity as KbDoc;
pub use media::Entity as Media;
pub use notification::Entity as Notification;
pub use otp_challenge::Entity as OtpChallenge;
pub use otp_throttle::Entity as OtpThrottle;
pub use pest_report::Entity as PestReport;
pub use price_point::Entity as PricePoint;
pub use refresh_token::Entity as RefreshToken;
pub use reminder::Entity as Reminder;
pub use user::Entity as User;
pub use weather_obs::Entity as WeatherObs;
