//! One-time passcode login over SMS.
//!
//! Only the SHA-256 of a code is stored. Failed verifications are counted per
//! phone number; reaching the limit locks the number for `otp_lock_secs`.

use crate::entities;
use crate::errors::SakhiError;
use crate::settings::{Auth as AuthCfg, Server as ServerCfg};
use crate::storage;
use chrono::Utc;
use rand::Rng;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpStarted {
    pub req_id: String,
    pub message: String,
    pub expires_in: i64,
}

pub fn hash_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.trim().as_bytes()))
}

/// Byte-wise comparison that does not stop at the first difference
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn generate_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32))
}

fn locked_until(throttle: Option<&entities::otp_throttle::Model>, now: i64) -> Option<i64> {
    throttle
        .and_then(|t| t.locked_until)
        .filter(|until| *until > now)
}

/// Issue a challenge for `phone` (already normalized). Returns the response
/// body and the plaintext code for the SMS sender.
pub async fn start(
    db: &DatabaseConnection,
    auth: &AuthCfg,
    server: &ServerCfg,
    phone: &str,
) -> Result<(OtpStarted, String), SakhiError> {
    let now = Utc::now().timestamp();
    let throttle = storage::get_otp_throttle(db, phone).await?;
    if let Some(until) = locked_until(throttle.as_ref(), now) {
        return Err(SakhiError::TooManyRequests(format!(
            "too many attempts; try again in {} seconds",
            until - now
        )));
    }

    let code = if server.dev_mode {
        auth.otp_dev_code.clone()
    } else {
        generate_code()
    };
    let challenge =
        storage::create_otp_challenge(db, phone, &hash_code(&code), auth.otp_ttl_secs).await?;
    storage::set_otp_throttle(db, phone, 0, None).await?;

    if server.dev_mode {
        tracing::info!(phone = %phone, code = %code, "OTP issued (dev mode)");
    } else {
        tracing::info!(phone = %phone, "OTP issued");
    }

    Ok((
        OtpStarted {
            req_id: challenge.req_id,
            message: "OTP sent".into(),
            expires_in: auth.otp_ttl_secs,
        },
        code,
    ))
}

/// Check `code` against the challenge. On success the challenge is consumed
/// and the phone number it was issued to is returned.
pub async fn verify(
    db: &DatabaseConnection,
    auth: &AuthCfg,
    req_id: &str,
    code: &str,
) -> Result<String, SakhiError> {
    let now = Utc::now().timestamp();
    let challenge = storage::get_otp_challenge(db, req_id)
        .await?
        .ok_or_else(|| SakhiError::BadRequest("unknown req_id".into()))?;
    let phone = challenge.phone.clone();

    let throttle = storage::get_otp_throttle(db, &phone).await?;
    if locked_until(throttle.as_ref(), now).is_some() {
        return Err(SakhiError::TooManyRequests(
            "phone is temporarily locked".into(),
        ));
    }
    let attempts = throttle.as_ref().map(|t| t.attempts).unwrap_or(0);
    if attempts >= auth.otp_max_attempts {
        storage::set_otp_throttle(db, &phone, attempts, Some(now + auth.otp_lock_secs)).await?;
        tracing::warn!(phone = %phone, "OTP attempts exhausted, locking phone");
        return Err(SakhiError::TooManyRequests(
            "too many failed attempts; phone locked".into(),
        ));
    }

    if challenge.consumed || challenge.expires_at <= now {
        storage::set_otp_throttle(db, &phone, attempts + 1, None).await?;
        return Err(SakhiError::Unauthorized("OTP expired or already used".into()));
    }

    let expected = challenge.code_hash.as_bytes();
    let given = hash_code(code);
    if !constant_time_eq(expected, given.as_bytes()) {
        storage::set_otp_throttle(db, &phone, attempts + 1, None).await?;
        return Err(SakhiError::Unauthorized("invalid OTP".into()));
    }

    if !storage::consume_otp_challenge(db, req_id).await? {
        return Err(SakhiError::Unauthorized("OTP expired or already used".into()));
    }
    storage::set_otp_throttle(db, &phone, 0, None).await?;
    Ok(phone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::Database;
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

    fn dev_server() -> ServerCfg {
        ServerCfg {
            dev_mode: true,
            ..ServerCfg::default()
        }
    }

    const PHONE: &str = "+919876543210";

    #[test]
    fn test_hash_and_compare() {
        assert_eq!(hash_code("123456"), hash_code(" 123456 "));
        assert_ne!(hash_code("123456"), hash_code("123457"));
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert_eq!(generate_code().len(), 6);
    }

    #[tokio::test]
    async fn test_dev_code_round_trip() {
        let t = TestDb::new().await;
        let auth = AuthCfg::default();
        let (started, code) = start(&t.connection, &auth, &dev_server(), PHONE)
            .await
            .unwrap();
        assert_eq!(code, "000000");
        assert_eq!(started.expires_in, 300);

        let phone = verify(&t.connection, &auth, &started.req_id, "000000")
            .await
            .unwrap();
        assert_eq!(phone, PHONE);

        // Consumed challenges cannot be replayed
        let err = verify(&t.connection, &auth, &started.req_id, "000000")
            .await
            .unwrap_err();
        assert!(matches!(err, SakhiError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_unknown_request_is_bad_request() {
        let t = TestDb::new().await;
        let err = verify(&t.connection, &AuthCfg::default(), "nope", "000000")
            .await
            .unwrap_err();
        assert!(matches!(err, SakhiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_lockout_after_max_attempts() {
        let t = TestDb::new().await;
        let auth = AuthCfg::default();
        let (started, _) = start(&t.connection, &auth, &dev_server(), PHONE)
            .await
            .unwrap();

        for _ in 0..auth.otp_max_attempts {
            let err = verify(&t.connection, &auth, &started.req_id, "999999")
                .await
                .unwrap_err();
            assert!(matches!(err, SakhiError::Unauthorized(_)));
        }
        // Limit reached: locks, even with the right code
        let err = verify(&t.connection, &auth, &started.req_id, "000000")
            .await
            .unwrap_err();
        assert!(matches!(err, SakhiError::TooManyRequests(_)));

        // A fresh challenge is refused while locked
        let err = start(&t.connection, &auth, &dev_server(), PHONE)
            .await
            .unwrap_err();
        assert!(matches!(err, SakhiError::TooManyRequests(_)));
    }

    #[tokio::test]
    async fn test_expired_challenge_counts_as_attempt() {
        let t = TestDb::new().await;
        let auth = AuthCfg {
            otp_ttl_secs: -1,
            ..AuthCfg::default()
        };
        let (started, _) = start(&t.connection, &auth, &dev_server(), PHONE)
            .await
            .unwrap();
        let err = verify(&t.connection, &auth, &started.req_id, "000000")
            .await
            .unwrap_err();
        assert!(matches!(err, SakhiError::Unauthorized(_)));
        let throttle = storage::get_otp_throttle(&t.connection, PHONE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(throttle.attempts, 1);
    }
}
