//! Uploaded media: validation, storage layout and temp file housekeeping.
//!
//! Layout under `media.root`: `uploads/` for farmer uploads, `tts/` for
//! synthesized audio and `tmp/` for scratch files.

use crate::entities;
use crate::errors::SakhiError;
use crate::settings::Settings;
use crate::storage;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub const UPLOADS_DIR: &str = "uploads";
pub const TTS_DIR: &str = "tts";
pub const TMP_DIR: &str = "tmp";

pub const TMP_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Image,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Image => "image",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub filename: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub id: String,
    pub kind: String,
    pub url: String,
    pub mime: String,
    pub size_bytes: i64,
}

/// Create the media subdirectories
pub async fn ensure_dirs(root: &Path) -> Result<(), SakhiError> {
    for dir in [UPLOADS_DIR, TTS_DIR, TMP_DIR] {
        tokio::fs::create_dir_all(root.join(dir)).await?;
    }
    Ok(())
}

/// Reject names that could escape the media root
pub fn validate_file_name(name: &str) -> Result<(), SakhiError> {
    if name.trim().is_empty() {
        return Err(SakhiError::BadRequest("filename is required".into()));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") || name.contains('\0') {
        return Err(SakhiError::BadRequest("invalid filename".into()));
    }
    Ok(())
}

fn extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Classify a file by extension against the configured formats
pub fn classify(settings: &Settings, name: &str) -> Result<(MediaKind, String), SakhiError> {
    let ext = extension(name)
        .ok_or_else(|| SakhiError::BadRequest("filename has no extension".into()))?;
    let has = |list: &[String]| list.iter().any(|f| f.eq_ignore_ascii_case(&ext));
    if has(&settings.media.audio_formats) {
        Ok((MediaKind::Audio, ext))
    } else if has(&settings.media.image_formats) {
        Ok((MediaKind::Image, ext))
    } else {
        Err(SakhiError::BadRequest(format!(
            "unsupported file type .{ext}"
        )))
    }
}

pub fn mime_for(ext: &str) -> &'static str {
    match ext {
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "ogg" => "audio/ogg",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Validate and store an upload, then record it
pub async fn save_upload(
    db: &DatabaseConnection,
    settings: &Settings,
    owner_user_id: &str,
    file_name: &str,
    bytes: &[u8],
) -> Result<entities::media::Model, SakhiError> {
    validate_file_name(file_name)?;
    let (kind, ext) = classify(settings, file_name)?;
    if bytes.is_empty() {
        return Err(SakhiError::BadRequest("empty upload".into()));
    }
    if bytes.len() as u64 > settings.max_upload_bytes() {
        return Err(SakhiError::PayloadTooLarge(format!(
            "file exceeds {} MB",
            settings.media.max_file_size_mb
        )));
    }

    let stored_name = format!("{}.{}", uuid::Uuid::new_v4(), ext);
    let rel_path = format!("{UPLOADS_DIR}/{stored_name}");
    let dir = settings.media.root.join(UPLOADS_DIR);
    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::write(dir.join(&stored_name), bytes).await?;

    let media = storage::create_media(
        db,
        owner_user_id,
        kind.as_str(),
        file_name,
        &rel_path,
        mime_for(&ext),
        bytes.len() as i64,
    )
    .await?;
    tracing::info!(media_id = %media.id, kind = kind.as_str(), size = bytes.len(), "Stored upload");
    Ok(media)
}

/// Absolute path of a stored media row, refusing anything outside the root
pub fn resolve(root: &Path, rel_path: &str) -> Result<PathBuf, SakhiError> {
    if rel_path.split('/').any(|part| part == ".." || part.is_empty()) {
        return Err(SakhiError::BadRequest("invalid media path".into()));
    }
    Ok(root.join(rel_path))
}

/// Bytes of a stored upload
pub async fn read(root: &Path, media: &entities::media::Model) -> Result<Vec<u8>, SakhiError> {
    let path = resolve(root, &media.rel_path)?;
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(media_id = %media.id, path = %path.display(), "Media row without file");
            Err(SakhiError::not_found("Media"))
        }
        Err(e) => Err(e.into()),
    }
}

/// Remove stored files, ignoring ones already gone. Returns how many were deleted.
pub async fn remove_files(root: &Path, rel_paths: &[String]) -> usize {
    let mut removed = 0;
    for rel in rel_paths {
        let Ok(path) = resolve(root, rel) else { continue };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove media file"),
        }
    }
    removed
}

/// Delete files in `tmp/` older than `max_age`
pub async fn purge_tmp(root: &Path, max_age: Duration) -> Result<u64, SakhiError> {
    let dir = root.join(TMP_DIR);
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age > max_age {
            tokio::fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings_in(dir: &TempDir) -> Settings {
        let mut s = Settings::default();
        s.media.root = dir.path().to_path_buf();
        s.media.max_file_size_mb = 1;
        s
    }

    #[test]
    fn test_file_name_validation() {
        assert!(validate_file_name("voice.wav").is_ok());
        assert!(validate_file_name("../etc/passwd").is_err());
        assert!(validate_file_name("a/b.wav").is_err());
        assert!(validate_file_name("a\\b.wav").is_err());
        assert!(validate_file_name("  ").is_err());
    }

    #[test]
    fn test_classify() {
        let s = Settings::default();
        assert_eq!(classify(&s, "note.M4A").unwrap(), (MediaKind::Audio, "m4a".into()));
        assert_eq!(classify(&s, "leaf.jpeg").unwrap(), (MediaKind::Image, "jpeg".into()));
        assert!(classify(&s, "script.exe").is_err());
        assert!(classify(&s, "noext").is_err());
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let root = Path::new("/srv/media");
        assert_eq!(
            resolve(root, "uploads/a.wav").unwrap(),
            PathBuf::from("/srv/media/uploads/a.wav")
        );
        assert!(resolve(root, "uploads/../../x").is_err());
        assert!(resolve(root, "/abs").is_err());
    }

    #[tokio::test]
    async fn test_ensure_dirs_and_purge_tmp() {
        let dir = TempDir::new().unwrap();
        ensure_dirs(dir.path()).await.unwrap();
        for sub in [UPLOADS_DIR, TTS_DIR, TMP_DIR] {
            assert!(dir.path().join(sub).is_dir());
        }
        std::fs::write(dir.path().join(TMP_DIR).join("scratch.wav"), b"x").unwrap();

        // Fresh file survives a day-long cutoff but not a zero one
        assert_eq!(purge_tmp(dir.path(), TMP_MAX_AGE).await.unwrap(), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(purge_tmp(dir.path(), Duration::ZERO).await.unwrap(), 1);
        assert!(!dir.path().join(TMP_DIR).join("scratch.wav").exists());
    }

    mod uploads {
        use super::*;
        use sea_orm::Database;
        use sea_orm_migration::MigratorTrait;
        use tempfile::NamedTempFile;

        #[tokio::test]
        async fn test_save_upload() {
            let temp_file = NamedTempFile::new().unwrap();
            let db = Database::connect(format!("sqlite://{}?mode=rwc", temp_file.path().display()))
                .await
                .unwrap();
            migration::Migrator::up(&db, None).await.unwrap();
            let user = storage::create_user(&db, "+919555555555", crate::types::UserRole::Farmer, "ml-IN")
                .await
                .unwrap();

            let dir = TempDir::new().unwrap();
            let settings = settings_in(&dir);

            let media = save_upload(&db, &settings, &user.id, "query.wav", b"RIFF....")
                .await
                .unwrap();
            assert_eq!(media.kind, "audio");
            assert_eq!(media.mime, "audio/wav");
            assert!(media.rel_path.starts_with("uploads/") && media.rel_path.ends_with(".wav"));
            assert!(dir.path().join(&media.rel_path).is_file());
            assert_eq!(read(dir.path(), &media).await.unwrap(), b"RIFF....");

            let big = vec![0u8; 1024 * 1024 + 1];
            let err = save_upload(&db, &settings, &user.id, "big.png", &big)
                .await
                .unwrap_err();
            assert!(matches!(err, SakhiError::PayloadTooLarge(_)));

            let err = save_upload(&db, &settings, &user.id, "../x.wav", b"x")
                .await
                .unwrap_err();
            assert!(matches!(err, SakhiError::BadRequest(_)));
        }
    }
}
