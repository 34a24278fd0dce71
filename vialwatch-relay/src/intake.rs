//! Upload intake
//!
//! Reads the multipart upload form, validates the image against the MIME
//! allow-list and size cap, and persists it under a collision-resistant
//! generated name. Rejected uploads leave nothing on disk: the file is only
//! written after every check has passed.

use axum::extract::multipart::{Field, Multipart, MultipartError};
use axum::http::StatusCode;
use rand::Rng;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use vialwatch_common::config::UploadConfig;
use vialwatch_common::AnalysisParameters;

use crate::error::{ApiError, ApiResult};

/// Form field carrying the image
pub const FILE_FIELD: &str = "file";

/// Allow-list and size cap for uploaded images
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_bytes: u64,
    pub allowed_mime_types: Vec<String>,
}

impl UploadPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_bytes: config.max_bytes,
            allowed_mime_types: config.allowed_mime_types.clone(),
        }
    }

    pub fn check_mime(&self, mime: Option<&str>) -> ApiResult<()> {
        match mime {
            Some(m) if self.allowed_mime_types.iter().any(|a| a.eq_ignore_ascii_case(m)) => Ok(()),
            other => Err(ApiError::BadRequest(format!(
                "Unsupported file type: {} (allowed: {})",
                other.unwrap_or("unknown"),
                self.allowed_mime_types.join(", ")
            ))),
        }
    }

    pub fn check_size(&self, size: u64) -> ApiResult<()> {
        if size > self.max_bytes {
            return Err(self.too_large());
        }
        Ok(())
    }

    fn too_large(&self) -> ApiError {
        ApiError::BadRequest(format!(
            "File is too large (max {})",
            format_limit(self.max_bytes)
        ))
    }
}

fn format_limit(bytes: u64) -> String {
    if bytes % (1024 * 1024) == 0 {
        format!("{}MB", bytes / (1024 * 1024))
    } else {
        format!("{} bytes", bytes)
    }
}

/// An accepted image on disk
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub path: PathBuf,
    pub original_name: String,
    pub stored_name: String,
    pub mime: String,
    pub size: u64,
}

/// Parsed upload request
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file: UploadedFile,
    pub parameters: AnalysisParameters,
}

/// Generated storage name: `<millis>-<random>.<original extension>`
pub fn generate_upload_name(original_name: &str, mime: &str) -> String {
    let extension = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_else(|| match mime {
            "image/png" => ".png".to_string(),
            "image/jpeg" | "image/jpg" => ".jpg".to_string(),
            _ => String::new(),
        });

    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000_000);
    format!(
        "{}-{}{}",
        chrono::Utc::now().timestamp_millis(),
        suffix,
        extension
    )
}

/// Write `data` to a fresh file in `upload_dir`, never overwriting
pub async fn persist(
    upload_dir: &Path,
    original_name: &str,
    mime: &str,
    data: &[u8],
) -> ApiResult<UploadedFile> {
    tokio::fs::create_dir_all(upload_dir).await?;

    for _ in 0..5 {
        let stored_name = generate_upload_name(original_name, mime);
        let path = upload_dir.join(&stored_name);

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "Generated upload name collided, retrying");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(data).await?;
        file.flush().await?;

        info!(
            path = %path.display(),
            original = original_name,
            size = data.len(),
            "Upload persisted"
        );
        return Ok(UploadedFile {
            path,
            original_name: original_name.to_string(),
            stored_name,
            mime: mime.to_string(),
            size: data.len() as u64,
        });
    }

    Err(ApiError::Internal(
        "could not generate a unique upload name".to_string(),
    ))
}

fn multipart_error(policy: &UploadPolicy, err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        policy.too_large()
    } else {
        ApiError::BadRequest(format!("Failed to read multipart field: {}", err.body_text()))
    }
}

async fn read_capped(policy: &UploadPolicy, mut field: Field<'_>) -> ApiResult<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| multipart_error(policy, e))?
    {
        policy.check_size((data.len() + chunk.len()) as u64)?;
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str, default: T) -> ApiResult<T> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(default);
    }
    trimmed
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("{} must be a number (got '{}')", name, trimmed)))
}

/// Read the upload form, validate it, and persist the image
pub async fn read_upload(
    mut multipart: Multipart,
    policy: &UploadPolicy,
    defaults: AnalysisParameters,
    upload_dir: &Path,
) -> ApiResult<UploadRequest> {
    let mut image: Option<(String, String, Vec<u8>)> = None;
    let mut parameters = defaults;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(policy, e))?
    {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            FILE_FIELD => {
                if image.is_some() {
                    return Err(ApiError::BadRequest(
                        "Only one file may be uploaded".to_string(),
                    ));
                }
                let original_name = field.file_name().unwrap_or("upload").to_string();
                let mime = field.content_type().map(str::to_string);
                policy.check_mime(mime.as_deref())?;
                let data = read_capped(policy, field).await?;
                image = Some((original_name, mime.unwrap_or_default(), data));
            }
            "nmsIou" => {
                let text = field.text().await.map_err(|e| multipart_error(policy, e))?;
                parameters.nms_iou = parse_number("nmsIou", &text, defaults.nms_iou)?;
            }
            "confidence" => {
                let text = field.text().await.map_err(|e| multipart_error(policy, e))?;
                parameters.confidence = parse_number("confidence", &text, defaults.confidence)?;
            }
            "batchSize" => {
                let text = field.text().await.map_err(|e| multipart_error(policy, e))?;
                parameters.batch_size = parse_number("batchSize", &text, defaults.batch_size)?;
            }
            other => {
                debug!(field = other, "Ignoring unknown multipart field");
            }
        }
    }

    let Some((original_name, mime, data)) = image else {
        return Err(ApiError::BadRequest("No file was uploaded".to_string()));
    };
    parameters.validate()?;

    let file = persist(upload_dir, &original_name, &mime, &data).await?;
    Ok(UploadRequest { file, parameters })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> UploadPolicy {
        UploadPolicy::from_config(&UploadConfig::default())
    }

    #[test]
    fn test_mime_allow_list() {
        let policy = policy();
        assert!(policy.check_mime(Some("image/jpeg")).is_ok());
        assert!(policy.check_mime(Some("image/png")).is_ok());
        assert!(policy.check_mime(Some("image/jpg")).is_ok());
        assert!(policy.check_mime(Some("IMAGE/PNG")).is_ok());
        assert!(policy.check_mime(Some("image/gif")).is_err());
        assert!(policy.check_mime(Some("application/pdf")).is_err());
        assert!(policy.check_mime(None).is_err());
    }

    #[test]
    fn test_size_cap_message_names_limit() {
        let policy = policy();
        assert!(policy.check_size(10 * 1024 * 1024).is_ok());
        let err = policy.check_size(10 * 1024 * 1024 + 1).unwrap_err();
        assert!(err.to_string().contains("10MB"));
    }

    #[test]
    fn test_generated_name_keeps_extension() {
        let name = generate_upload_name("vials.JPG", "image/jpeg");
        assert!(name.ends_with(".JPG"));
        let (millis, rest) = name.split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert!(rest.trim_end_matches(".JPG").parse::<u32>().is_ok());
    }

    #[test]
    fn test_generated_name_falls_back_to_mime() {
        assert!(generate_upload_name("blob", "image/png").ends_with(".png"));
    }

    #[tokio::test]
    async fn test_rapid_persists_never_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let first = persist(dir.path(), "a.png", "image/png", b"first").await.unwrap();
        let second = persist(dir.path(), "a.png", "image/png", b"second").await.unwrap();

        assert_ne!(first.stored_name, second.stored_name);
        assert_eq!(tokio::fs::read(&first.path).await.unwrap(), b"first");
        assert_eq!(tokio::fs::read(&second.path).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_persist_creates_directory_tree() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("backend").join("uploads");
        let stored = persist(&nested, "x.jpg", "image/jpeg", b"jpeg").await.unwrap();
        assert!(stored.path.starts_with(&nested));
        assert_eq!(stored.size, 4);
    }
}
