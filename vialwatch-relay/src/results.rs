//! Access to files written by the analysis program

use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};
use vialwatch_common::{volume, Error, Result, RetryPolicy};

/// Resolve `filename` inside `dir`
///
/// Only plain file names are accepted; anything with a separator or a
/// parent component resolves to `None`.
pub fn resolve_output_file(dir: &Path, filename: &str) -> Option<PathBuf> {
    if filename.is_empty() || filename.contains('/') || filename.contains('\\') {
        return None;
    }
    let mut components = Path::new(filename).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(dir.join(filename)),
        _ => None,
    }
}

/// Wait for the volume result file to exist and be non-empty, then parse it
///
/// A file that never appears is `NotFound`. A file that exists but cannot be
/// parsed, or lacks the `vials` mapping, is `Malformed`.
pub async fn load_volume_result(path: &Path, policy: &RetryPolicy) -> Result<Value> {
    let ready = policy
        .poll("volume result", || async move {
            match tokio::fs::metadata(path).await {
                Ok(metadata) if metadata.len() > 0 => Some(()),
                _ => None,
            }
        })
        .await;

    if ready.is_none() && !tokio::fs::try_exists(path).await? {
        return Err(Error::NotFound(format!(
            "Volume data not found: {}",
            path.display()
        )));
    }

    let raw = tokio::fs::read_to_string(path).await?;
    debug!(path = %path.display(), bytes = raw.len(), "Read volume result");
    let doc = volume::parse_document(&raw)?;
    info!(path = %path.display(), "Volume result loaded");
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> RetryPolicy {
        RetryPolicy::fixed(5, 3)
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let dir = Path::new("/out/insseg");
        assert_eq!(
            resolve_output_file(dir, "output.jpg"),
            Some(PathBuf::from("/out/insseg/output.jpg"))
        );
        assert_eq!(resolve_output_file(dir, ".."), None);
        assert_eq!(resolve_output_file(dir, "."), None);
        assert_eq!(resolve_output_file(dir, "../secret"), None);
        assert_eq!(resolve_output_file(dir, "a\\b"), None);
        assert_eq!(resolve_output_file(dir, ""), None);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_volume_result(&dir.path().join("volume_data.json"), &quick())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_document_without_vials_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume_data.json");
        std::fs::write(&path, r#"{"is_image": true}"#).unwrap();
        let err = load_volume_result(&path, &quick()).await.unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[tokio::test]
    async fn test_empty_file_after_budget_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume_data.json");
        std::fs::write(&path, "").unwrap();
        let err = load_volume_result(&path, &quick()).await.unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[tokio::test]
    async fn test_waits_for_late_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume_data.json");
        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            tokio::fs::write(&writer_path, r#"{"is_image": false, "vials": {}}"#)
                .await
                .unwrap();
        });

        let doc = load_volume_result(&path, &RetryPolicy::fixed(20, 20)).await.unwrap();
        assert_eq!(doc["is_image"], false);
    }
}
