//! Archival of settled market logs to S3.

use std::path::Path;

use anyhow::{bail, Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;

use crate::recorder::extract::EventInfo;

const DEFAULT_BASE_PATH: &str = "raw_greyhounds_data";

pub struct S3Storage {
    client: aws_sdk_s3::Client,
    bucket: String,
    base_path: String,
}

impl S3Storage {
    pub async fn new(bucket: impl Into<String>, base_path: impl Into<String>) -> Result<Self> {
        let bucket = bucket.into();
        if bucket.is_empty() {
            bail!("S3_BUCKET not configured");
        }

        let aws_config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        Ok(Self {
            client: aws_sdk_s3::Client::new(&aws_config),
            bucket,
            base_path: base_path.into(),
        })
    }

    /// Upload a local file under `key`.
    pub async fn upload(&self, path: &Path, key: &str) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("open file {}", path.display()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .with_context(|| format!("upload s3://{}/{}", self.bucket, key))?;

        Ok(())
    }

    /// Derive the object key for a settled market's archive.
    pub fn build_key(&self, event: &EventInfo, filename: &str) -> String {
        build_object_key(&self.base_path, event, filename)
    }
}

/// Object keys use forward slashes regardless of host OS:
/// `<base>/PRO/<year>/<month-abbrev>/<day>/<eventId>/<filename>`.
pub fn build_object_key(base_path: &str, event: &EventInfo, filename: &str) -> String {
    let base = if base_path.is_empty() {
        DEFAULT_BASE_PATH
    } else {
        base_path
    };
    format!(
        "{}/PRO/{}/{}/{}/{}/{}",
        base, event.year, event.month, event.day, event.event_id, filename
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(year: &str, month: &str, day: &str, event_id: &str) -> EventInfo {
        EventInfo {
            event_id: event_id.to_string(),
            year: year.to_string(),
            month: month.to_string(),
            day: day.to_string(),
        }
    }

    #[test]
    fn test_build_object_key() {
        let key = build_object_key("", &event("2025", "Sep", "26", "E"), "1.T.bz2");
        assert_eq!(key, "raw_greyhounds_data/PRO/2025/Sep/26/E/1.T.bz2");
    }

    #[test]
    fn test_build_object_key_custom_base() {
        let key = build_object_key("archive/v2", &event("2024", "Jan", "3", "34141864"), "1.2.bz2");
        assert_eq!(key, "archive/v2/PRO/2024/Jan/3/34141864/1.2.bz2");
    }
}
