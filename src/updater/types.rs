//! Types for the update pipeline

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::version::{Version, VersionParseError};

/// A downloadable file attached to a release.
#[derive(Debug, Clone, Deserialize)]
pub struct Asset {
    pub name: String,
    pub browser_download_url: String,
}

/// One release as returned by the release-metadata endpoint.
///
/// Deserialization fails when a required field is missing, so malformed
/// metadata is rejected at the boundary instead of surfacing as a missing
/// property lookup deep in the pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseDescriptor {
    pub tag_name: String,
    pub name: String,
    pub published_at: String,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

/// Outcome of comparing the installed version against the latest release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    /// The installed version is newer than the published release.
    CurrentIsNewer,
    /// Versions match, or no installer asset was published.
    UpToDate,
    /// A newer release with an installer asset is available.
    UpdateAvailable,
}

/// Result of a single update check cycle.
///
/// Produced once per cycle and consumed by the fetch/verify/install stages;
/// never persisted.
#[derive(Debug, Clone)]
pub struct UpdateCheckResult {
    pub status: UpdateStatus,
    pub next_version: Option<Version>,
    pub published_at: Option<DateTime<Utc>>,
    pub download_url: Option<String>,
    pub file_name: Option<String>,
}

impl UpdateCheckResult {
    /// No update available (equal version, or the release carried no
    /// matching installer asset).
    pub fn up_to_date() -> Self {
        UpdateCheckResult {
            status: UpdateStatus::UpToDate,
            next_version: None,
            published_at: None,
            download_url: None,
            file_name: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == UpdateStatus::UpdateAvailable && self.download_url.is_some()
    }
}

/// One entry in the release history newer than the installed version.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseHistoryEntry {
    pub published_at: DateTime<Utc>,
    pub version: Version,
}

/// Errors from the update pipeline.
///
/// `Network` is transient (the next scheduled check retries); the rest are
/// fatal to the current cycle.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Version(#[from] VersionParseError),

    #[error("malformed release metadata: {0}")]
    Metadata(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("download failed for {url}: {reason}")]
    Download { url: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("integrity verification failed for {0}")]
    IntegrityMismatch(String),

    #[error("artifact {0} carries no embedded signature")]
    Unsigned(String),

    #[error("binary inspection failed: {0}")]
    Inspection(#[from] super::pe::PeError),

    #[error("service transition failed: {0}")]
    Service(#[from] crate::service::ServiceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_descriptor_rejects_missing_fields() {
        // No tag_name
        let json = r#"{"name": "1.1.0", "published_at": "2024-01-01T00:00:00Z"}"#;
        assert!(serde_json::from_str::<ReleaseDescriptor>(json).is_err());
    }

    #[test]
    fn release_descriptor_defaults_empty_assets() {
        let json = r#"{
            "tag_name": "1.1.0",
            "name": "1.1.0",
            "published_at": "2024-01-01T00:00:00Z"
        }"#;
        let release: ReleaseDescriptor = serde_json::from_str(json).unwrap();
        assert!(release.assets.is_empty());
    }

    #[test]
    fn up_to_date_result_is_not_available() {
        let result = UpdateCheckResult::up_to_date();
        assert!(!result.is_available());
        assert_eq!(result.status, UpdateStatus::UpToDate);
    }
}
