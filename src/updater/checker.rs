//! Update checker - fetches release metadata and compares versions

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use super::types::{
    Asset, ReleaseDescriptor, ReleaseHistoryEntry, UpdateCheckResult, UpdateError, UpdateStatus,
};
use crate::config::UpdaterConfig;
use crate::version::Version;
use crate::with_retry;

const UPDATE_HTTP_USER_AGENT: &str = "VeilTunnel-Updater";

/// Update checker that queries the release-metadata endpoint.
pub struct UpdateChecker {
    client: reqwest::Client,
    current_version: Version,
    update_check_url: String,
    releases_url: String,
    installer_prefix: String,
}

impl UpdateChecker {
    pub fn new(current_version: Version, config: &UpdaterConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(UPDATE_HTTP_USER_AGENT)
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("Failed to create HTTP client"),
            current_version,
            update_check_url: config.update_check_url.clone(),
            releases_url: config.releases_url.clone(),
            installer_prefix: config.installer_prefix.clone(),
        }
    }

    pub fn current_version(&self) -> &Version {
        &self.current_version
    }

    /// Check whether a newer release is published.
    ///
    /// Uses retry logic with exponential backoff (3 attempts: 1s, 2s, 4s
    /// delays) for the metadata fetch. A release whose tag does not parse as
    /// a version is a hard error - without version identity the update
    /// cannot proceed. A release without a matching installer asset is not:
    /// it is logged and reported as no-update-available.
    pub async fn check_for_update(&self) -> Result<UpdateCheckResult, UpdateError> {
        debug!(
            "checking for update. current version detected as {}",
            self.current_version
        );
        debug!("issuing http get to url: {}", self.update_check_url);

        let url = self.update_check_url.clone();
        let release = with_retry(3, || async {
            let response = self
                .client
                .get(&url)
                .header("Accept", "application/vnd.github.v3+json")
                .send()
                .await?
                .error_for_status()?;

            response.json::<ReleaseDescriptor>().await
        })
        .await?;

        self.process_release(&release)
    }

    /// Pure part of the check, split out so metadata handling is testable
    /// without a server.
    pub fn process_release(
        &self,
        release: &ReleaseDescriptor,
    ) -> Result<UpdateCheckResult, UpdateError> {
        let asset = match select_installer_asset(&release.assets, &self.installer_prefix) {
            Some(asset) => asset,
            None => {
                error!(
                    "no installer asset matching '{}*' found at: {}",
                    self.installer_prefix, self.update_check_url
                );
                return Ok(UpdateCheckResult::up_to_date());
            }
        };
        debug!("download url detected: {}", asset.browser_download_url);

        let file_name = asset
            .browser_download_url
            .rsplit('/')
            .next()
            .unwrap_or(&asset.name)
            .to_string();
        debug!("download file name: {}", file_name);

        let next_version = parse_tag_version(&release.tag_name)?;
        let published_at = parse_published_at(&release.published_at)?;

        let status = if self.current_version < next_version {
            info!(
                "upgrade {} is available. published version: {} is newer than the current version: {}",
                release.name, next_version, self.current_version
            );
            UpdateStatus::UpdateAvailable
        } else if self.current_version > next_version {
            info!(
                "the version installed: {} is newer than the released version: {}",
                self.current_version, next_version
            );
            UpdateStatus::CurrentIsNewer
        } else {
            info!("already on latest version {}", self.current_version);
            UpdateStatus::UpToDate
        };

        Ok(UpdateCheckResult {
            status,
            next_version: Some(next_version),
            published_at: Some(published_at),
            download_url: Some(asset.browser_download_url.clone()),
            file_name: Some(file_name),
        })
    }

    /// All releases published after the installed version, newest first.
    ///
    /// The release list is assumed newest-first; iteration stops at the
    /// first release at or below the current version, so the result is the
    /// contiguous run of strictly newer releases.
    pub async fn releases_since(&self) -> Result<Vec<ReleaseHistoryEntry>, UpdateError> {
        debug!("fetching the releases info from {}", self.releases_url);

        let url = self.releases_url.clone();
        let releases = with_retry(3, || async {
            let response = self
                .client
                .get(&url)
                .header("Accept", "application/vnd.github.v3+json")
                .send()
                .await?
                .error_for_status()?;

            response.json::<Vec<ReleaseDescriptor>>().await
        })
        .await?;

        Ok(releases_newer_than(&releases, &self.current_version))
    }
}

/// Select the first asset whose name starts with the installer prefix.
/// Remaining assets are ignored once a match is found.
pub fn select_installer_asset<'a>(assets: &'a [Asset], prefix: &str) -> Option<&'a Asset> {
    for asset in assets {
        if asset.name.starts_with(prefix) {
            return Some(asset);
        }
        debug!("skipping asset with name: {}", asset.name);
    }
    None
}

/// Parse a release tag as a version, tolerating a leading `v`.
pub fn parse_tag_version(tag: &str) -> Result<Version, UpdateError> {
    let trimmed = tag.trim_start_matches('v');
    Version::parse(trimmed).map_err(|e| {
        error!("could not parse version from tag '{}'", tag);
        UpdateError::from(e)
    })
}

fn parse_published_at(text: &str) -> Result<DateTime<Utc>, UpdateError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| UpdateError::Metadata(format!("bad published_at '{}': {}", text, e)))
}

/// Walk a newest-first release list, collecting the contiguous run of
/// releases strictly newer than `current`.
///
/// The version is taken from the release name, falling back to the tag; a
/// release where both fail to parse is skipped and the walk continues.
pub fn releases_newer_than(
    releases: &[ReleaseDescriptor],
    current: &Version,
) -> Vec<ReleaseHistoryEntry> {
    let mut newer = Vec::new();

    for release in releases {
        let version = match Version::parse(&release.name) {
            Ok(v) => v,
            Err(name_err) => match parse_tag_version(&release.tag_name) {
                Ok(v) => v,
                Err(tag_err) => {
                    error!(
                        "could not fetch version from name due to {} and tag_name due to {}",
                        name_err, tag_err
                    );
                    continue;
                }
            },
        };

        if version <= *current {
            break;
        }

        let published_at = match parse_published_at(&release.published_at) {
            Ok(dt) => dt,
            Err(e) => {
                warn!(
                    "skipping release {} with unparseable publish date: {}",
                    release.tag_name, e
                );
                continue;
            }
        };

        newer.push(ReleaseHistoryEntry {
            published_at,
            version,
        });
    }

    newer
}
