//! Secure update pipeline for the VeilTunnel client
//!
//! Check for a newer release, stage and verify the installer, transition
//! the managed service across the install. One cycle runs to completion
//! before returning; the caller is responsible for not driving two cycles
//! at once (staged file names are fixed and the supervisor is not
//! reentrant).

pub mod checker;
pub mod downloader;
pub mod pe;
pub mod types;
pub mod verifier;

use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::config::UpdaterConfig;
use crate::service::{HostEnvironment, ServiceControl, ServiceState, ServiceSupervisor};
use crate::version::Version;

pub use checker::UpdateChecker;
pub use types::{
    Asset, ReleaseDescriptor, ReleaseHistoryEntry, UpdateCheckResult, UpdateError, UpdateStatus,
};

/// Result of one full update cycle.
#[derive(Debug)]
pub enum CycleOutcome {
    /// No newer release, or the release carried no installer asset.
    NoUpdate,
    /// The installer ran; the service was restarted and its final state
    /// observed (may be non-Running if the start wait elapsed).
    Installed {
        version: Version,
        service_state: ServiceState,
    },
}

/// Run one update cycle end to end: check, stage, verify, stop the old
/// service, hand the artifact to the installer, restart.
///
/// The installer callback is the external collaborator that actually
/// executes the staged artifact; what it does internally is out of scope
/// here.
pub async fn run_update_cycle<C, H, F>(
    checker: &UpdateChecker,
    config: &UpdaterConfig,
    supervisor: &mut ServiceSupervisor<C, H>,
    install: F,
) -> Result<CycleOutcome, UpdateError>
where
    C: ServiceControl,
    H: HostEnvironment,
    F: FnOnce(&Path) -> Result<(), UpdateError>,
{
    let check = checker.check_for_update().await?;
    apply_update(&check, config, supervisor, install).await
}

/// The post-check portion of the cycle, split out so callers that already
/// hold a check result (or tests) can drive it directly.
pub async fn apply_update<C, H, F>(
    check: &UpdateCheckResult,
    config: &UpdaterConfig,
    supervisor: &mut ServiceSupervisor<C, H>,
    install: F,
) -> Result<CycleOutcome, UpdateError>
where
    C: ServiceControl,
    H: HostEnvironment,
    F: FnOnce(&Path) -> Result<(), UpdateError>,
{
    if !check.is_available() {
        return Ok(CycleOutcome::NoUpdate);
    }
    // is_available guarantees these are populated
    let (Some(url), Some(file_name), Some(version)) =
        (&check.download_url, &check.file_name, &check.next_version)
    else {
        return Ok(CycleOutcome::NoUpdate);
    };

    let artifact = stage_and_verify(url, file_name, config).await?;

    info!("stopping {} service before install", config.service_name);
    let stop_state = supervisor.stop().await?;
    if stop_state != ServiceState::Stopped {
        // Reported, not fatal - the installer copes with a wedged service
        warn!(
            "service did not reach Stopped within the wait (observed {}), continuing",
            stop_state
        );
    }

    install(&artifact)?;

    let service_state = supervisor.start().await?;
    if service_state == ServiceState::Running {
        info!("service confirmed running on version {}", version);
    } else {
        warn!(
            "service state after install is {} - not confirmed running",
            service_state
        );
    }

    Ok(CycleOutcome::Installed {
        version: version.clone(),
        service_state,
    })
}

/// Stage the artifact (skipping the download when already present) and
/// refuse to hand over anything that fails the digest or carries no
/// embedded signature.
async fn stage_and_verify(
    url: &str,
    file_name: &str,
    config: &UpdaterConfig,
) -> Result<PathBuf, UpdateError> {
    let staging = config.staging_dir().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no local data directory")
    })?;

    if downloader::is_already_staged(&staging, file_name) {
        info!("installer already staged at {}, skipping download", staging.display());
    } else {
        downloader::fetch(url, &staging, file_name).await?;
    }

    let artifact = staging.join(file_name);

    let digest_matched = verifier::verify_hash(&staging, file_name, url).await?;
    enforce_integrity(&artifact, digest_matched).await?;

    let signature = pe::signature_info(&artifact).await?;
    if !signature.is_signed() {
        return Err(UpdateError::Unsigned(artifact.display().to_string()));
    }
    info!(
        "installer signature region present: va 0x{:x}, size 0x{:x}",
        signature.certificate_table.virtual_address, signature.certificate_table.size
    );

    Ok(artifact)
}

/// Gate between verification and install: a mismatching artifact is deleted
/// on the spot so a later cycle re-downloads instead of re-staging it.
async fn enforce_integrity(artifact: &Path, digest_matched: bool) -> Result<(), UpdateError> {
    if digest_matched {
        return Ok(());
    }
    let _ = tokio::fs::remove_file(artifact).await;
    Err(UpdateError::IntegrityMismatch(
        artifact.display().to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ServiceError, ServiceSupervisor};

    struct InertControl;

    impl ServiceControl for InertControl {
        fn query(&mut self) -> Result<ServiceState, ServiceError> {
            panic!("service manager must not be touched when no update is available");
        }
        fn start(&mut self) -> Result<(), ServiceError> {
            panic!("service manager must not be touched when no update is available");
        }
        fn stop(&mut self) -> Result<(), ServiceError> {
            panic!("service manager must not be touched when no update is available");
        }
    }

    struct InertHost;

    impl HostEnvironment for InertHost {
        fn matching_pids(&mut self, _exe_name: &str) -> Vec<u32> {
            Vec::new()
        }
        fn kill(&mut self, _pid: u32) -> bool {
            false
        }
        fn is_alive(&mut self, _pid: u32) -> bool {
            false
        }
        fn remove_dns_rules(&mut self, _tag: &str) -> Result<(), ServiceError> {
            Ok(())
        }
        fn disable_adapters(&mut self, _prefix: &str) -> Result<(), ServiceError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn up_to_date_check_downloads_and_installs_nothing() {
        let config = UpdaterConfig::default();
        let mut supervisor = ServiceSupervisor::new(InertControl, InertHost, &config);

        let check = UpdateCheckResult::up_to_date();
        let outcome = apply_update(&check, &config, &mut supervisor, |_| {
            panic!("installer must not be invoked")
        })
        .await
        .unwrap();

        assert!(matches!(outcome, CycleOutcome::NoUpdate));
    }

    #[tokio::test]
    async fn mismatched_artifact_is_deleted_before_surfacing() {
        let artifact =
            std::env::temp_dir().join(format!("vt_gate_tampered_{}", std::process::id()));
        std::fs::write(&artifact, b"tampered installer").unwrap();

        let err = enforce_integrity(&artifact, false).await.unwrap_err();
        assert!(matches!(err, UpdateError::IntegrityMismatch(_)));
        assert!(!artifact.exists());
    }

    #[tokio::test]
    async fn verified_artifact_is_left_in_place() {
        let artifact =
            std::env::temp_dir().join(format!("vt_gate_verified_{}", std::process::id()));
        std::fs::write(&artifact, b"good installer").unwrap();

        enforce_integrity(&artifact, true).await.unwrap();
        assert!(artifact.exists());

        let _ = std::fs::remove_file(&artifact);
    }
}
