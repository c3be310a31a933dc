//! Integrity verifier - detached SHA256 checksum verification

use std::path::Path;

use log::{error, info};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::downloader;
use super::types::UpdateError;

const CHECKSUM_EXTENSION: &str = ".sha256";

/// Verify the staged artifact `<dest_dir>/<dest_name>` against the detached
/// checksum published at `<artifact_url>.sha256`.
///
/// The checksum is downloaded to a transient sidecar next to the artifact
/// and deleted again regardless of the outcome. Returns true only on an
/// exact (case-insensitive, whitespace-trimmed) match; an incomplete
/// comparison is an error, never a false "valid".
pub async fn verify_hash(
    dest_dir: &Path,
    dest_name: &str,
    artifact_url: &str,
) -> Result<bool, UpdateError> {
    let sidecar_name = format!("{}{}", dest_name, CHECKSUM_EXTENSION);
    let sidecar_url = format!("{}{}", artifact_url, CHECKSUM_EXTENSION);

    let sidecar_path = downloader::fetch(&sidecar_url, dest_dir, &sidecar_name).await?;

    compare_with_sidecar(&dest_dir.join(dest_name), &sidecar_path).await
}

/// Compare an artifact against an already-staged sidecar file, deleting the
/// sidecar whether or not the comparison worked.
pub async fn compare_with_sidecar(
    artifact: &Path,
    sidecar: &Path,
) -> Result<bool, UpdateError> {
    let expected = tokio::fs::read_to_string(sidecar).await;
    let computed = compute_sha256(artifact).await;

    // Sidecar is transient: remove it before any error can propagate
    let _ = tokio::fs::remove_file(sidecar).await;

    let expected = expected?;
    let computed = computed?;

    info!(
        "comparing computed hash: {} to downloaded hash: {}",
        computed,
        expected.trim()
    );

    if digests_match(&computed, &expected) {
        Ok(true)
    } else {
        error!(
            "checksum mismatch! expected: {}, got: {}",
            expected.trim(),
            computed
        );
        Ok(false)
    }
}

/// Compute the SHA256 digest of a file as lowercase hex.
pub async fn compute_sha256(file_path: &Path) -> Result<String, UpdateError> {
    let mut file = File::open(file_path).await?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let bytes_read = file.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compare a computed digest against sidecar content the way `verify_hash`
/// does: trimmed and case-insensitive.
pub fn digests_match(computed: &str, sidecar_content: &str) -> bool {
    computed.trim().to_lowercase() == sidecar_content.trim().to_lowercase()
}
