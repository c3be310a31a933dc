//! Artifact fetcher - stages release assets in the updates directory

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use log::{debug, error, info};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use super::types::UpdateError;

const UPDATE_HTTP_USER_AGENT: &str = "VeilTunnel-Updater";

/// Ten minutes: large installer over a slow link.
const DOWNLOAD_TIMEOUT_SECS: u64 = 600;

/// Whether the artifact is already present in the staging directory.
/// Existence check only - content is validated separately by the verifier.
pub fn is_already_staged(dest_dir: &Path, dest_name: &str) -> bool {
    dest_dir.join(dest_name).exists()
}

/// Download `url` to `<dest_dir>/<dest_name>`, overwriting any partial
/// prior download. Completes or fails before returning.
pub async fn fetch(url: &str, dest_dir: &Path, dest_name: &str) -> Result<PathBuf, UpdateError> {
    tokio::fs::create_dir_all(dest_dir).await?;
    let dest_path = dest_dir.join(dest_name);

    info!("download started for: {} to {}", url, dest_path.display());

    let client = reqwest::Client::builder()
        .user_agent(UPDATE_HTTP_USER_AGENT)
        .timeout(std::time::Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .build()?;

    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(UpdateError::Download {
            url: url.to_string(),
            reason: format!("status {}", response.status()),
        });
    }

    stream_to_file(response, &dest_path, url).await?;

    info!("download complete to: {}", dest_path.display());
    Ok(dest_path)
}

/// Write the response body to `dest_path`. A truncated or failed transfer
/// must not leave a partial file behind - the staged check is existence
/// only, so a leftover would short-circuit the next cycle's download.
async fn stream_to_file(
    response: reqwest::Response,
    dest_path: &Path,
    url: &str,
) -> Result<u64, UpdateError> {
    let total_size = response.content_length().unwrap_or(0);
    debug!("download size: {} bytes", total_size);

    // File::create truncates, so a partial earlier download is overwritten
    let mut file = File::create(dest_path).await?;

    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(dest_path).await;
                return Err(UpdateError::Download {
                    url: url.to_string(),
                    reason: format!("error reading chunk: {}", e),
                });
            }
        };
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
    }

    file.flush().await?;

    if total_size > 0 && downloaded != total_size {
        error!(
            "downloaded size mismatch: expected {}, got {}",
            total_size, downloaded
        );
        drop(file);
        let _ = tokio::fs::remove_file(dest_path).await;
        return Err(UpdateError::Download {
            url: url.to_string(),
            reason: format!("incomplete: expected {} bytes, got {}", total_size, downloaded),
        });
    }

    Ok(downloaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_check_is_existence_only() {
        let dir = std::env::temp_dir().join(format!("vt_stage_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        assert!(!is_already_staged(&dir, "VeilTunnel.Client-1.1.0.exe"));

        // An empty (even partial) file counts as staged
        std::fs::write(dir.join("VeilTunnel.Client-1.1.0.exe"), b"").unwrap();
        assert!(is_already_staged(&dir, "VeilTunnel.Client-1.1.0.exe"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn fetch_reports_transport_failure() {
        let dir = std::env::temp_dir().join(format!("vt_fetch_test_{}", std::process::id()));

        // Nothing listens on port 9, connection is refused immediately
        let result = fetch("http://127.0.0.1:9/nope.exe", &dir, "nope.exe").await;
        assert!(result.is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    fn response_from_stream(
        chunks: Vec<Result<Vec<u8>, std::io::Error>>,
    ) -> reqwest::Response {
        let body = reqwest::Body::wrap_stream(futures_util::stream::iter(chunks));
        reqwest::Response::from(
            http::Response::builder()
                .status(200)
                .body(body)
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn mid_stream_failure_removes_partial_file() {
        let dir = std::env::temp_dir().join(format!("vt_chunk_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let dest = dir.join("VeilTunnel.Client-1.1.0.exe");

        let response = response_from_stream(vec![
            Ok(b"first half of the installer".to_vec()),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset",
            )),
        ]);

        let result = stream_to_file(response, &dest, "http://example.invalid/a.exe").await;
        assert!(matches!(result, Err(UpdateError::Download { .. })));
        // No leftover to trip the staged-existence check on the next cycle
        assert!(!dest.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn complete_stream_is_written_whole() {
        let dir = std::env::temp_dir().join(format!("vt_stream_ok_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let dest = dir.join("VeilTunnel.Client-1.1.0.exe");

        let response =
            response_from_stream(vec![Ok(b"whole ".to_vec()), Ok(b"installer".to_vec())]);

        let written = stream_to_file(response, &dest, "http://example.invalid/a.exe")
            .await
            .unwrap();
        assert_eq!(written, "whole installer".len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), b"whole installer");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
