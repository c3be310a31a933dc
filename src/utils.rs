//! Utility helpers shared across the updater and supervisor

use std::future::Future;
use std::process::Command;
use std::time::Duration;

use log::warn;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Windows CREATE_NO_WINDOW flag to prevent console windows from appearing
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Create a Command that won't show a console window on Windows.
///
/// Used for the sc.exe / powershell shell-outs so a background update never
/// flashes a command prompt at the user.
pub fn hidden_command(program: &str) -> Command {
    let mut cmd = Command::new(program);

    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);

    cmd
}

/// Retry an async operation with exponential backoff (1s, 2s, 4s, ...).
///
/// Returns the first success, or the last error once `attempts` is exhausted.
pub async fn with_retry<T, E, F, Fut>(attempts: u32, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = Duration::from_secs(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(
                    "attempt {}/{} failed: {}. retrying in {:?}",
                    attempt, attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retry(3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 1 {
                    Err("transient".to_string())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retry(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("down".to_string()) }
        })
        .await;

        assert_eq!(result, Err("down".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
