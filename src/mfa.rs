//! HTTP client for the MFA service-control surface
//!
//! The tunnel control service exposes MFA management keyed by an identity
//! fingerprint plus a one-time code. Responses carry a numeric status code;
//! anything non-zero is an API failure with an attached message. The
//! screens driving these calls live in the desktop app - this is just the
//! typed surface they consume.

use log::{debug, error};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

const MFA_HTTP_USER_AGENT: &str = "VeilTunnel-Client";

#[derive(Debug, Error)]
pub enum MfaError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("mfa api error {code}: {message}")]
    Api { code: i32, message: String },
}

/// Generic status response from the MFA endpoints.
#[derive(Debug, Deserialize)]
pub struct SvcResponse {
    pub code: i32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Status response plus the recovery code list.
#[derive(Debug, Deserialize)]
pub struct MfaRecoveryCodesResponse {
    pub code: i32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub recovery_codes: Vec<String>,
}

fn check_status(
    code: i32,
    error: Option<String>,
    message: Option<String>,
) -> Result<(), MfaError> {
    if code == 0 {
        return Ok(());
    }
    // Some endpoints report through `error`, some through `message`
    let message = error
        .or(message)
        .unwrap_or_else(|| "unknown error".to_string());
    Err(MfaError::Api { code, message })
}

/// Client for one control-service endpoint.
pub struct MfaClient {
    client: Client,
    base_url: String,
}

impl MfaClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::builder()
                .user_agent(MFA_HTTP_USER_AGENT)
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post(
        &self,
        path: &str,
        fingerprint: &str,
        code: &str,
    ) -> Result<reqwest::Response, MfaError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("mfa request to {} for identity {}", url, fingerprint);

        let response = self
            .client
            .post(&url)
            .json(&json!({
                "fingerprint": fingerprint,
                "code": code,
            }))
            .send()
            .await?
            .error_for_status()?;

        Ok(response)
    }

    async fn post_svc(&self, path: &str, fingerprint: &str, code: &str) -> Result<(), MfaError> {
        let svc: SvcResponse = self.post(path, fingerprint, code).await?.json().await?;
        if let Err(e) = check_status(svc.code, svc.error, svc.message) {
            error!("mfa call {} failed: {}", path, e);
            return Err(e);
        }
        Ok(())
    }

    async fn post_codes(
        &self,
        path: &str,
        fingerprint: &str,
        code: &str,
    ) -> Result<Vec<String>, MfaError> {
        let resp: MfaRecoveryCodesResponse =
            self.post(path, fingerprint, code).await?.json().await?;
        check_status(resp.code, resp.error, None)?;
        Ok(resp.recovery_codes)
    }

    /// Begin MFA enrollment for an identity.
    pub async fn enroll(&self, fingerprint: &str, code: &str) -> Result<(), MfaError> {
        self.post_svc("/mfa/enroll", fingerprint, code).await
    }

    /// Confirm enrollment with a code from the authenticator.
    pub async fn verify(&self, fingerprint: &str, code: &str) -> Result<(), MfaError> {
        self.post_svc("/mfa/verify", fingerprint, code).await
    }

    /// Authenticate a session for an enrolled identity.
    pub async fn authenticate(&self, fingerprint: &str, code: &str) -> Result<(), MfaError> {
        self.post_svc("/mfa/auth", fingerprint, code).await
    }

    /// Remove MFA from an identity.
    pub async fn remove(&self, fingerprint: &str, code: &str) -> Result<(), MfaError> {
        self.post_svc("/mfa/remove", fingerprint, code).await
    }

    /// Fetch the current recovery codes.
    pub async fn recovery_codes(
        &self,
        fingerprint: &str,
        code: &str,
    ) -> Result<Vec<String>, MfaError> {
        self.post_codes("/mfa/recovery-codes", fingerprint, code).await
    }

    /// Invalidate and regenerate the recovery codes.
    pub async fn regenerate_recovery_codes(
        &self,
        fingerprint: &str,
        code: &str,
    ) -> Result<Vec<String>, MfaError> {
        self.post_codes("/mfa/recovery-codes/regenerate", fingerprint, code)
            .await
    }
}
