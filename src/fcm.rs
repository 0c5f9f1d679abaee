//! Firebase installations and FCM registration endpoints.

use base64::prelude::{Engine as _, BASE64_URL_SAFE, BASE64_URL_SAFE_NO_PAD};
use rand::RngCore;
use reqwest::Client as Http;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::{InitConfig, Keys};

pub(crate) mod endpoint {
    pub(crate) const INSTALLATIONS: &str =
        "https://firebaseinstallations.googleapis.com/v1/projects";
    pub(crate) const REGISTRATIONS: &str = "https://fcmregistrations.googleapis.com/v1/projects";
    pub(crate) const SEND: &str = "https://fcm.googleapis.com/fcm/send";
}

#[derive(Debug, Serialize)]
struct InstallationRequest<'a> {
    #[serde(rename = "appId")]
    app_id: &'a str,
    #[serde(rename = "authVersion")]
    auth_version: &'static str,
    #[serde(rename = "sdkVersion")]
    sdk_version: &'static str,
    fid: String,
}

#[derive(Debug, Deserialize)]
struct InstallationResponse {
    #[serde(rename = "authToken")]
    auth_token: AuthToken,
}

#[derive(Debug, Deserialize)]
struct AuthToken {
    token: String,
}

/// The `x-firebase-client` header value: base64url of the SDK heartbeat
/// structure.
fn firebase_client_header() -> String {
    BASE64_URL_SAFE.encode(br#"{"heartbeats":[],"version":2}"#)
}

/// Generates a Firebase installation id: 17 random bytes with the leading
/// nibble pinned to the FID range, base64url without padding.
fn generate_fid() -> String {
    let mut fid = [0u8; 17];
    rand::rngs::OsRng.fill_bytes(&mut fid);
    fid[0] = 0x70 | (fid[0] & 0x0f);
    BASE64_URL_SAFE_NO_PAD.encode(fid)
}

/// Registers a Firebase installation and returns its auth token.
pub async fn request_installation(
    http: &Http,
    init: &InitConfig,
) -> Result<String, InstallationError> {
    let url = format!("{}/{}/installations", endpoint::INSTALLATIONS, init.project_id);
    let request = InstallationRequest {
        app_id: &init.app_id,
        auth_version: "FIS_v2",
        sdk_version: "w:0.6.4",
        fid: generate_fid(),
    };

    log::debug!("{request:#?}");

    let response: InstallationResponse = http
        .post(&url)
        .header("x-goog-api-key", &init.api_key)
        .header("x-firebase-client", firebase_client_header())
        .json(&request)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    Ok(response.auth_token.token)
}

#[derive(Debug, Error)]
#[error("failed to register firebase installation: {0}")]
pub enum InstallationError {
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Serialize)]
struct WebRegistration<'a> {
    #[serde(rename = "applicationPubKey")]
    application_pub_key: &'a str,
    auth: &'a str,
    endpoint: String,
    p256dh: &'a str,
}

#[derive(Debug, Serialize)]
struct RegistrationRequest<'a> {
    web: WebRegistration<'a>,
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    token: String,
}

/// Binds the Web Push subscription to FCM, yielding the long-lived token
/// senders address messages to.
pub async fn register(
    http: &Http,
    init: &InitConfig,
    installation_token: &str,
    keys: &Keys,
    gcm_token: &str,
) -> Result<String, RegisterError> {
    let url = format!("{}/{}/registrations", endpoint::REGISTRATIONS, init.project_id);
    let request = RegistrationRequest {
        web: WebRegistration {
            application_pub_key: &init.vapid_key,
            auth: &keys.auth_secret,
            endpoint: format!("{}/{}", endpoint::SEND, gcm_token),
            p256dh: &keys.public_key,
        },
    };

    log::debug!("{request:#?}");

    let response: RegistrationResponse = http
        .post(&url)
        .header("x-goog-api-key", &init.api_key)
        .header("x-goog-firebase-installations-auth", installation_token)
        .json(&request)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    Ok(response.token)
}

#[derive(Debug, Error)]
#[error("failed to register with fcm: {0}")]
pub enum RegisterError {
    Http(#[from] reqwest::Error),
}
