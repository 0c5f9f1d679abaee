//! Device checkin and legacy GCM registration.

pub mod proto {
    #![allow(clippy::enum_variant_names)]
    include!(concat!(env!("OUT_DIR"), "/checkin_proto.rs"));
}

use base64::prelude::{Engine as _, BASE64_URL_SAFE_NO_PAD};
use prost::Message;
use proto::*;
use reqwest::Client as Http;
use serde::Serialize;
use thiserror::Error;

pub const CHECKIN_URL: &str = "https://android.clients.google.com/checkin";
pub const REGISTER_URL: &str = "https://android.clients.google.com/c2dm/register3";

// Sender key the Chrome GCM driver registers with. Do not change.
pub(crate) const SERVER_KEY: [u8; 65] = [
    0x04, 0x33, 0x94, 0xf7, 0xdf, 0xa1, 0xeb, 0xb1, 0xdc, 0x03, 0xa2, 0x5e, 0x15, 0x71, 0xdb,
    0x48, 0xd3, 0x2e, 0xed, 0xed, 0xb2, 0x34, 0xdb, 0xb7, 0x47, 0x3a, 0x0c, 0x8f, 0xc4, 0xcc,
    0xe1, 0x6f, 0x3c, 0x8c, 0x84, 0xdf, 0xab, 0xb6, 0x66, 0x3e, 0xf2, 0x0c, 0xd4, 0x8b, 0xfe,
    0xe3, 0xf9, 0x76, 0x2f, 0x14, 0x1c, 0x63, 0x08, 0x6a, 0x6f, 0x2d, 0xb1, 0x1a, 0x95, 0xb0,
    0xce, 0x37, 0xc0, 0x9c, 0x6e,
];

impl AndroidCheckinRequest {
    /// Chrome-browser checkin. Prior identity is echoed on re-checkin so the
    /// server refreshes the same device record.
    pub(crate) fn new(android_id: Option<u64>, security_token: Option<u64>) -> Self {
        Self {
            user_serial_number: Some(0),
            checkin: AndroidCheckinProto {
                r#type: Some(DeviceType::DeviceChromeBrowser as i32),
                chrome_build: Some(ChromeBuildProto {
                    platform: Some(chrome_build_proto::Platform::Mac as i32),
                    chrome_version: Some(crate::CHROME_VERSION.to_string()),
                    channel: Some(chrome_build_proto::Channel::Stable as i32),
                }),
                ..Default::default()
            },
            version: Some(3),
            id: android_id.map(|id| id as i64),
            security_token,
            ..Default::default()
        }
    }
}

/// Performs the checkin exchange that mints (or refreshes) the device's
/// `(android_id, security_token)` pair.
pub async fn check_in(
    http: &Http,
    android_id: Option<u64>,
    security_token: Option<u64>,
) -> Result<AndroidCheckinResponse, CheckInError> {
    let mut buf = Vec::new();
    AndroidCheckinRequest::new(android_id, security_token).encode(&mut buf)?;

    let response = http
        .post(CHECKIN_URL)
        .header("Content-Type", "application/x-protobuf")
        .body(buf)
        .send()
        .await?
        .error_for_status()?;

    Ok(AndroidCheckinResponse::decode(response.bytes().await?)?)
}

#[derive(Debug, Error)]
#[error("gcm check-in failed: {0}")]
pub enum CheckInError {
    Http(#[from] reqwest::Error),
    ProtoEncode(#[from] prost::EncodeError),
    ProtoDecode(#[from] prost::DecodeError),
    #[error("check-in response is missing android id or security token")]
    Incomplete,
}

#[derive(Debug, Serialize)]
pub(crate) struct RegisterForm {
    pub app: String,
    #[serde(rename = "X-subtype")]
    pub x_subtype: String,
    pub device: String,
    pub sender: String,
}

/// Registers the device with the legacy GCM endpoint, yielding the token
/// that becomes the Web Push endpoint identifier.
pub async fn register(
    http: &Http,
    app_id: &str,
    android_id: u64,
    security_token: u64,
) -> Result<String, RegisterError> {
    let form = RegisterForm {
        app: "org.chromium.linux".into(),
        x_subtype: app_id.into(),
        device: android_id.to_string(),
        sender: BASE64_URL_SAFE_NO_PAD.encode(SERVER_KEY),
    };

    log::debug!("{form:#?}");

    let response = http
        .post(REGISTER_URL)
        .header(
            "Authorization",
            format!("AidLogin {android_id}:{security_token}"),
        )
        .form(&form)
        .send()
        .await?
        .error_for_status()?;

    let body = response.text().await?;
    parse_register_body(&body)
}

/// The body is `token=<value>` on success and `Error=<reason>` on rejection.
fn parse_register_body(body: &str) -> Result<String, RegisterError> {
    match body.trim_end().split_once('=') {
        Some(("token", value)) => Ok(value.to_string()),
        Some(("Error", reason)) => Err(RegisterError::Rejected {
            reason: reason.to_string(),
        }),
        _ => Err(RegisterError::MalformedResponse {
            body: body.to_string(),
        }),
    }
}

#[derive(Debug, Error)]
#[error("failed to register with gcm: {0}")]
pub enum RegisterError {
    Http(#[from] reqwest::Error),
    #[error("registration rejected: {reason}")]
    Rejected { reason: String },
    #[error("malformed registration response `{body}`")]
    MalformedResponse { body: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkin_request_identifies_as_chrome() {
        let request = AndroidCheckinRequest::new(None, None);
        assert_eq!(request.version, Some(3));
        assert_eq!(request.id, None);
        assert_eq!(
            request.checkin.r#type,
            Some(DeviceType::DeviceChromeBrowser as i32)
        );
        let build = request.checkin.chrome_build.as_ref().unwrap();
        assert_eq!(build.chrome_version(), crate::CHROME_VERSION);

        let request = AndroidCheckinRequest::new(Some(42), Some(43));
        assert_eq!(request.id, Some(42));
        assert_eq!(request.security_token, Some(43));
    }

    #[test]
    fn register_body_parsing() {
        assert_eq!(parse_register_body("token=abc:def\n").unwrap(), "abc:def");
        assert!(matches!(
            parse_register_body("Error=PHONE_REGISTRATION_ERROR"),
            Err(RegisterError::Rejected { reason }) if reason == "PHONE_REGISTRATION_ERROR"
        ));
        assert!(matches!(
            parse_register_body("<html>504</html>"),
            Err(RegisterError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn server_key_is_an_uncompressed_point() {
        assert_eq!(SERVER_KEY.len(), 65);
        assert_eq!(SERVER_KEY[0], 0x04);
    }
}
