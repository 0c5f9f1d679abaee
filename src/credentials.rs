//! Credential bundles, session configuration and the persisted JSON shapes.
//!
//! File I/O itself stays with the host application; this module only fixes
//! the formats (`init_fcm_data.json`, `fcm_register_data.json`, the
//! `;`-separated persistent-id list) and validates key material.

use std::time::Duration;

use base64::prelude::{Engine as _, BASE64_URL_SAFE_NO_PAD};
use ece::crypto::EcKeyComponents;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub(crate) const PRIVATE_KEY_LEN: usize = 32;
pub(crate) const PUBLIC_KEY_LEN: usize = 65;
pub(crate) const AUTH_SECRET_LEN: usize = 16;
pub(crate) const SALT_LEN: usize = 16;

/// Session tuning knobs. The defaults match the production message server.
#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Delay between a heartbeat ack and the next ping.
    pub heartbeat_interval: Duration,
    /// Record size of inbound `aesgcm` payloads.
    pub record_size: u32,
    /// Log per-frame parser progress.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: crate::MCS_HOST.to_string(),
            port: crate::MCS_PORT,
            heartbeat_interval: Duration::from_millis(600_000),
            record_size: 4096,
            verbose: false,
        }
    }
}

/// Firebase application identity, the shape of the host's
/// `init_fcm_data.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitConfig {
    #[serde(rename = "appid")]
    pub app_id: String,
    #[serde(rename = "projectid")]
    pub project_id: String,
    #[serde(rename = "apikey")]
    pub api_key: String,
    #[serde(rename = "vapidkey")]
    pub vapid_key: String,
}

/// Credential bundle produced by registration, the shape of the host's
/// `fcm_register_data.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterData {
    pub acg: AcgCredentials,
    pub ece: EceKeys,
    #[serde(rename = "Token")]
    pub token: String,
}

/// Device identity minted by checkin. Stored as decimal strings so JSON
/// round-trips cannot lose precision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcgCredentials {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "SecurityToken")]
    pub security_token: String,
}

/// Web Push receiver keys, base64url without padding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EceKeys {
    #[serde(rename = "AuthSecret")]
    pub auth_secret: String,
    #[serde(rename = "PrivateKey")]
    pub private_key: String,
    /// Written by this crate; bundles from older receivers omit it, in which
    /// case the public key is derived from the private scalar on load.
    #[serde(rename = "PublicKey", skip_serializing_if = "Option::is_none", default)]
    pub public_key: Option<String>,
}

/// Invalid or unparseable credential material. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid android id `{value}`")]
    InvalidAndroidId { value: String },
    #[error("invalid security token")]
    InvalidSecurityToken,
    #[error("{field} is not valid base64url: {source}")]
    Base64 {
        field: &'static str,
        source: base64::DecodeError,
    },
    #[error("{field} has length {len}, expected {expected}")]
    KeyLength {
        field: &'static str,
        len: usize,
        expected: usize,
    },
    #[error("failed to derive public key: {0}")]
    KeyDerivation(#[from] openssl::error::ErrorStack),
}

/// Key material decoded and validated, ready for an MCS session.
#[derive(Debug)]
pub(crate) struct DeviceCredentials {
    pub android_id: u64,
    pub security_token: u64,
    pub key_components: EcKeyComponents,
    pub auth_secret: Vec<u8>,
}

impl RegisterData {
    pub(crate) fn decode(&self) -> Result<DeviceCredentials, ConfigError> {
        let android_id = self
            .acg
            .id
            .parse()
            .map_err(|_| ConfigError::InvalidAndroidId {
                value: self.acg.id.clone(),
            })?;
        let security_token = self
            .acg
            .security_token
            .parse()
            .map_err(|_| ConfigError::InvalidSecurityToken)?;

        let private_key = decode_key("PrivateKey", &self.ece.private_key, PRIVATE_KEY_LEN)?;
        let auth_secret = decode_key("AuthSecret", &self.ece.auth_secret, AUTH_SECRET_LEN)?;
        let public_key = match &self.ece.public_key {
            Some(encoded) => decode_key("PublicKey", encoded, PUBLIC_KEY_LEN)?,
            None => derive_public_key(&private_key)?,
        };

        Ok(DeviceCredentials {
            android_id,
            security_token,
            key_components: EcKeyComponents::new(private_key, public_key),
            auth_secret,
        })
    }
}

fn decode_key(
    field: &'static str,
    encoded: &str,
    expected: usize,
) -> Result<Vec<u8>, ConfigError> {
    let bytes = BASE64_URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|source| ConfigError::Base64 { field, source })?;
    if bytes.len() != expected {
        return Err(ConfigError::KeyLength {
            field,
            len: bytes.len(),
            expected,
        });
    }
    Ok(bytes)
}

/// Recomputes the uncompressed P-256 public point for a raw private scalar.
fn derive_public_key(private_key: &[u8]) -> Result<Vec<u8>, ConfigError> {
    use openssl::bn::{BigNum, BigNumContext};
    use openssl::ec::{EcGroup, EcPoint, PointConversionForm};
    use openssl::nid::Nid;

    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let mut ctx = BigNumContext::new()?;
    let scalar = BigNum::from_slice(private_key)?;
    let mut point = EcPoint::new(&group)?;
    point.mul_generator(&group, &scalar, &ctx)?;
    Ok(point.to_bytes(&group, PointConversionForm::UNCOMPRESSED, &mut ctx)?)
}

/// Freshly generated Web Push receiver keys, base64url without padding.
#[derive(Debug)]
pub(crate) struct Keys {
    pub private_key: String,
    pub public_key: String,
    pub auth_secret: String,
}

impl Keys {
    pub(crate) fn generate() -> Result<Self, ece::Error> {
        let (keypair, auth_secret) = ece::generate_keypair_and_auth_secret()?;
        let components = keypair.raw_components()?;

        Ok(Self {
            private_key: BASE64_URL_SAFE_NO_PAD.encode(components.private_key()),
            public_key: BASE64_URL_SAFE_NO_PAD.encode(components.public_key()),
            auth_secret: BASE64_URL_SAFE_NO_PAD.encode(auth_secret),
        })
    }
}

/// Joins persistent ids the way `persistent_id.txt` stores them.
pub fn join_persistent_ids(ids: &[String]) -> String {
    ids.join(";")
}

/// Splits the `;`-separated contents of `persistent_id.txt`, dropping
/// empty entries.
pub fn split_persistent_ids(contents: &str) -> Vec<String> {
    contents
        .split(';')
        .filter(|id| !id.trim().is_empty())
        .map(|id| id.trim().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::prelude::Engine as _;

    fn register_data(keys: &Keys) -> RegisterData {
        RegisterData {
            acg: AcgCredentials {
                id: "4482950800742551725".into(),
                security_token: "7276579123855609860".into(),
            },
            ece: EceKeys {
                auth_secret: keys.auth_secret.clone(),
                private_key: keys.private_key.clone(),
                public_key: Some(keys.public_key.clone()),
            },
            token: "fcm-token".into(),
        }
    }

    #[test]
    fn decode_accepts_generated_keys() {
        let keys = Keys::generate().unwrap();
        let credentials = register_data(&keys).decode().unwrap();
        assert_eq!(credentials.android_id, 4482950800742551725);
        assert_eq!(credentials.security_token, 7276579123855609860);
        assert_eq!(credentials.auth_secret.len(), AUTH_SECRET_LEN);
    }

    #[test]
    fn missing_public_key_is_derived() {
        let keys = Keys::generate().unwrap();
        let mut data = register_data(&keys);
        data.ece.public_key = None;

        let derived = data.decode().unwrap();
        let expected = BASE64_URL_SAFE_NO_PAD.decode(&keys.public_key).unwrap();
        assert_eq!(derived.key_components.public_key(), expected.as_slice());
    }

    #[test]
    fn bad_numbers_and_lengths_are_rejected() {
        let keys = Keys::generate().unwrap();

        let mut data = register_data(&keys);
        data.acg.id = "not-a-number".into();
        assert!(matches!(
            data.decode(),
            Err(ConfigError::InvalidAndroidId { .. })
        ));

        let mut data = register_data(&keys);
        data.ece.auth_secret = BASE64_URL_SAFE_NO_PAD.encode([0u8; 4]);
        assert!(matches!(
            data.decode(),
            Err(ConfigError::KeyLength {
                field: "AuthSecret",
                len: 4,
                expected: AUTH_SECRET_LEN,
            })
        ));

        let mut data = register_data(&keys);
        data.ece.private_key = "!!not base64!!".into();
        assert!(matches!(
            data.decode(),
            Err(ConfigError::Base64 {
                field: "PrivateKey",
                ..
            })
        ));
    }

    #[test]
    fn register_data_round_trips_through_json() {
        let keys = Keys::generate().unwrap();
        let data = register_data(&keys);
        let json = serde_json::to_string(&data).unwrap();
        assert!(json.contains("\"acg\""));
        assert!(json.contains("\"SecurityToken\""));

        let back: RegisterData = serde_json::from_str(&json).unwrap();
        assert_eq!(back.acg.id, data.acg.id);
        assert_eq!(back.token, data.token);

        // Bundles written by older receivers carry no PublicKey.
        let legacy = r#"{"acg":{"ID":"123","SecurityToken":"456"},
            "ece":{"AuthSecret":"AAAAAAAAAAAAAAAAAAAAAA","PrivateKey":"x"},
            "Token":"t"}"#;
        let parsed: RegisterData = serde_json::from_str(legacy).unwrap();
        assert!(parsed.ece.public_key.is_none());
    }

    #[test]
    fn persistent_ids_round_trip() {
        let ids = vec!["p1".to_string(), "p2".to_string(), "p3".to_string()];
        let joined = join_persistent_ids(&ids);
        assert_eq!(joined, "p1;p2;p3");
        assert_eq!(split_persistent_ids(&joined), ids);
        assert!(split_persistent_ids("").is_empty());
        assert_eq!(split_persistent_ids("p1;;p2;"), ["p1", "p2"]);
    }
}
