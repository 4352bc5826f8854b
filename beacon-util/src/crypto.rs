//! Symmetric key derivation and shared access signatures.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::types::SymmetricKey;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("key has an invalid length")]
    Length,
}

fn sign(key: &SymmetricKey, data: &[u8]) -> Result<String, KeyError> {
    let key_bytes = STANDARD.decode(key.expose())?;
    let mut mac = HmacSha256::new_from_slice(&key_bytes).map_err(|_| KeyError::Length)?;
    mac.update(data);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Derive a device key from an enrollment group key
///
/// The result is `base64(HMAC-SHA256(base64decode(group_key), device_id))`,
/// the same derivation the provisioning service applies on its side.
pub fn derive_device_key(group_key: &SymmetricKey, device_id: &str) -> Result<SymmetricKey, KeyError> {
    sign(group_key, device_id.as_bytes()).map(SymmetricKey::from)
}

/// Build a shared access signature token for `resource`
///
/// `policy` is the optional key name (`skn`), e.g. `registration` for the
/// provisioning service. Devices authenticating with their own key leave it
/// out.
pub fn sas_token(
    resource: &str,
    key: &SymmetricKey,
    expiry: DateTime<Utc>,
    policy: Option<&str>,
) -> Result<String, KeyError> {
    let resource = urlencoding::encode(resource);
    let expiry = expiry.timestamp();
    let signature = sign(key, format!("{resource}\n{expiry}").as_bytes())?;

    let mut token = format!(
        "SharedAccessSignature sr={resource}&sig={}&se={expiry}",
        urlencoding::encode(&signature)
    );
    if let Some(policy) = policy {
        token.push_str("&skn=");
        token.push_str(policy);
    }
    Ok(token)
}
