//! Terminal secrets in the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Values come back wrapped in
//! [`Zeroizing`] so they are wiped from memory when dropped.

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::ConfigError;

const SERVICE_NAME: &str = "the-small-pos";

// Credential keys
pub const KEY_TERMINAL_ID: &str = "terminal_id";
pub const KEY_CLOUD_API_KEY: &str = "pos_api_key";
pub const KEY_RELAY_SECRET: &str = "relay_secret";

const ALL_KEYS: &[&str] = &[KEY_TERMINAL_ID, KEY_CLOUD_API_KEY, KEY_RELAY_SECRET];

/// Retrieve a single credential. Returns `None` when the entry does not exist
/// or the platform store is unavailable.
pub fn get_credential(key: &str) -> Option<Zeroizing<String>> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) if pw.trim().is_empty() => None,
        Ok(pw) => Some(Zeroizing::new(pw)),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), ConfigError> {
    let entry =
        Entry::new(SERVICE_NAME, key).map_err(|e| ConfigError::Credential(e.to_string()))?;
    entry
        .set_password(value)
        .map_err(|e| ConfigError::Credential(e.to_string()))?;
    Ok(())
}

/// Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), ConfigError> {
    let entry =
        Entry::new(SERVICE_NAME, key).map_err(|e| ConfigError::Credential(e.to_string()))?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(ConfigError::Credential(e.to_string())),
    }
}

/// Store the secrets handed over during terminal pairing.
///
/// Accepts snake_case or camelCase keys: `terminalId`, `apiKey` and the
/// optional `relaySecret`.
pub fn store_pairing(payload: &Value) -> Result<(), ConfigError> {
    let pick = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| payload.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };

    let terminal_id = pick(&["terminalId", "terminal_id"])
        .ok_or_else(|| ConfigError::Invalid("missing required field: terminalId".into()))?;
    let api_key = pick(&["apiKey", "pos_api_key", "api_key"])
        .ok_or_else(|| ConfigError::Invalid("missing required field: apiKey".into()))?;

    set_credential(KEY_TERMINAL_ID, terminal_id)?;
    set_credential(KEY_CLOUD_API_KEY, api_key)?;
    if let Some(secret) = pick(&["relaySecret", "relay_secret"]) {
        set_credential(KEY_RELAY_SECRET, secret)?;
    }

    info!(terminal_id = %terminal_id, "terminal credentials stored");
    Ok(())
}

/// Delete every stored credential (factory reset).
pub fn clear_credentials() -> Result<(), ConfigError> {
    info!("deleting all terminal credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pairing_requires_terminal_and_key() {
        let err = store_pairing(&json!({ "apiKey": "k" })).unwrap_err();
        assert!(err.to_string().contains("terminalId"));

        let err = store_pairing(&json!({ "terminal_id": "t1", "apiKey": "  " })).unwrap_err();
        assert!(err.to_string().contains("apiKey"));
    }
}
