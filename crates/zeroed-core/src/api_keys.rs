use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::api::ApiError;
use crate::datastore::{DataStore, Record};
use crate::webhook::constant_time_eq;

pub const API_KEY_PREFIX: &str = "zk_";
const API_KEY_LEN: usize = 32;
/// Characters of the plaintext kept for display and lookup.
const DISPLAY_PREFIX_LEN: usize = 11;

#[derive(Debug, Error, PartialEq)]
pub enum ApiKeyError {
    #[error("API key is malformed")]
    Invalid,
    #[error("API key not found")]
    NotFound,
    #[error("API key revoked")]
    Revoked,
}

impl From<ApiKeyError> for ApiError {
    fn from(err: ApiKeyError) -> Self {
        ApiError::Unauthorized(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiKey {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub key_hash: String,
    pub prefix: String,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Record for ApiKey {
    const FILE: &'static str = "api_keys.data";
}

/// `zk_` followed by 32 random bytes as hex.
fn generate_api_key() -> String {
    let bytes: [u8; API_KEY_LEN] = rand::rng().random();
    format!("{API_KEY_PREFIX}{}", hex::encode(bytes))
}

fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

fn is_well_formed(key: &str) -> bool {
    key.strip_prefix(API_KEY_PREFIX).is_some_and(|rest| {
        rest.len() == API_KEY_LEN * 2 && rest.bytes().all(|b| b.is_ascii_hexdigit())
    })
}

/// Stores a new key and returns it with the plaintext, which is not kept.
#[instrument(skip(store, now))]
pub fn create_api_key(
    store: &DataStore,
    user_id: Uuid,
    name: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<(ApiKey, String)> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("API key name cannot be empty".to_string()).into());
    }
    let raw_key = generate_api_key();
    let key = ApiKey {
        id: Uuid::new_v4(),
        user_id,
        name: name.to_string(),
        key_hash: hash_api_key(&raw_key),
        prefix: raw_key[..DISPLAY_PREFIX_LEN].to_string(),
        last_used_at: None,
        revoked_at: None,
        created_at: now,
    };
    store.update(|keys: &mut Vec<ApiKey>| {
        keys.push(key.clone());
        Ok(())
    })?;
    info!(prefix = %key.prefix, "created API key");
    Ok((key, raw_key))
}

/// Resolves the owner of `raw_key` and records the use.
#[instrument(skip(store, raw_key, now))]
pub fn authenticate_api_key(
    store: &DataStore,
    raw_key: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<ApiKey> {
    let raw_key = raw_key.trim();
    if !is_well_formed(raw_key) {
        return Err(ApiKeyError::Invalid.into());
    }
    let expected = hash_api_key(raw_key);
    store.update(|keys: &mut Vec<ApiKey>| {
        let key = keys
            .iter_mut()
            .find(|k| k.prefix == raw_key[..DISPLAY_PREFIX_LEN] && constant_time_eq(&k.key_hash, &expected))
            .ok_or(ApiKeyError::NotFound)?;
        if key.revoked_at.is_some() {
            warn!(prefix = %key.prefix, "revoked API key presented");
            return Err(ApiKeyError::Revoked.into());
        }
        key.last_used_at = Some(now);
        Ok(key.clone())
    })
}

pub fn api_keys_for_user(store: &DataStore, user_id: Uuid) -> anyhow::Result<Vec<ApiKey>> {
    Ok(store
        .load::<ApiKey>()?
        .into_iter()
        .filter(|k| k.user_id == user_id)
        .collect())
}

/// Revokes by name or display prefix.
#[instrument(skip(store, now))]
pub fn revoke_api_key(
    store: &DataStore,
    user_id: Uuid,
    selector: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<ApiKey> {
    let selector = selector.trim();
    store.update(|keys: &mut Vec<ApiKey>| {
        let key = keys
            .iter_mut()
            .find(|k| {
                k.user_id == user_id
                    && k.revoked_at.is_none()
                    && (k.name.eq_ignore_ascii_case(selector) || k.prefix == selector)
            })
            .ok_or(ApiKeyError::NotFound)?;
        key.revoked_at = Some(now);
        info!(prefix = %key.prefix, "revoked API key");
        Ok(key.clone())
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::{
        ApiKeyError, api_keys_for_user, authenticate_api_key, create_api_key, generate_api_key,
        revoke_api_key,
    };
    use crate::datastore::DataStore;

    #[test]
    fn generated_keys_have_prefix_and_length() {
        let key = generate_api_key();
        assert!(key.starts_with("zk_"));
        assert_eq!(key.len(), 3 + 64);
        assert_ne!(key, generate_api_key());
    }

    #[test]
    fn authenticate_then_revoke() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DataStore::open(dir.path()).expect("open");
        let user = Uuid::new_v4();
        let now = Utc::now();

        let (stored, raw) = create_api_key(&store, user, "ci", now).expect("create");
        assert_ne!(stored.key_hash, raw);
        assert!(raw.starts_with(&stored.prefix));

        let found = authenticate_api_key(&store, &raw, now).expect("auth");
        assert_eq!(found.user_id, user);
        assert_eq!(api_keys_for_user(&store, user).expect("list")[0].last_used_at, Some(now));

        let mut tampered = raw.clone();
        tampered.pop();
        tampered.push(if raw.ends_with('0') { '1' } else { '0' });
        let err = authenticate_api_key(&store, &tampered, now).expect_err("tampered");
        assert_eq!(err.downcast_ref::<ApiKeyError>(), Some(&ApiKeyError::NotFound));
        let err = authenticate_api_key(&store, "zk_short", now).expect_err("malformed");
        assert_eq!(err.downcast_ref::<ApiKeyError>(), Some(&ApiKeyError::Invalid));

        revoke_api_key(&store, user, "CI", now).expect("revoke");
        let err = authenticate_api_key(&store, &raw, now).expect_err("revoked");
        assert_eq!(err.downcast_ref::<ApiKeyError>(), Some(&ApiKeyError::Revoked));
    }
}
