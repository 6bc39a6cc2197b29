//! API key lifecycle used by the account-management surface. The raw secret
//! exists in memory only while a key is created or revealed.

use chrono::Utc;
use cyder_tools::log::info;
use rand::{distr::Alphanumeric, Rng};
use serde::Serialize;

use crate::database::api_key::{ApiKey, UpdateApiKeyData};
use crate::database::DbResult;
use crate::error::BaseError;
use crate::service::app_state::AppState;
use crate::utils::crypto::hash_api_key;
use crate::utils::ID_GENERATOR;

const KEY_PREFIX: &str = "sk-";
const KEY_BODY_LEN: usize = 48;

#[derive(Debug, Default, Clone)]
pub struct NewApiKey {
    pub account_id: i64,
    pub label: String,
    pub expires_at: Option<i64>,
    pub total_quota: Option<i64>,
    pub rate_limit: Option<i32>,
    pub model_whitelist: Vec<String>,
}

/// A freshly minted key. `secret` is never stored in clear.
#[derive(Debug, Serialize)]
pub struct IssuedApiKey {
    pub id: i64,
    pub secret: String,
}

pub fn generate_secret() -> String {
    let body: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_BODY_LEN)
        .map(char::from)
        .collect();
    format!("{}{}", KEY_PREFIX, body)
}

fn encode_whitelist(models: &[String]) -> DbResult<String> {
    serde_json::to_string(models)
        .map_err(|e| BaseError::ParamInvalid(Some(format!("invalid model whitelist: {}", e))))
}

pub async fn create_api_key(app_state: &AppState, new_key: NewApiKey) -> DbResult<IssuedApiKey> {
    let secret = generate_secret();
    let sealed = app_state
        .cipher
        .seal(&secret)
        .map_err(|e| BaseError::InternalServerError(Some(e.to_string())))?;
    let now = Utc::now().timestamp_millis();
    let row = ApiKey {
        id: ID_GENERATOR.generate_id(),
        account_id: new_key.account_id,
        key_hash: hash_api_key(&secret),
        encrypted_key: Some(sealed),
        label: new_key.label,
        is_active: true,
        expires_at: new_key.expires_at,
        total_quota: new_key.total_quota,
        used_quota: 0,
        rate_limit: new_key.rate_limit,
        model_whitelist: encode_whitelist(&new_key.model_whitelist)?,
        created_at: now,
        updated_at: now,
    };
    let created = app_state.db.run(move |conn| ApiKey::insert(conn, &row)).await?;
    info!("api key {} created for account {}", created.id, created.account_id);
    Ok(IssuedApiKey {
        id: created.id,
        secret,
    })
}

/// Decrypts the stored copy of a key. Keys created before copies were kept
/// cannot be revealed.
pub async fn reveal_api_key(app_state: &AppState, api_key_id: i64) -> DbResult<String> {
    let key = app_state.db.run(move |conn| ApiKey::get_by_id(conn, api_key_id)).await?;
    let sealed = key
        .encrypted_key
        .ok_or_else(|| BaseError::NotFound(Some(format!("api key {} has no stored copy", api_key_id))))?;
    app_state
        .cipher
        .open(&sealed)
        .map_err(|e| BaseError::InternalServerError(Some(e.to_string())))
}

#[derive(Debug, Default, Clone)]
pub struct ApiKeyChanges {
    pub label: Option<String>,
    pub is_active: Option<bool>,
    pub expires_at: Option<Option<i64>>,
    pub total_quota: Option<Option<i64>>,
    pub rate_limit: Option<Option<i32>>,
    pub model_whitelist: Option<Vec<String>>,
}

pub async fn update_api_key(app_state: &AppState, api_key_id: i64, changes: ApiKeyChanges) -> DbResult<ApiKey> {
    let data = UpdateApiKeyData {
        label: changes.label,
        is_active: changes.is_active,
        expires_at: changes.expires_at,
        total_quota: changes.total_quota,
        rate_limit: changes.rate_limit,
        model_whitelist: changes.model_whitelist.as_deref().map(encode_whitelist).transpose()?,
    };
    let updated = app_state
        .db
        .run(move |conn| ApiKey::update(conn, api_key_id, &data))
        .await?;
    app_state.invalidate_api_key(&updated.key_hash, updated.id).await?;
    info!("api key {} updated", updated.id);
    Ok(updated)
}

pub async fn delete_api_key(app_state: &AppState, api_key_id: i64) -> DbResult<ApiKey> {
    let deleted = app_state.db.run(move |conn| ApiKey::delete(conn, api_key_id)).await?;
    app_state.invalidate_api_key(&deleted.key_hash, deleted.id).await?;
    info!("api key {} deleted", deleted.id);
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::account::Account;
    use crate::database::test_support::test_db;
    use crate::service::app_state::test_support::test_state;

    #[test]
    fn test_generated_secret_shape() {
        let secret = generate_secret();
        assert!(secret.starts_with("sk-"));
        assert_eq!(secret.len(), 3 + 48);
        assert!(secret[3..].chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(secret, generate_secret());
    }

    #[tokio::test]
    async fn test_create_reveal_and_authenticate() {
        let t = test_db();
        let state = test_state(&t).await;
        let account = Account::create(&mut state.db.get_connection().unwrap(), "acct", None).unwrap();

        let issued = create_api_key(
            &state,
            NewApiKey {
                account_id: account.id,
                label: "ci".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let stored = ApiKey::get_by_id(&mut state.db.get_connection().unwrap(), issued.id).unwrap();
        assert_eq!(stored.key_hash, hash_api_key(&issued.secret));
        assert_ne!(stored.encrypted_key.as_deref(), Some(issued.secret.as_str()));

        assert_eq!(reveal_api_key(&state, issued.id).await.unwrap(), issued.secret);
        assert_eq!(state.authenticate(&issued.secret).await.unwrap().id, issued.id);
    }

    #[tokio::test]
    async fn test_edits_take_effect_immediately() {
        let t = test_db();
        let state = test_state(&t).await;
        let account = Account::create(&mut state.db.get_connection().unwrap(), "acct", None).unwrap();
        let issued = create_api_key(
            &state,
            NewApiKey {
                account_id: account.id,
                label: "ci".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // Warm both caches.
        state.authenticate(&issued.secret).await.unwrap();
        assert!(state.model_whitelist(issued.id).await.unwrap().is_empty());

        update_api_key(
            &state,
            issued.id,
            ApiKeyChanges {
                model_whitelist: Some(vec!["gpt-4o".to_string()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(*state.model_whitelist(issued.id).await.unwrap(), vec!["gpt-4o".to_string()]);

        update_api_key(
            &state,
            issued.id,
            ApiKeyChanges {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(state.authenticate(&issued.secret).await.is_err());

        delete_api_key(&state, issued.id).await.unwrap();
        assert!(state.authenticate(&issued.secret).await.is_err());
        assert!(matches!(
            delete_api_key(&state, issued.id).await,
            Err(BaseError::NotFound(_))
        ));
    }
}
