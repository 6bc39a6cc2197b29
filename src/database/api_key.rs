use chrono::Utc;
use serde::Deserialize;

use super::{DbConnection, DbResult};
use crate::error::BaseError;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable, Debug)]
    #[diesel(table_name = api_key)]
    pub struct ApiKey {
        pub id: i64,
        pub account_id: i64,
        pub key_hash: String,
        pub encrypted_key: Option<String>,
        pub label: String,
        pub is_active: bool,
        pub expires_at: Option<i64>,
        pub total_quota: Option<i64>,
        pub used_quota: i64,
        pub rate_limit: Option<i32>,
        /// JSON array of model names; empty means unrestricted.
        pub model_whitelist: String,
        pub created_at: i64,
        pub updated_at: i64,
    }

    // Option<Option<T>> lets a caller clear a nullable column.
    #[derive(AsChangeset, Deserialize, Debug, Default)]
    #[diesel(table_name = api_key)]
    pub struct UpdateApiKeyData {
        #[diesel(column_name = label)]
        pub label: Option<String>,
        #[diesel(column_name = is_active)]
        pub is_active: Option<bool>,
        #[diesel(column_name = expires_at)]
        pub expires_at: Option<Option<i64>>,
        #[diesel(column_name = total_quota)]
        pub total_quota: Option<Option<i64>>,
        #[diesel(column_name = rate_limit)]
        pub rate_limit: Option<Option<i32>>,
        #[diesel(column_name = model_whitelist)]
        pub model_whitelist: Option<String>,
    }
}

impl ApiKey {
    pub fn whitelist(&self) -> Vec<String> {
        parse_whitelist(&self.model_whitelist)
    }

    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now_millis)
    }

    pub fn insert(conn: &mut DbConnection, new_key: &ApiKey) -> DbResult<ApiKey> {
        db_execute!(conn, {
            diesel::insert_into(api_key::table)
                .values(ApiKeyDb::to_db(new_key))
                .execute(conn)
                .map_err(BaseError::from)?;
        });
        Ok(new_key.clone())
    }

    pub fn get_by_hash(conn: &mut DbConnection, hash: &str) -> DbResult<Option<ApiKey>> {
        db_execute!(conn, {
            let row = api_key::table
                .filter(api_key::key_hash.eq(hash))
                .select(ApiKeyDb::as_select())
                .first::<ApiKeyDb>(conn)
                .optional()?;
            Ok(row.map(ApiKeyDb::from_db))
        })
    }

    pub fn get_by_id(conn: &mut DbConnection, id_value: i64) -> DbResult<ApiKey> {
        db_execute!(conn, {
            let row = api_key::table
                .find(id_value)
                .select(ApiKeyDb::as_select())
                .first::<ApiKeyDb>(conn)
                .optional()?
                .ok_or_else(|| BaseError::NotFound(Some(format!("api key {} not found", id_value))))?;
            Ok(row.from_db())
        })
    }

    pub fn update(conn: &mut DbConnection, id_value: i64, data: &UpdateApiKeyData) -> DbResult<ApiKey> {
        let now = Utc::now().timestamp_millis();
        db_execute!(conn, {
            let row = diesel::update(api_key::table.find(id_value))
                .set((UpdateApiKeyDataDb::to_db(data), api_key::updated_at.eq(now)))
                .returning(ApiKeyDb::as_returning())
                .get_result::<ApiKeyDb>(conn)
                .optional()?
                .ok_or_else(|| BaseError::NotFound(Some(format!("api key {} not found", id_value))))?;
            Ok(row.from_db())
        })
    }

    pub fn delete(conn: &mut DbConnection, id_value: i64) -> DbResult<ApiKey> {
        db_execute!(conn, {
            let row = diesel::delete(api_key::table.find(id_value))
                .returning(ApiKeyDb::as_returning())
                .get_result::<ApiKeyDb>(conn)
                .optional()?
                .ok_or_else(|| BaseError::NotFound(Some(format!("api key {} not found", id_value))))?;
            Ok(row.from_db())
        })
    }

    /// Adds `amount` to `used_quota` only while the result stays within
    /// `total_quota`. Returns the new used amount, or `None` if the guard failed.
    /// Keys without a quota never match.
    pub fn consume_quota(conn: &mut DbConnection, id_value: i64, amount: i64) -> DbResult<Option<i64>> {
        let now = Utc::now().timestamp_millis();
        db_execute!(conn, {
            diesel::update(
                api_key::table
                    .filter(api_key::id.eq(id_value))
                    .filter(api_key::total_quota.ge((api_key::used_quota + amount).nullable())),
            )
            .set((
                api_key::used_quota.eq(api_key::used_quota + amount),
                api_key::updated_at.eq(now),
            ))
            .returning(api_key::used_quota)
            .get_result::<i64>(conn)
            .optional()
            .map_err(BaseError::from)
        })
    }
}

pub fn parse_whitelist(raw: &str) -> Vec<String> {
    serde_json::from_str::<Vec<String>>(raw).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::account::Account;
    use crate::database::test_support::test_db;

    fn sample_key(account_id: i64, total_quota: Option<i64>) -> ApiKey {
        ApiKey {
            id: 42,
            account_id,
            key_hash: "abc123".to_string(),
            label: "ci".to_string(),
            is_active: true,
            total_quota,
            model_whitelist: "[]".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_consume_quota_respects_ceiling() {
        let t = test_db();
        let mut conn = t.db.get_connection().unwrap();
        let acc = Account::create(&mut conn, "quota", None).unwrap();
        ApiKey::insert(&mut conn, &sample_key(acc.id, Some(100))).unwrap();

        assert_eq!(ApiKey::consume_quota(&mut conn, 42, 60).unwrap(), Some(60));
        assert_eq!(ApiKey::consume_quota(&mut conn, 42, 41).unwrap(), None);
        assert_eq!(ApiKey::consume_quota(&mut conn, 42, 40).unwrap(), Some(100));
        assert_eq!(ApiKey::get_by_id(&mut conn, 42).unwrap().used_quota, 100);
    }

    #[test]
    fn test_unlimited_key_never_consumes_quota() {
        let t = test_db();
        let mut conn = t.db.get_connection().unwrap();
        let acc = Account::create(&mut conn, "free", None).unwrap();
        ApiKey::insert(&mut conn, &sample_key(acc.id, None)).unwrap();

        assert_eq!(ApiKey::consume_quota(&mut conn, 42, 1).unwrap(), None);
    }

    #[test]
    fn test_update_clears_nullable_fields() {
        let t = test_db();
        let mut conn = t.db.get_connection().unwrap();
        let acc = Account::create(&mut conn, "edit", None).unwrap();
        ApiKey::insert(&mut conn, &sample_key(acc.id, Some(5))).unwrap();

        let updated = ApiKey::update(
            &mut conn,
            42,
            &UpdateApiKeyData {
                total_quota: Some(None),
                model_whitelist: Some(r#"["gpt-4o"]"#.to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(updated.total_quota, None);
        assert_eq!(updated.whitelist(), vec!["gpt-4o".to_string()]);
        assert!(ApiKey::get_by_hash(&mut conn, "abc123").unwrap().is_some());
    }
}
