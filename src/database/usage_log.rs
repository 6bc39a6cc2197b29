use super::{DbConnection, DbResult};
use crate::error::BaseError;
use crate::schema::enum_def::UsageStatus;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable, Debug)]
    #[diesel(table_name = usage_log)]
    pub struct UsageLog {
        /// The gateway request id. Doubles as the idempotency key.
        pub id: i64,
        pub account_id: i64,
        pub api_key_id: i64,
        pub model_name: String,
        pub channel_id: Option<i64>,
        pub prompt_tokens: i64,
        pub completion_tokens: i64,
        pub total_tokens: i64,
        pub cost: i64,
        pub revenue: i64,
        pub duration_ms: i64,
        pub status: UsageStatus,
        pub error_message: Option<String>,
        pub client_ip: Option<String>,
        pub is_stream: bool,
        pub created_at: i64,
    }
}

impl UsageLog {
    /// Inserts the record unless one already exists for the same request id.
    /// Returns `false` for the duplicate case.
    pub fn insert_once(conn: &mut DbConnection, log: &UsageLog) -> DbResult<bool> {
        db_execute!(conn, {
            let inserted = diesel::insert_into(usage_log::table)
                .values(UsageLogDb::to_db(log))
                .on_conflict_do_nothing()
                .execute(conn)
                .map_err(|e| BaseError::DatabaseFatal(Some(format!("Failed to write usage log: {}", e))))?;
            Ok(inserted == 1)
        })
    }

    pub fn get(conn: &mut DbConnection, id_value: i64) -> DbResult<Option<UsageLog>> {
        db_execute!(conn, {
            let row = usage_log::table
                .find(id_value)
                .select(UsageLogDb::as_select())
                .first::<UsageLogDb>(conn)
                .optional()?;
            Ok(row.map(UsageLogDb::from_db))
        })
    }

    pub fn list_by_api_key(conn: &mut DbConnection, api_key_id_value: i64) -> DbResult<Vec<UsageLog>> {
        db_execute!(conn, {
            let rows = usage_log::table
                .filter(usage_log::api_key_id.eq(api_key_id_value))
                .order(usage_log::created_at.asc())
                .select(UsageLogDb::as_select())
                .load::<UsageLogDb>(conn)?;
            Ok(rows.into_iter().map(UsageLogDb::from_db).collect())
        })
    }
}
