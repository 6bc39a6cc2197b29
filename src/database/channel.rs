use chrono::Utc;

use super::{DbConnection, DbResult};
use crate::error::BaseError;
use crate::schema::enum_def::ProviderType;
use crate::utils::ID_GENERATOR;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable, Debug)]
    #[diesel(table_name = channel)]
    pub struct Channel {
        pub id: i64,
        pub name: String,
        pub provider_type: ProviderType,
        /// AES-GCM sealed upstream credential; see `utils::crypto`.
        pub encrypted_credential: String,
        pub base_url: Option<String>,
        pub priority: i32,
        pub weight: i32,
        pub is_active: bool,
        pub created_at: i64,
        pub updated_at: i64,
    }

    #[derive(Queryable, Selectable, Identifiable, Insertable, Debug)]
    #[diesel(table_name = channel_model)]
    pub struct ChannelModel {
        pub id: i64,
        pub channel_id: i64,
        pub model_name: String,
        pub upstream_model_name: Option<String>,
    }
}

/// An active channel able to serve one particular model.
#[derive(Debug, Clone)]
pub struct RoutableChannel {
    pub channel: Channel,
    /// Model name sent upstream; defaults to the public model name.
    pub upstream_model: String,
}

impl Channel {
    pub fn insert(conn: &mut DbConnection, new_channel: &Channel) -> DbResult<Channel> {
        db_execute!(conn, {
            diesel::insert_into(channel::table)
                .values(ChannelDb::to_db(new_channel))
                .execute(conn)
                .map_err(|e| BaseError::DatabaseFatal(Some(format!("Failed to create channel: {}", e))))?;
        });
        Ok(new_channel.clone())
    }

    pub fn add_model(
        conn: &mut DbConnection,
        channel_id_value: i64,
        model_name_value: &str,
        upstream_model_name_value: Option<&str>,
    ) -> DbResult<ChannelModel> {
        let row = ChannelModel {
            id: ID_GENERATOR.generate_id(),
            channel_id: channel_id_value,
            model_name: model_name_value.to_string(),
            upstream_model_name: upstream_model_name_value.map(str::to_string),
        };
        db_execute!(conn, {
            diesel::insert_into(channel_model::table)
                .values(ChannelModelDb::to_db(&row))
                .execute(conn)
                .map_err(BaseError::from)?;
        });
        Ok(row)
    }

    pub fn set_active(conn: &mut DbConnection, id_value: i64, active: bool) -> DbResult<()> {
        let now = Utc::now().timestamp_millis();
        db_execute!(conn, {
            let affected = diesel::update(channel::table.find(id_value))
                .set((channel::is_active.eq(active), channel::updated_at.eq(now)))
                .execute(conn)?;
            if affected == 0 {
                return Err(BaseError::NotFound(Some(format!("channel {} not found", id_value))));
            }
            Ok(())
        })
    }

    /// Active channels serving `model`, unordered. Read on every request so that
    /// operator edits take effect on the next selection.
    pub fn list_active_for_model(conn: &mut DbConnection, model: &str) -> DbResult<Vec<RoutableChannel>> {
        db_execute!(conn, {
            let rows = channel_model::table
                .inner_join(channel::table)
                .filter(channel_model::model_name.eq(model))
                .filter(channel::is_active.eq(true))
                .select((ChannelDb::as_select(), channel_model::upstream_model_name))
                .load::<(ChannelDb, Option<String>)>(conn)?;
            Ok(rows
                .into_iter()
                .map(|(row, upstream)| RoutableChannel {
                    channel: row.from_db(),
                    upstream_model: upstream.unwrap_or_else(|| model.to_string()),
                })
                .collect())
        })
    }
}
