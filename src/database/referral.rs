use chrono::Utc;

use super::{DbConnection, DbResult};
use crate::error::BaseError;
use crate::{db_execute, db_object};

pub const REFERRAL_COMMISSION_BPS: &str = "referral_commission_bps";

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable, Debug)]
    #[diesel(table_name = referral_reward)]
    pub struct ReferralReward {
        pub id: i64,
        pub referrer_id: i64,
        pub referee_id: i64,
        pub source_transaction_id: i64,
        pub amount: i64,
        pub rate_bps: i32,
        pub created_at: i64,
    }

    #[derive(Queryable, Selectable, Identifiable, Insertable, Debug)]
    #[diesel(table_name = system_setting, primary_key(key))]
    pub struct SystemSetting {
        pub key: String,
        pub value: String,
        pub updated_at: i64,
    }
}

impl ReferralReward {
    pub fn insert(conn: &mut DbConnection, reward: &ReferralReward) -> DbResult<()> {
        db_execute!(conn, {
            diesel::insert_into(referral_reward::table)
                .values(ReferralRewardDb::to_db(reward))
                .execute(conn)
                .map_err(BaseError::from)?;
        });
        Ok(())
    }

    pub fn list_by_referrer(conn: &mut DbConnection, referrer: i64) -> DbResult<Vec<ReferralReward>> {
        db_execute!(conn, {
            let rows = referral_reward::table
                .filter(referral_reward::referrer_id.eq(referrer))
                .select(ReferralRewardDb::as_select())
                .load::<ReferralRewardDb>(conn)?;
            Ok(rows.into_iter().map(ReferralRewardDb::from_db).collect())
        })
    }
}

impl SystemSetting {
    pub fn get(conn: &mut DbConnection, key_value: &str) -> DbResult<Option<String>> {
        db_execute!(conn, {
            system_setting::table
                .find(key_value)
                .select(system_setting::value)
                .first::<String>(conn)
                .optional()
                .map_err(BaseError::from)
        })
    }

    pub fn set(conn: &mut DbConnection, key_value: &str, value_value: &str) -> DbResult<()> {
        let row = SystemSetting {
            key: key_value.to_string(),
            value: value_value.to_string(),
            updated_at: Utc::now().timestamp_millis(),
        };
        db_execute!(conn, {
            diesel::insert_into(system_setting::table)
                .values(SystemSettingDb::to_db(&row))
                .on_conflict(system_setting::key)
                .do_update()
                .set((
                    system_setting::value.eq(&row.value),
                    system_setting::updated_at.eq(row.updated_at),
                ))
                .execute(conn)
                .map_err(BaseError::from)?;
        });
        Ok(())
    }

    /// Current referral commission in basis points; 0 when unset or malformed.
    pub fn commission_rate_bps(conn: &mut DbConnection) -> DbResult<i64> {
        let raw = Self::get(conn, REFERRAL_COMMISSION_BPS)?;
        Ok(raw
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|bps| (0..=10_000).contains(bps))
            .unwrap_or(0))
    }
}
