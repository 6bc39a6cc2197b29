use chrono::Utc;

use super::{DbConnection, DbResult};
use crate::error::BaseError;
use crate::utils::ID_GENERATOR;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable, Debug)]
    #[diesel(table_name = account)]
    pub struct Account {
        pub id: i64,
        pub name: String,
        pub balance: i64,
        pub referrer_id: Option<i64>,
        pub created_at: i64,
        pub updated_at: i64,
    }
}

// Balance is only ever changed with single conditional UPDATE statements.
impl Account {
    pub fn create(conn: &mut DbConnection, name: &str, referrer_id: Option<i64>) -> DbResult<Account> {
        let now = Utc::now().timestamp_millis();
        let new_account = Account {
            id: ID_GENERATOR.generate_id(),
            name: name.to_string(),
            balance: 0,
            referrer_id,
            created_at: now,
            updated_at: now,
        };
        db_execute!(conn, {
            diesel::insert_into(account::table)
                .values(AccountDb::to_db(&new_account))
                .execute(conn)
                .map_err(|e| BaseError::DatabaseFatal(Some(format!("Failed to create account: {}", e))))?;
        });
        Ok(new_account)
    }

    pub fn get(conn: &mut DbConnection, id_value: i64) -> DbResult<Account> {
        db_execute!(conn, {
            let row = account::table
                .find(id_value)
                .select(AccountDb::as_select())
                .first::<AccountDb>(conn)
                .optional()?
                .ok_or_else(|| BaseError::NotFound(Some(format!("account {} not found", id_value))))?;
            Ok(row.from_db())
        })
    }

    pub fn balance(conn: &mut DbConnection, id_value: i64) -> DbResult<i64> {
        db_execute!(conn, {
            account::table
                .find(id_value)
                .select(account::balance)
                .first::<i64>(conn)
                .map_err(BaseError::from)
        })
    }

    /// Subtracts `amount` only if the balance covers it. Returns the new balance,
    /// or `None` when the guard rejected the update.
    pub fn debit_if_sufficient(conn: &mut DbConnection, id_value: i64, amount: i64) -> DbResult<Option<i64>> {
        let now = Utc::now().timestamp_millis();
        db_execute!(conn, {
            diesel::update(
                account::table
                    .filter(account::id.eq(id_value))
                    .filter(account::balance.ge(amount)),
            )
            .set((
                account::balance.eq(account::balance - amount),
                account::updated_at.eq(now),
            ))
            .returning(account::balance)
            .get_result::<i64>(conn)
            .optional()
            .map_err(BaseError::from)
        })
    }

    /// Adds `amount` and returns the resulting balance.
    pub fn credit(conn: &mut DbConnection, id_value: i64, amount: i64) -> DbResult<i64> {
        let now = Utc::now().timestamp_millis();
        db_execute!(conn, {
            diesel::update(account::table.filter(account::id.eq(id_value)))
                .set((
                    account::balance.eq(account::balance + amount),
                    account::updated_at.eq(now),
                ))
                .returning(account::balance)
                .get_result::<i64>(conn)
                .optional()?
                .ok_or_else(|| BaseError::NotFound(Some(format!("account {} not found", id_value))))
        })
    }

    /// Applies a signed delta unless it would take the balance below zero.
    pub fn adjust_non_negative(conn: &mut DbConnection, id_value: i64, delta: i64) -> DbResult<Option<i64>> {
        let now = Utc::now().timestamp_millis();
        db_execute!(conn, {
            diesel::update(
                account::table
                    .filter(account::id.eq(id_value))
                    .filter((account::balance + delta).ge(0i64)),
            )
            .set((
                account::balance.eq(account::balance + delta),
                account::updated_at.eq(now),
            ))
            .returning(account::balance)
            .get_result::<i64>(conn)
            .optional()
            .map_err(BaseError::from)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::test_db;

    #[test]
    fn test_guarded_debit() {
        let t = test_db();
        let mut conn = t.db.get_connection().unwrap();
        let acc = Account::create(&mut conn, "alice", None).unwrap();

        assert_eq!(Account::credit(&mut conn, acc.id, 1_000).unwrap(), 1_000);
        assert_eq!(Account::debit_if_sufficient(&mut conn, acc.id, 400).unwrap(), Some(600));
        assert_eq!(Account::debit_if_sufficient(&mut conn, acc.id, 601).unwrap(), None);
        assert_eq!(Account::balance(&mut conn, acc.id).unwrap(), 600);
    }

    #[test]
    fn test_adjust_never_goes_negative() {
        let t = test_db();
        let mut conn = t.db.get_connection().unwrap();
        let acc = Account::create(&mut conn, "bob", None).unwrap();

        assert_eq!(Account::adjust_non_negative(&mut conn, acc.id, 50).unwrap(), Some(50));
        assert_eq!(Account::adjust_non_negative(&mut conn, acc.id, -80).unwrap(), None);
        assert_eq!(Account::adjust_non_negative(&mut conn, acc.id, -50).unwrap(), Some(0));
    }
}
