use chrono::Utc;

use super::{DbConnection, DbResult};
use crate::error::BaseError;
use crate::schema::enum_def::TransactionType;
use crate::utils::ID_GENERATOR;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable, Debug)]
    #[diesel(table_name = account_transaction)]
    pub struct AccountTransaction {
        pub id: i64,
        pub account_id: i64,
        pub transaction_type: TransactionType,
        /// Signed: debits are negative.
        pub amount: i64,
        pub balance_after: i64,
        pub reference_id: Option<i64>,
        pub description: Option<String>,
        pub created_at: i64,
    }
}

impl AccountTransaction {
    pub fn record(
        conn: &mut DbConnection,
        account_id_value: i64,
        kind: TransactionType,
        amount_value: i64,
        balance_after_value: i64,
        reference: Option<i64>,
        description_value: Option<String>,
    ) -> DbResult<AccountTransaction> {
        let entry = AccountTransaction {
            id: ID_GENERATOR.generate_id(),
            account_id: account_id_value,
            transaction_type: kind,
            amount: amount_value,
            balance_after: balance_after_value,
            reference_id: reference,
            description: description_value,
            created_at: Utc::now().timestamp_millis(),
        };
        db_execute!(conn, {
            diesel::insert_into(account_transaction::table)
                .values(AccountTransactionDb::to_db(&entry))
                .execute(conn)
                .map_err(|e| BaseError::DatabaseFatal(Some(format!("Failed to write transaction: {}", e))))?;
        });
        Ok(entry)
    }

    /// Ledger for one account in insertion order.
    pub fn list_by_account(conn: &mut DbConnection, account_id_value: i64) -> DbResult<Vec<AccountTransaction>> {
        db_execute!(conn, {
            let rows = account_transaction::table
                .filter(account_transaction::account_id.eq(account_id_value))
                .order((account_transaction::created_at.asc(), account_transaction::id.asc()))
                .select(AccountTransactionDb::as_select())
                .load::<AccountTransactionDb>(conn)?;
            Ok(rows.into_iter().map(AccountTransactionDb::from_db).collect())
        })
    }
}
