use super::{DbConnection, DbResult};
use crate::error::BaseError;
use crate::{db_execute, db_object};

db_object! {
    // Prices are micro-units of currency per one million tokens.
    #[derive(Queryable, Selectable, Identifiable, Insertable, Debug)]
    #[diesel(table_name = model)]
    pub struct Model {
        pub id: i64,
        pub model_name: String,
        pub display_name: String,
        pub category: String,
        pub input_cost: i64,
        pub output_cost: i64,
        pub input_price: i64,
        pub output_price: i64,
        pub max_context: i32,
        pub is_active: bool,
        pub created_at: i64,
        pub updated_at: i64,
    }
}

impl Model {
    pub fn insert(conn: &mut DbConnection, new_model: &Model) -> DbResult<Model> {
        db_execute!(conn, {
            diesel::insert_into(model::table)
                .values(ModelDb::to_db(new_model))
                .execute(conn)
                .map_err(|e| BaseError::DatabaseFatal(Some(format!("Failed to create model: {}", e))))?;
        });
        Ok(new_model.clone())
    }

    pub fn get_active_by_name(conn: &mut DbConnection, name: &str) -> DbResult<Option<Model>> {
        db_execute!(conn, {
            let row = model::table
                .filter(model::model_name.eq(name))
                .filter(model::is_active.eq(true))
                .select(ModelDb::as_select())
                .first::<ModelDb>(conn)
                .optional()?;
            Ok(row.map(ModelDb::from_db))
        })
    }

    pub fn list_active(conn: &mut DbConnection) -> DbResult<Vec<Model>> {
        db_execute!(conn, {
            let rows = model::table
                .filter(model::is_active.eq(true))
                .order(model::model_name.asc())
                .select(ModelDb::as_select())
                .load::<ModelDb>(conn)?;
            Ok(rows.into_iter().map(ModelDb::from_db).collect())
        })
    }
}
