use diesel::{
    connection::SimpleConnection,
    r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection},
    Connection, PgConnection, SqliteConnection,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::fs::File;
use std::path::Path;

use cyder_tools::log::{error, info};

use crate::error::BaseError;

pub mod account;
pub mod api_key;
pub mod channel;
pub mod model;
pub mod referral;
pub mod transaction;
pub mod usage_log;

pub enum DbType {
    Postgres,
    Sqlite,
}

#[derive(Clone)]
pub enum DbPool {
    Postgres(Pool<ConnectionManager<PgConnection>>),
    Sqlite(Pool<ConnectionManager<SqliteConnection>>),
}

pub enum DbConnection {
    Postgres(PooledConnection<ConnectionManager<PgConnection>>),
    Sqlite(PooledConnection<ConnectionManager<SqliteConnection>>),
}

pub type DbResult<T> = Result<T, BaseError>;

fn parse_db_type(db_url: &str) -> DbType {
    if db_url.starts_with("postgres") {
        DbType::Postgres
    } else {
        DbType::Sqlite
    }
}

impl DbConnection {
    /// Runs `f` inside a write transaction. SQLite takes the write lock up
    /// front (`BEGIN IMMEDIATE`) so concurrent settlements queue on
    /// `busy_timeout` instead of failing on lock upgrade.
    pub fn transaction<T, F>(&mut self, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut DbConnection) -> DbResult<T>,
    {
        let begin = match self {
            DbConnection::Postgres(_) => "BEGIN",
            DbConnection::Sqlite(_) => "BEGIN IMMEDIATE",
        };
        self.batch_execute(begin)?;
        match f(self) {
            Ok(value) => {
                self.batch_execute("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.batch_execute("ROLLBACK") {
                    error!("rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    fn batch_execute(&mut self, sql: &str) -> DbResult<()> {
        match self {
            DbConnection::Postgres(conn) => conn.batch_execute(sql)?,
            DbConnection::Sqlite(conn) => conn.batch_execute(sql)?,
        }
        Ok(())
    }
}

#[derive(Debug)]
struct SqlitePragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute("PRAGMA busy_timeout = 10000; PRAGMA journal_mode = WAL;")
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Handle to the relational store. Cheap to clone; every clone shares the pool.
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Opens the pool for `db_url` and applies pending migrations.
    pub fn connect(db_url: &str, pool_size: u32) -> DbResult<Self> {
        let pool = match parse_db_type(db_url) {
            DbType::Postgres => DbPool::Postgres(init_pg_pool(db_url, pool_size)?),
            DbType::Sqlite => DbPool::Sqlite(init_sqlite_pool(db_url, pool_size)?),
        };
        Ok(Self { pool })
    }

    pub fn get_connection(&self) -> DbResult<DbConnection> {
        let conn = match &self.pool {
            DbPool::Postgres(pool) => DbConnection::Postgres(pool.get().map_err(pool_error)?),
            DbPool::Sqlite(pool) => DbConnection::Sqlite(pool.get().map_err(pool_error)?),
        };
        Ok(conn)
    }

    /// Runs blocking diesel work on the blocking thread pool.
    pub async fn run<T, F>(&self, f: F) -> DbResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut DbConnection) -> DbResult<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.get_connection()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| BaseError::InternalServerError(Some(format!("database task failed: {}", e))))?
    }
}

fn pool_error(e: impl std::fmt::Display) -> BaseError {
    BaseError::DatabaseFatal(Some(format!("failed to get connection from pool: {}", e)))
}

fn migration_error(e: impl std::fmt::Display) -> BaseError {
    BaseError::DatabaseFatal(Some(format!("failed to run migrations: {}", e)))
}

#[path = "../schema/sqlite.rs"]
pub mod _sqlite_schema;

#[path = "../schema/postgres.rs"]
pub mod _postgres_schema;

#[macro_export]
macro_rules! db_object {
    (
        $(
            $( #[$attr:meta] )*
            pub struct $name:ident {
                $( $( #[$field_attr:meta] )* $vis:vis $field:ident : $typ:ty ),+
                $(,)?
            }
        )+
    ) => {
        $(
            #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
            pub struct $name { $( $vis $field : $typ, )+ }
        )+

        pub mod _postgres_model {
            $( $crate::db_object! { @expand postgres |  $( #[$attr] )* | $name |  $( $( #[$field_attr] )* $field : $typ ),+ } )+
        }
        pub mod _sqlite_model {
            $( $crate::db_object! { @expand sqlite |  $( #[$attr] )* | $name |  $( $( #[$field_attr] )* $field : $typ ),+ } )+
        }
    };
    ( @expand $db_type:ident | $( #[$attr:meta] )* | $name:ident | $( $( #[$field_attr:meta] )* $vis:vis $field:ident : $typ:ty),+) => {
        paste::paste! {
            #[allow(unused_imports)] use super::*;
            #[allow(unused_imports)] use $crate::database::[<_ $db_type _schema>]::*;
            #[allow(unused_imports)] use diesel::prelude::*;

            $( #[$attr] )*
            pub struct [<$name Db>] { $(
                $( #[$field_attr] )* $vis $field : $typ,
            )+ }

            impl [<$name Db>] {
                #[inline(always)]
                #[allow(dead_code)]
                pub fn from_db(self) -> super::$name {
                    super::$name { $( $field: self.$field, )+ }
                }

                #[inline(always)]
                #[allow(dead_code)]
                pub fn to_db(x: &super::$name) -> Self {
                    Self {
                        $( $field: x.$field.clone(), )+
                    }
                }
            }
        }
    }
}

#[macro_export]
macro_rules! db_execute {
    ($conn:ident, $block:block) => {
        match $conn {
            $crate::database::DbConnection::Postgres($conn) => {
                #[allow(unused_imports)]
                use $crate::database::_postgres_schema::*;
                #[allow(unused_imports)]
                use _postgres_model::*;
                #[allow(unused_imports)]
                use diesel::prelude::*;

                $block
            }
            $crate::database::DbConnection::Sqlite($conn) => {
                #[allow(unused_imports)]
                use $crate::database::_sqlite_schema::*;
                #[allow(unused_imports)]
                use _sqlite_model::*;
                #[allow(unused_imports)]
                use diesel::prelude::*;

                $block
            }
        }
    };
}

const SQLITE_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/sqlite");
const POSTGRES_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/postgres");

fn init_sqlite_pool(
    db_url: &str,
    pool_size: u32,
) -> DbResult<Pool<ConnectionManager<SqliteConnection>>> {
    let db_path = Path::new(db_url);
    if !db_path.exists() {
        if let Some(parent_dir) = db_path.parent() {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                std::fs::create_dir_all(parent_dir).map_err(|e| {
                    BaseError::DatabaseFatal(Some(format!("failed to create database directory: {}", e)))
                })?;
            }
        }
        File::create(db_path).map_err(|e| {
            BaseError::DatabaseFatal(Some(format!("failed to create database file: {}", e)))
        })?;
    }

    let mut connection = SqliteConnection::establish(db_url).map_err(|e| {
        BaseError::DatabaseFatal(Some(format!("failed to establish migration connection: {}", e)))
    })?;
    connection
        .run_pending_migrations(SQLITE_MIGRATIONS)
        .map_err(migration_error)?;
    info!("sqlite migrations applied: {}", db_url);

    let manager = ConnectionManager::<SqliteConnection>::new(db_url);
    Pool::builder()
        .test_on_check_out(true)
        .max_size(pool_size.max(1))
        .connection_customizer(Box::new(SqlitePragmas))
        .build(manager)
        .map_err(pool_error)
}

fn init_pg_pool(db_url: &str, pool_size: u32) -> DbResult<Pool<ConnectionManager<PgConnection>>> {
    let mut connection = PgConnection::establish(db_url).map_err(|e| {
        BaseError::DatabaseFatal(Some(format!("failed to establish migration connection: {}", e)))
    })?;
    connection
        .run_pending_migrations(POSTGRES_MIGRATIONS)
        .map_err(migration_error)?;
    info!("postgres migrations applied");

    let manager = ConnectionManager::<PgConnection>::new(db_url);
    Pool::builder()
        .max_size(pool_size.max(1))
        .build(manager)
        .map_err(pool_error)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Database;
    use tempfile::TempDir;

    /// A migrated SQLite database living in a temporary directory.
    pub struct TestDb {
        pub db: Database,
        _dir: TempDir,
    }

    pub fn test_db() -> TestDb {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.db");
        let db = Database::connect(path.to_str().unwrap(), 8).unwrap();
        TestDb { db, _dir: dir }
    }
}
