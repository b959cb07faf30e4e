use diesel::{
    connection::SimpleConnection,
    r2d2::{ConnectionManager, CustomizeConnection, Error as R2d2Error, Pool, PooledConnection},
    Connection, PgConnection, SqliteConnection,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::fs::File;
use std::path::Path;

use crate::service::store::StoreError;

pub mod channel;
pub mod group;
pub mod log;
pub mod price;
pub mod token;
pub mod user;

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

fn parse_db_type(db_url: &str) -> DbType {
    if db_url.starts_with("postgres") {
        DbType::Postgres
    } else {
        DbType::Sqlite
    }
}

impl DbPool {
    /// Opens the pool and runs pending migrations.
    pub fn establish(db_url: &str) -> DbResult<Self> {
        match parse_db_type(db_url) {
            DbType::Postgres => Ok(DbPool::Postgres(init_pg_pool(db_url)?)),
            DbType::Sqlite => Ok(DbPool::Sqlite(init_sqlite_pool(db_url)?)),
        }
    }

    pub fn get_connection(&self) -> DbResult<DbConnection> {
        match self {
            DbPool::Postgres(pool) => pool
                .get()
                .map(DbConnection::Postgres)
                .map_err(|e| StoreError::Pool(e.to_string())),
            DbPool::Sqlite(pool) => pool
                .get()
                .map(DbConnection::Sqlite)
                .map_err(|e| StoreError::Pool(e.to_string())),
        }
    }
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
            #[allow(unused_imports)] use crate::database::[<_ $db_type _schema>]::*;
            #[allow(unused_imports)] use diesel::prelude::*;

            $( #[$attr] )*
            pub struct [<$name Db>] { $(
                $( #[$field_attr] )* $vis $field : $typ,
            )+ }

            impl [<$name Db>] {
                #[inline(always)]
                pub fn from_db(self) -> super::$name {
                    super::$name { $( $field: self.$field, )+ }
                }

                #[inline(always)]
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
                use $crate::database::_postgres_schema::*;
                #[allow(unused_imports)]
                use _postgres_model::*;
                #[allow(unused_imports)]
                use diesel::prelude::*;

                $block
            }
            $crate::database::DbConnection::Sqlite($conn) => {
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

// Concurrent writers wait on the sqlite lock instead of failing with SQLITE_BUSY.
#[derive(Debug)]
struct SqliteBusyTimeout;

impl CustomizeConnection<SqliteConnection, R2d2Error> for SqliteBusyTimeout {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), R2d2Error> {
        conn.batch_execute("PRAGMA busy_timeout = 5000;")
            .map_err(R2d2Error::QueryError)
    }
}

const SQLITE_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/sqlite");
const POSTGRES_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/postgres");

fn init_sqlite_pool(db_url: &str) -> DbResult<Pool<ConnectionManager<SqliteConnection>>> {
    let db_path = Path::new(db_url);
    if !db_path.exists() {
        if let Some(parent_dir) = db_path.parent() {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                std::fs::create_dir_all(parent_dir)
                    .map_err(|e| StoreError::Database(format!("failed to create database directory: {}", e)))?;
            }
        }
        File::create(db_path)
            .map_err(|e| StoreError::Database(format!("failed to create database file: {}", e)))?;
    }

    let mut connection = SqliteConnection::establish(db_url)
        .map_err(|e| StoreError::Database(format!("failed to establish migration connection: {}", e)))?;
    connection
        .batch_execute("PRAGMA journal_mode = WAL;")
        .map_err(|e| StoreError::Database(format!("failed to enable WAL: {}", e)))?;
    connection
        .run_pending_migrations(SQLITE_MIGRATIONS)
        .map_err(|e| StoreError::Database(format!("failed to run migrations: {}", e)))?;

    let manager = ConnectionManager::<SqliteConnection>::new(db_url);
    Pool::builder()
        .test_on_check_out(true)
        .max_size(5)
        .connection_customizer(Box::new(SqliteBusyTimeout))
        .build(manager)
        .map_err(|e| StoreError::Pool(e.to_string()))
}

fn init_pg_pool(db_url: &str) -> DbResult<Pool<ConnectionManager<PgConnection>>> {
    let mut connection = PgConnection::establish(db_url)
        .map_err(|e| StoreError::Database(format!("failed to establish migration connection: {}", e)))?;
    connection
        .run_pending_migrations(POSTGRES_MIGRATIONS)
        .map_err(|e| StoreError::Database(format!("failed to run migrations: {}", e)))?;

    let manager = ConnectionManager::<PgConnection>::new(db_url);
    Pool::builder()
        .max_size(10)
        .build(manager)
        .map_err(|e| StoreError::Pool(e.to_string()))
}

pub type DbResult<T> = Result<T, StoreError>;

/// Maps a diesel error into the store taxonomy with some context.
pub(crate) fn db_error(context: impl std::fmt::Display, e: diesel::result::Error) -> StoreError {
    match e {
        diesel::result::Error::NotFound => StoreError::NotFound(context.to_string()),
        diesel::result::Error::DatabaseError(diesel::result::DatabaseErrorKind::UniqueViolation, info) => {
            StoreError::Conflict(format!("{}: {}", context, info.message()))
        }
        other => StoreError::Database(format!("{}: {}", context, other)),
    }
}
