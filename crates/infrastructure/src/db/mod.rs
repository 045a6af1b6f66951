//! Database utilities and repositories (Core DB Layer)

use sqlx::{Pool, Postgres};

pub mod storage;

pub use storage::PgStorage;

pub type DbPool = Pool<Postgres>;

pub struct Db;

impl Db {
    pub async fn create_pool(database_url: &str, max_size: u32) -> Result<DbPool, sqlx::Error> {
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_size)
            .connect(database_url)
            .await
    }
}
