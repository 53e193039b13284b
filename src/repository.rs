use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::models::{PricePoint, ProductRecord};
use crate::utils::error::Result;

/// Destination for accepted listing prices.
#[async_trait]
pub trait ProductRepository: Send + Sync {
    /// Stores one accepted listing and returns its row id.
    async fn insert_product(&self, product: &str, price: f64, url: &str, title: &str) -> Result<i64>;
}

pub struct SqliteProductRepository {
    pool: SqlitePool,
}

impl SqliteProductRepository {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        if let Some(parent) = database_dir(&config.url) {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let repository = Self { pool };
        repository.initialize().await?;
        info!("Database ready at {}", config.url);
        Ok(repository)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS products (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                product TEXT NOT NULL,
                price REAL NOT NULL,
                url TEXT,
                title TEXT,
                extracted_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_products_product ON products(product)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_products_extracted_at ON products(extracted_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Newest first.
    pub async fn products_by_name(&self, product: &str) -> Result<Vec<ProductRecord>> {
        let records = sqlx::query_as::<_, ProductRecord>(
            r#"
            SELECT id, product, price, url, title, extracted_at
            FROM products
            WHERE product = ?
            ORDER BY extracted_at DESC, id DESC
            "#,
        )
        .bind(product)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Oldest first.
    pub async fn price_history(&self, product: &str) -> Result<Vec<PricePoint>> {
        let points = sqlx::query_as::<_, PricePoint>(
            r#"
            SELECT extracted_at, price
            FROM products
            WHERE product = ?
            ORDER BY extracted_at, id
            "#,
        )
        .bind(product)
        .fetch_all(&self.pool)
        .await?;

        Ok(points)
    }

    /// Deletes rows extracted more than `days` days ago.
    pub async fn clear_older_than(&self, days: u32) -> Result<u64> {
        let result = sqlx::query("DELETE FROM products WHERE extracted_at < datetime('now', ?)")
            .bind(format!("-{} days", days))
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected();
        info!("Removed {} records older than {} days", removed, days);
        Ok(removed)
    }
}

/// Directory holding a file-backed SQLite database, if it needs creating.
fn database_dir(url: &str) -> Option<&Path> {
    let path = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next()?;
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    Path::new(path).parent().filter(|dir| !dir.as_os_str().is_empty())
}

#[async_trait]
impl ProductRepository for SqliteProductRepository {
    async fn insert_product(&self, product: &str, price: f64, url: &str, title: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO products (product, price, url, title) VALUES (?, ?, ?, ?)")
            .bind(product)
            .bind(price)
            .bind(url)
            .bind(title)
            .execute(&self.pool)
            .await?;

        let id = result.last_insert_rowid();
        debug!("Stored {} at {} as row {}", product, price, id);
        Ok(id)
    }
}
