use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One accepted listing price as stored in the `products` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct ProductRecord {
    pub id: i64,
    pub product: String,
    pub price: f64,
    pub url: Option<String>,
    pub title: Option<String>,
    pub extracted_at: NaiveDateTime,
}

/// A `(timestamp, price)` point of a product's price history.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct PricePoint {
    pub extracted_at: NaiveDateTime,
    pub price: f64,
}
