pub mod listing;
pub mod product_record;
pub mod selector_set;

// Re-exports for convenience
pub use listing::*;
pub use product_record::*;
pub use selector_set::*;
