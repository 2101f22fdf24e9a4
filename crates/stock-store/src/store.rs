use async_trait::async_trait;
use stock_core::Product;

use crate::error::StoreError;

/// Product persistence used by the HTTP layer.
///
/// Quantity updates go through the database, whose trigger publishes the
/// change on the notification channel; the store itself never talks to the
/// broadcast hub.
#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Every product, ordered by EAN.
    async fn find_all(&self) -> Result<Vec<Product>, StoreError>;

    /// One product by EAN, `None` when unknown.
    async fn find_by_ean(&self, ean: &str) -> Result<Option<Product>, StoreError>;

    /// Add `delta` (may be negative) to the stored quantity and return the
    /// updated row. Unknown EANs yield [`StoreError::NotFound`].
    async fn apply_quantity_delta(&self, ean: &str, delta: i64) -> Result<Product, StoreError>;
}
