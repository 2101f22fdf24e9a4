use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use stock_core::Product;

use crate::error::StoreError;
use crate::store::ProductStore;

/// In-process store for tests and database-less local runs.
#[derive(Default)]
pub struct MemoryProductStore {
    products: RwLock<BTreeMap<String, Product>>,
}

impl MemoryProductStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_products(products: impl IntoIterator<Item = Product>) -> Self {
        let store = Self::new();
        for product in products {
            store.insert(product);
        }
        store
    }

    pub fn insert(&self, product: Product) {
        self.products.write().insert(product.ean.clone(), product);
    }
}

#[async_trait]
impl ProductStore for MemoryProductStore {
    async fn find_all(&self) -> Result<Vec<Product>, StoreError> {
        Ok(self.products.read().values().cloned().collect())
    }

    async fn find_by_ean(&self, ean: &str) -> Result<Option<Product>, StoreError> {
        Ok(self.products.read().get(ean).cloned())
    }

    async fn apply_quantity_delta(&self, ean: &str, delta: i64) -> Result<Product, StoreError> {
        let mut products = self.products.write();
        let product = products
            .get_mut(ean)
            .ok_or_else(|| StoreError::NotFound(format!("product {ean}")))?;
        product.quantity = product
            .quantity
            .checked_add(delta)
            .ok_or_else(|| StoreError::InvalidInput(format!("quantity delta {delta} out of range")))?;
        Ok(product.clone())
    }
}
