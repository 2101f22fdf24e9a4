//! JSON shapes of the product API. Field names follow the existing web client.

use serde::{Deserialize, Serialize};
use stock_bridge::ListenerSnapshot;
use stock_core::{Price, Product, ProductChangeEvent};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductResponse {
    pub ean: String,
    pub nom: String,
    pub quantite: i64,
    pub prix: f64,
}

impl From<Product> for ProductResponse {
    fn from(product: Product) -> Self {
        Self {
            ean: product.ean,
            nom: product.name,
            quantite: product.quantity,
            prix: price_to_f64(product.price),
        }
    }
}

fn price_to_f64(price: Price) -> f64 {
    price.cents() as f64 / 100.0
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ListProductResponse {
    pub produits: Vec<ProductResponse>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateQuantityProduct {
    /// Signed delta added to the stored quantity.
    pub quantity: i64,
}

/// Body of the update response and of every streamed quantity event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantityProductResponse {
    pub ean: String,
    pub total_quantity: i64,
}

impl From<ProductChangeEvent> for QuantityProductResponse {
    fn from(event: ProductChangeEvent) -> Self {
        Self {
            ean: event.ean,
            total_quantity: event.quantity,
        }
    }
}

impl From<&Product> for QuantityProductResponse {
    fn from(product: &Product) -> Self {
        Self {
            ean: product.ean.clone(),
            total_quantity: product.quantity,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub subscribers: usize,
    pub listener: String,
    /// Events handed to the hub since startup.
    pub events_published: u64,
    pub notifications: ListenerSnapshot,
}
