//! `PostgreSQL` product store on a `deadpool-postgres` pool.
//!
//! The pool serves CRUD traffic only. The notification listener opens its
//! own dedicated connection so a long-lived `LISTEN` never pins a pooled
//! client.

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use stock_core::{Price, Product};
use tokio_postgres::{NoTls, Row};
use tracing::{info, instrument};

use crate::error::StoreError;
use crate::schema;
use crate::store::ProductStore;

const SELECT_COLUMNS: &str = "ean, nom, quantite, (prix * 100)::bigint AS prix_cents";

pub struct PgProductStore {
    pool: Pool,
}

impl PgProductStore {
    /// Build the pool. Connectivity is not checked until first use.
    pub fn connect(connection_string: &str, max_pool_size: usize) -> Result<Self, StoreError> {
        let pg_config: tokio_postgres::Config = connection_string
            .parse()
            .map_err(|e| StoreError::InvalidInput(format!("invalid connection string: {e}")))?;

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);

        let pool = Pool::builder(mgr)
            .max_size(max_pool_size)
            .build()
            .map_err(|e| StoreError::Pool(format!("pool creation failed: {e}")))?;

        Ok(Self { pool })
    }

    /// Create the table, notification function and trigger for `channel`.
    pub async fn install_schema(&self, channel: &str) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client.batch_execute(&schema::install_script(channel)).await?;
        info!(channel, "product schema installed");
        Ok(())
    }

    /// Pool handle, for health checks.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

fn product_from_row(row: &Row) -> Result<Product, StoreError> {
    let ean: String = get(row, "ean")?;
    let name: String = get(row, "nom")?;
    let quantity: i32 = get(row, "quantite")?;
    let price_cents: i64 = get(row, "prix_cents")?;
    Ok(Product::new(ean, name, i64::from(quantity), Price::from_cents(price_cents)))
}

fn get<'a, T: tokio_postgres::types::FromSql<'a>>(
    row: &'a Row,
    column: &'static str,
) -> Result<T, StoreError> {
    row.try_get(column).map_err(|e| StoreError::CorruptRow {
        table: "produit",
        column,
        detail: e.to_string(),
    })
}

#[async_trait]
impl ProductStore for PgProductStore {
    #[instrument(skip(self))]
    async fn find_all(&self) -> Result<Vec<Product>, StoreError> {
        let client = self.pool.get().await?;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM produit ORDER BY ean");
        let rows = client.query(sql.as_str(), &[]).await?;
        rows.iter().map(product_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn find_by_ean(&self, ean: &str) -> Result<Option<Product>, StoreError> {
        let client = self.pool.get().await?;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM produit WHERE ean = $1");
        let row = client.query_opt(sql.as_str(), &[&ean]).await?;
        row.as_ref().map(product_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn apply_quantity_delta(&self, ean: &str, delta: i64) -> Result<Product, StoreError> {
        let delta = i32::try_from(delta)
            .map_err(|_| StoreError::InvalidInput(format!("quantity delta {delta} out of range")))?;

        let client = self.pool.get().await?;
        let sql = format!(
            "UPDATE produit SET quantite = quantite + $1 WHERE ean = $2 RETURNING {SELECT_COLUMNS}"
        );
        let row = client.query_opt(sql.as_str(), &[&delta, &ean]).await?;
        match row {
            Some(row) => product_from_row(&row),
            None => Err(StoreError::NotFound(format!("product {ean}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_rejects_garbage_connection_string() {
        let result = PgProductStore::connect("host=localhost port=notaport", 4);
        assert!(matches!(result, Err(StoreError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn connect_is_lazy() {
        let store = PgProductStore::connect("host=127.0.0.1 port=1 user=nobody dbname=none", 2).unwrap();
        assert_eq!(store.pool().status().max_size, 2);
    }
}
