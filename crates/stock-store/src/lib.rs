pub mod error;
pub mod memory;
pub mod postgres;
pub mod schema;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryProductStore;
pub use postgres::PgProductStore;
pub use store::ProductStore;
