//! Embedded-sqlite durable storage: schema/migrations, the batching writer,
//! startup recovery, and the maintenance loop.

pub mod durable;
pub mod maintenance;
pub mod recovery;
pub mod schema;
pub mod writer;

pub use durable::{DurableStore, DurableStoreConfig};
