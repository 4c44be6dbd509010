//! In-memory ad catalog with atomic snapshot reloads.

pub mod file;
pub mod store;

pub use file::CatalogFile;
pub use store::{AdStore, Catalog};
