pub mod db;
pub mod error;
pub mod store;
pub mod tree;
pub mod types;

pub use error::{Result, StoreError};
pub use store::Store;
