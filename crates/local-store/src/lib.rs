pub mod error;
pub mod expiry;
pub mod store;

pub use error::{Result, StoreError};
pub use expiry::{ExpirationScheduler, ExpiryTarget};
pub use store::{ContentStore, Hashed, MetaEvent, RemoveOptions, SaveOptions};
