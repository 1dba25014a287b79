pub mod kv;
pub mod models;

mod error;

pub use error::StoreError;
pub use kv::KvStore;
pub use models::UserRecord;
