mod entities;
mod migrate;
mod record;
mod store;

pub use record::PersistentRecord;
pub use store::{RecordStore, RecordStoreConfig, StoreError, StoreResult};
