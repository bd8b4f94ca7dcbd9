pub mod blob;
pub mod entry;
pub mod schema;
pub mod store;
pub mod transaction;

pub use blob::{Blob, NewBlob};
pub use entry::{Entry, EntryPatch, NewEntry};
pub use store::MetadataStore;
pub use transaction::{TransactionEventPayload, TxOptions};
